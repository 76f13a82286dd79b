//! VGA text-mode framebuffer and the INT 10h teletype/ANSI surface.

use crate::display::DisplaySink;

pub const TEXT_COLS: usize = 80;
pub const TEXT_ROWS: usize = 25;
pub const VGA_TEXT_BASE: u64 = 0xB8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellAttr(pub u8);

impl CellAttr {
    pub const DEFAULT: CellAttr = CellAttr(0x07);
}

/// Parser state for the small CSI subset this emulator recognizes when a
/// guest writes ANSI escape sequences through the teletype output call
///.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AnsiState {
    Ground,
    Escape,
    Csi { params: Vec<u32>, current: Option<u32> },
}

/// Mode/cursor/attribute state plus the 80x25 cell buffer and ANSI parser
///. `framebuffer` mirrors what a guest reading back `0xB8000`
/// would see; `display` is the host-visible sink that gets the rendered
/// effect of each write.
pub struct VideoContext {
    pub mode: u8,
    pub cursor_row: u8,
    pub cursor_col: u8,
    pub attr: CellAttr,
    cells: Vec<(u8, CellAttr)>,
    ansi: AnsiState,
}

impl std::fmt::Debug for VideoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoContext")
            .field("mode", &self.mode)
            .field("cursor_row", &self.cursor_row)
            .field("cursor_col", &self.cursor_col)
            .finish()
    }
}

impl Default for VideoContext {
    fn default() -> Self {
        VideoContext {
            mode: 0x03,
            cursor_row: 0,
            cursor_col: 0,
            attr: CellAttr::DEFAULT,
            cells: vec![(b' ', CellAttr::DEFAULT); TEXT_COLS * TEXT_ROWS],
            ansi: AnsiState::Ground,
        }
    }
}

impl VideoContext {
    fn index(row: u8, col: u8) -> usize {
        row as usize * TEXT_COLS + col as usize
    }

    pub fn cell(&self, row: u8, col: u8) -> (u8, CellAttr) {
        self.cells[Self::index(row, col)]
    }

    fn set_cell(&mut self, row: u8, col: u8, ch: u8, attr: CellAttr) {
        self.cells[Self::index(row, col)] = (ch, attr);
    }

    fn scroll_if_needed(&mut self, display: &mut dyn DisplaySink) {
        if self.cursor_row as usize >= TEXT_ROWS {
            self.cells.drain(0..TEXT_COLS);
            self.cells.resize(TEXT_COLS * TEXT_ROWS, (b' ', self.attr));
            self.cursor_row = TEXT_ROWS as u8 - 1;
            display.clear();
            self.repaint(display);
        }
    }

    /// Update one byte of the text framebuffer addressed as an offset from
    /// `VGA_TEXT_BASE` (even offsets are the character cell, odd offsets the
    /// attribute), mirroring a direct MMIO write. Offsets past the 80x25
    /// grid are dropped, same as writing past the end of real VGA memory.
    pub fn write_mmio_byte(&mut self, offset: u64, value: u8) {
        let cell_idx = (offset / 2) as usize;
        let Some((ch, attr)) = self.cells.get(cell_idx).copied() else {
            return;
        };
        self.cells[cell_idx] = if offset % 2 == 0 { (value, attr) } else { (ch, CellAttr(value)) };
    }

    pub(crate) fn repaint(&self, display: &mut dyn DisplaySink) {
        for row in 0..TEXT_ROWS as u8 {
            for col in 0..TEXT_COLS as u8 {
                let (ch, attr) = self.cell(row, col);
                display.write(row, col, ch, attr.0);
            }
        }
        display.set_cursor(self.cursor_row, self.cursor_col);
    }

    /// INT 10h AH=06h/07h scroll-window. `lines == 0` blanks the whole
    /// window instead of scrolling it, per the BIOS convention. `top..=bottom`
    /// and `left..=right` are clamped to the visible grid; an inverted
    /// rectangle is a no-op.
    pub fn scroll_window(
        &mut self,
        up: bool,
        lines: u8,
        top: u8,
        left: u8,
        bottom: u8,
        right: u8,
        blank: CellAttr,
        display: &mut dyn DisplaySink,
    ) {
        let bottom = bottom.min(TEXT_ROWS as u8 - 1);
        let right = right.min(TEXT_COLS as u8 - 1);
        if top > bottom || left > right {
            return;
        }
        let window_rows = bottom - top + 1;
        if lines == 0 || lines >= window_rows {
            for row in top..=bottom {
                for col in left..=right {
                    self.set_cell(row, col, b' ', blank);
                }
            }
        } else if up {
            for row in top..=(bottom - lines) {
                for col in left..=right {
                    let (ch, attr) = self.cell(row + lines, col);
                    self.set_cell(row, col, ch, attr);
                }
            }
            for row in (bottom - lines + 1)..=bottom {
                for col in left..=right {
                    self.set_cell(row, col, b' ', blank);
                }
            }
        } else {
            for row in ((top + lines)..=bottom).rev() {
                for col in left..=right {
                    let (ch, attr) = self.cell(row - lines, col);
                    self.set_cell(row, col, ch, attr);
                }
            }
            for row in top..(top + lines) {
                for col in left..=right {
                    self.set_cell(row, col, b' ', blank);
                }
            }
        }
        self.repaint(display);
    }

    fn newline(&mut self, display: &mut dyn DisplaySink) {
        self.cursor_col = 0;
        self.cursor_row += 1;
        self.scroll_if_needed(display);
    }

    fn put_char_raw(&mut self, ch: u8, display: &mut dyn DisplaySink) {
        self.set_cell(self.cursor_row, self.cursor_col, ch, self.attr);
        display.write(self.cursor_row, self.cursor_col, ch, self.attr.0);
        self.cursor_col += 1;
        if self.cursor_col as usize >= TEXT_COLS {
            self.newline(display);
        }
        display.set_cursor(self.cursor_row, self.cursor_col);
    }

    /// INT 10h AH=0Eh teletype output, including the ANSI CSI state machine.
    /// Returns after fully consuming `ch` into either a screen cell or parser
    /// state transition.
    pub fn teletype_output(&mut self, ch: u8, display: &mut dyn DisplaySink) {
        match &mut self.ansi {
            AnsiState::Ground => match ch {
                b'\n' => self.newline(display),
                b'\r' => {
                    self.cursor_col = 0;
                    display.set_cursor(self.cursor_row, self.cursor_col);
                }
                0x08 => {
                    self.cursor_col = self.cursor_col.saturating_sub(1);
                    display.set_cursor(self.cursor_row, self.cursor_col);
                }
                0x1B => self.ansi = AnsiState::Escape,
                _ => self.put_char_raw(ch, display),
            },
            AnsiState::Escape => {
                if ch == b'[' {
                    self.ansi = AnsiState::Csi {
                        params: Vec::new(),
                        current: None,
                    };
                } else {
                    self.ansi = AnsiState::Ground; // unsupported escape, drop it
                }
            }
            AnsiState::Csi { .. } => self.csi_byte(ch, display),
        }
    }

    fn csi_byte(&mut self, ch: u8, display: &mut dyn DisplaySink) {
        let AnsiState::Csi { params, current } = &mut self.ansi else {
            unreachable!()
        };
        match ch {
            b'0'..=b'9' => {
                let d = (ch - b'0') as u32;
                *current = Some(current.unwrap_or(0) * 10 + d);
            }
            b';' => {
                params.push(current.take().unwrap_or(0));
            }
            b'A' | b'B' | b'C' | b'D' | b'H' | b'm' | b'J' | b'K' => {
                if let Some(c) = current.take() {
                    params.push(c);
                }
                let params = std::mem::take(params);
                self.ansi = AnsiState::Ground;
                self.apply_csi_final(ch, &params, display);
            }
            _ => {
                self.ansi = AnsiState::Ground;
            }
        }
    }

    fn apply_csi_final(&mut self, finalb: u8, params: &[u32], display: &mut dyn DisplaySink) {
        let n = |i: usize, default: u32| params.get(i).copied().filter(|&v| v != 0).unwrap_or(default);
        match finalb {
            b'A' => self.cursor_row = self.cursor_row.saturating_sub(n(0, 1) as u8),
            b'B' => self.cursor_row = (self.cursor_row + n(0, 1) as u8).min(TEXT_ROWS as u8 - 1),
            b'C' => self.cursor_col = (self.cursor_col + n(0, 1) as u8).min(TEXT_COLS as u8 - 1),
            b'D' => self.cursor_col = self.cursor_col.saturating_sub(n(0, 1) as u8),
            b'H' => {
                self.cursor_row = (n(0, 1).saturating_sub(1)) as u8;
                self.cursor_col = (n(1, 1).saturating_sub(1)) as u8;
            }
            b'J' => {
                if params.first().copied().unwrap_or(0) == 2 {
                    self.cells.iter_mut().for_each(|c| *c = (b' ', self.attr));
                    display.clear();
                    self.repaint(display);
                }
            }
            b'K' => {
                for col in self.cursor_col..TEXT_COLS as u8 {
                    self.set_cell(self.cursor_row, col, b' ', self.attr);
                }
                self.repaint(display);
            }
            b'm' => {
                for &p in params {
                    self.attr = apply_sgr(self.attr, p);
                }
            }
            _ => {}
        }
        display.set_cursor(self.cursor_row, self.cursor_col);
    }
}

fn apply_sgr(attr: CellAttr, code: u32) -> CellAttr {
    match code {
        0 => CellAttr::DEFAULT,
        30..=37 => CellAttr((attr.0 & 0xF0) | ((code - 30) as u8 & 0x0F)),
        40..=47 => CellAttr(((attr.0 & 0x0F)) | (((code - 40) as u8 & 0x0F) << 4)),
        1 => CellAttr(attr.0 | 0x08),
        _ => attr,
    }
}
