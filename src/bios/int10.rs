//! INT 10h video services.

use super::{ah, al, set_ah, set_al, BiosFacade};
use crate::devices::video::CellAttr;
use crate::state::{gpr, CpuState};

pub(super) fn handle(facade: &mut BiosFacade, cpu: &mut CpuState) {
    let mut guard = facade.screen.borrow_mut();
    let screen = &mut *guard;
    match ah(cpu) {
        0x00 => {
            // AL = requested mode; this emulator only models 80x25 text.
            let mode = al(cpu);
            screen.video = crate::devices::video::VideoContext::default();
            screen.video.mode = mode;
            screen.display.clear();
        }
        0x02 => {
            // DH=row, DL=col, BH=page (ignored, single page modeled).
            let dx = cpu.read_gpr32(gpr::RDX);
            screen.video.cursor_row = (dx >> 8) as u8;
            screen.video.cursor_col = dx as u8;
            screen.display.set_cursor(screen.video.cursor_row, screen.video.cursor_col);
        }
        0x03 => {
            let dx = ((screen.video.cursor_row as u32) << 8) | screen.video.cursor_col as u32;
            cpu.write_gpr32(gpr::RDX, dx);
            set_ah(cpu, 0);
        }
        0x06 | 0x07 => {
            // AL=lines (0=blank window), BH=blank attr, CH/CL=top-left,
            // DH/DL=bottom-right. AH=06h scrolls up, AH=07h scrolls down.
            let lines = al(cpu);
            let bh = (cpu.read_gpr32(gpr::RBX) >> 8) as u8;
            let cx = cpu.read_gpr32(gpr::RCX);
            let dx = cpu.read_gpr32(gpr::RDX);
            let (top, left) = ((cx >> 8) as u8, cx as u8);
            let (bottom, right) = ((dx >> 8) as u8, dx as u8);
            screen.video.scroll_window(ah(cpu) == 0x06, lines, top, left, bottom, right, CellAttr(bh), screen.display.as_mut());
        }
        0x0E => {
            let ch = al(cpu);
            screen.video.teletype_output(ch, screen.display.as_mut());
        }
        0x09 | 0x0A => {
            // Write character (with/without attribute) at cursor, no advance.
            let ch = al(cpu);
            let bl = cpu.read_gpr32(gpr::RBX) as u8;
            let attr = if ah(cpu) == 0x09 { CellAttr(bl) } else { screen.video.attr };
            let (row, col) = (screen.video.cursor_row, screen.video.cursor_col);
            screen.display.write(row, col, ch, attr.0);
        }
        0x0F => {
            set_al(cpu, screen.video.mode);
            set_ah(cpu, crate::devices::video::TEXT_COLS as u8);
        }
        _ => {
            tracing::debug!(ah = ah(cpu), "unhandled int10 service");
        }
    }
}
