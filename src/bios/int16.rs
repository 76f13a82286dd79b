//! INT 16h keyboard services.

use super::{ah, set_ah, set_al, BiosFacade};
use crate::state::{CpuState, FLAG_ZF};

pub(super) fn handle(facade: &mut BiosFacade, cpu: &mut CpuState) {
    match ah(cpu) {
        0x00 | 0x10 => {
            // Blocking read. The executor treats a still-empty FIFO here as
            // a suspension point, re-polling the keyboard source and
            // retrying this same instruction rather
            // than spinning the guest on a software polling loop.
            if let Some(ev) = facade.keyboard.pop() {
                set_al(cpu, ev.ascii);
                set_ah(cpu, ev.scan_code);
            }
        }
        0x01 | 0x11 => match facade.keyboard.peek() {
            Some(ev) => {
                set_al(cpu, ev.ascii);
                set_ah(cpu, ev.scan_code);
                cpu.set_flag(FLAG_ZF, false);
            }
            None => cpu.set_flag(FLAG_ZF, true),
        },
        0x02 => {
            set_al(cpu, 0); // no shift/ctrl/alt modeled
        }
        _ => {
            tracing::debug!(ah = ah(cpu), "unhandled int16 service");
        }
    }
}

/// Whether AH=00h/10h would block right now (used by the executor to decide
/// whether to suspend instead of completing the BIOS call).
pub fn would_block(facade: &BiosFacade, cpu: &CpuState) -> bool {
    matches!(ah(cpu), 0x00 | 0x10) && facade.keyboard.peek().is_none()
}
