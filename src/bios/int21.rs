//! INT 21h: a small slice of the DOS API, just enough for boot-sector-style
//! guests that want character output and a clean exit without implementing
//! their own INT 10h teletype loop.

use super::{ah, al, set_al, BiosFacade};
use crate::error::ExitCondition;
use crate::mem::CpuBus;
use crate::state::{gpr, CpuState};

pub(super) fn handle(facade: &mut BiosFacade, cpu: &mut CpuState, bus: &mut dyn CpuBus) -> Option<ExitCondition> {
    match ah(cpu) {
        0x02 => {
            // DL = character to display.
            let ch = cpu.read_gpr32(gpr::RDX) as u8;
            let mut guard = facade.screen.borrow_mut();
            let screen = &mut *guard;
            screen.video.teletype_output(ch, screen.display.as_mut());
            None
        }
        0x09 => {
            // DS:DX = '$'-terminated string.
            let base = cpu.segments.ds.base + cpu.read_gpr32(gpr::RDX) as u64;
            let mut offset = 0u64;
            loop {
                let Ok(ch) = bus.read_u8(base + offset) else { break };
                if ch == b'$' {
                    break;
                }
                let mut guard = facade.screen.borrow_mut();
                let screen = &mut *guard;
                screen.video.teletype_output(ch, screen.display.as_mut());
                drop(guard);
                offset += 1;
                if offset > 0xFFFF {
                    break; // runaway string guard, not a guest-visible fault
                }
            }
            None
        }
        0x4C => Some(ExitCondition::DosExit(al(cpu))),
        _ => {
            tracing::debug!(ah = ah(cpu), "unhandled int21 service");
            set_al(cpu, 0xFF);
            None
        }
    }
}
