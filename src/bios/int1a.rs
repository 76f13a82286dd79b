//! INT 1Ah time-of-day services. Backed by the BDA tick counter the
//! PIT ticker advances once per wall-clock interval, not a real RTC.

use super::{ah, set_ah, BiosFacade};
use crate::state::{gpr, CpuState};

pub(super) fn handle(facade: &mut BiosFacade, cpu: &mut CpuState) {
    match ah(cpu) {
        0x00 => {
            cpu.write_gpr32(gpr::RCX, (facade.bda_ticks >> 16) & 0xFFFF);
            cpu.write_gpr32(gpr::RDX, facade.bda_ticks & 0xFFFF);
            set_ah(cpu, 0); // midnight-rollover flag, never set by this model
        }
        _ => {
            tracing::debug!(ah = ah(cpu), "unhandled int1a service");
        }
    }
}
