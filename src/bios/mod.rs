//! The synthetic BIOS service façade.
//!
//! Real firmware answers these interrupts by having the CPU fetch a real
//! handler out of the IVT and execute it. This emulator instead intercepts
//! the handful of INT vectors a small real-mode guest actually needs and
//! answers them directly in host code, reached either through a normal `INT`
//! (which still goes through [`crate::interrupts`] if the guest installed its
//! own handler) or through the synthetic `0F FF vv` escape that always routes
//! here regardless of what the IVT holds.

mod int10;
mod int13;
mod int15;
mod int16;
mod int1a;
mod int21;

use crate::bootstream::BootStream;
use crate::devices::keyboard::{Keyboard, KeyboardContext};
use crate::devices::video::VideoContext;
use crate::display::DisplaySink;
use crate::error::{Exception, ExitCondition};
use crate::mem::CpuBus;
use crate::state::CpuState;
use std::cell::RefCell;
use std::rc::Rc;

/// The video state and its host-visible sink, bundled so both the BIOS
/// façade and the VGA MMIO observer registered on physical memory can reach
/// the same cell buffer: a guest writing through `INT 10h` and one poking
/// `0xB8000` directly must see each other's effects.
#[derive(Debug)]
pub struct Screen {
    pub video: VideoContext,
    pub display: Box<dyn DisplaySink>,
}

pub type SharedScreen = Rc<RefCell<Screen>>;

/// Everything the BIOS façade needs beyond the CPU/memory it's handed per
/// call: the emulated devices and the boot medium backing disk services.
pub struct BiosFacade {
    pub screen: SharedScreen,
    pub keyboard: KeyboardContext,
    pub keyboard_source: Box<dyn Keyboard>,
    pub boot: Box<dyn BootStream>,
    /// BDA tick count at `0x40:0x6C`, advanced by the PIT ticker.
    pub bda_ticks: u32,
}

impl BiosFacade {
    pub fn new(boot: Box<dyn BootStream>, screen: SharedScreen, keyboard_source: Box<dyn Keyboard>) -> Self {
        BiosFacade {
            screen,
            keyboard: KeyboardContext::default(),
            keyboard_source,
            boot,
            bda_ticks: 0,
        }
    }

    /// Poll the keyboard source once (driven by the device ticker) and feed
    /// any key into the BIOS-visible FIFO.
    pub fn poll_keyboard(&mut self) {
        if let Some(ev) = self.keyboard_source.poll() {
            self.keyboard.push(ev);
        }
    }

    /// Whether dispatching `vector` right now would block on an empty
    /// keyboard FIFO rather than complete.
    pub fn would_block(&self, vector: u8, cpu: &CpuState) -> bool {
        vector == 0x16 && int16::would_block(self, cpu)
    }

    /// Dispatch one BIOS call. Returns `Some(exit)` if the call terminates
    /// the run (DOS `AH=4Ch`/`INT 20h`); otherwise updates `cpu`/`bus` in
    /// place and returns `None`.
    pub fn dispatch(
        &mut self,
        vector: u8,
        cpu: &mut CpuState,
        bus: &mut dyn CpuBus,
    ) -> Result<Option<ExitCondition>, Exception> {
        tracing::debug!(vector, ah = cpu.read_gpr32(crate::state::gpr::RAX) >> 8 & 0xFF, "bios call");
        match vector {
            0x10 => {
                int10::handle(self, cpu);
                Ok(None)
            }
            0x13 => {
                int13::handle(self, cpu, bus);
                Ok(None)
            }
            0x15 => {
                int15::handle(self, cpu, bus);
                Ok(None)
            }
            0x16 => {
                int16::handle(self, cpu);
                Ok(None)
            }
            0x1A => {
                int1a::handle(self, cpu);
                Ok(None)
            }
            0x20 => Ok(Some(ExitCondition::DosExit(0))),
            0x21 => Ok(int21::handle(self, cpu, bus)),
            _ => Err(Exception::InvalidOpcode),
        }
    }
}

pub(crate) fn set_cf(cpu: &mut CpuState, value: bool) {
    cpu.set_flag(crate::state::FLAG_CF, value);
}

pub(crate) fn ah(cpu: &CpuState) -> u8 {
    (cpu.read_gpr32(crate::state::gpr::RAX) >> 8) as u8
}

pub(crate) fn al(cpu: &CpuState) -> u8 {
    cpu.read_gpr32(crate::state::gpr::RAX) as u8
}

pub(crate) fn set_al(cpu: &mut CpuState, v: u8) {
    let ax = cpu.read_gpr32(crate::state::gpr::RAX) & !0xFF;
    cpu.write_gpr32(crate::state::gpr::RAX, ax | v as u32);
}

pub(crate) fn set_ah(cpu: &mut CpuState, v: u8) {
    let ax = cpu.read_gpr32(crate::state::gpr::RAX) & !0xFF00;
    cpu.write_gpr32(crate::state::gpr::RAX, ax | ((v as u32) << 8));
}
