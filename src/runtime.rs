//! Machine assembly and the fetch/decode/execute loop.

use crate::bios::{BiosFacade, Screen, SharedScreen};
use crate::bootstream::BootStream;
use crate::decode::{self, Decoded};
use crate::devices::keyboard::{Keyboard, NullKeyboard};
use crate::devices::video::VideoContext;
use crate::devices::PortBus;
use crate::diag::{CallTrace, Frame};
use crate::display::{DisplaySink, NullDisplay};
use crate::error::{ExitCondition, RunError};
use crate::exec::{self, StepOutcome};
use crate::interrupts::{self, PendingEvent};
use crate::mem::{Memory, MemoryObserver};
use crate::state::{CpuMode, CpuState};
use crate::tickers::TickerRegistry;
use std::cell::RefCell;
use std::rc::Rc;

/// Real-mode segment the synthetic BIOS stubs live in, chosen to match the
/// conventional location of the real BIOS ROM at the top of the first 1 MiB.
const BIOS_ROM_SEGMENT: u16 = 0xF000;
const BIOS_ROM_BASE: u64 = (BIOS_ROM_SEGMENT as u64) << 4;
/// Hardware vectors the IVT is pre-wired to route into the BIOS façade. The
/// PIT tick (IRQ 0 / `INT 08h`) advances the BDA tick counter directly from
/// [`crate::tickers::TickerRegistry`] rather than through a BIOS call, so it
/// is not one of these.
const BIOS_VECTORS: [u8; 6] = [0x10, 0x13, 0x15, 0x16, 0x1A, 0x21];

/// Physical range a guest sees as the VGA text-mode framebuffer. Writes here
/// mirror into the active [`Screen`] and repaint, independent of whatever
/// `INT 10h` calls the guest also makes.
const VGA_TEXT_BASE: u64 = crate::devices::video::VGA_TEXT_BASE;
const VGA_TEXT_END: u64 = 0xC0000;

/// Mirrors direct writes to the VGA text framebuffer into the shared
/// [`Screen`], so a guest that pokes `0xB8000` without going through `INT
/// 10h` still updates the cell buffer and repaints the display.
#[derive(Debug)]
struct VgaObserver {
    screen: SharedScreen,
}

impl MemoryObserver for VgaObserver {
    fn range(&self) -> std::ops::Range<u64> {
        VGA_TEXT_BASE..VGA_TEXT_END
    }

    fn write(&mut self, addr: u64, width: u8, value: u64) -> bool {
        let mut guard = self.screen.borrow_mut();
        let screen = &mut *guard;
        let bytes = (width / 8) as u64;
        for i in 0..bytes {
            let byte = ((value >> (8 * i)) & 0xFF) as u8;
            screen.video.write_mmio_byte(addr + i - VGA_TEXT_BASE, byte);
        }
        screen.video.repaint(screen.display.as_mut());
        false // let the write also land in backing RAM
    }
}

/// Write a `0F FF vv  CF` stub (synthetic BIOS call for `vv`, then IRET) for
/// each vector in [`BIOS_VECTORS`] into the BIOS ROM segment, and point the
/// real-mode IVT at it. A guest's plain `INT 10h`/`INT 13h`/etc. lands here;
/// the BIOS façade itself is also reachable directly through the same
/// synthetic opcode without going through the IVT at all.
fn install_bios_stubs(memory: &mut Memory) {
    for &vector in &BIOS_VECTORS {
        let stub_offset = vector as u64 * 4;
        memory.phys.load(BIOS_ROM_BASE + stub_offset, &[0x0F, 0xFF, vector, 0xCF]);
        let ivt_addr = vector as u64 * 4;
        memory.phys.load(ivt_addr, &(stub_offset as u16).to_le_bytes());
        memory.phys.load(ivt_addr + 2, &BIOS_ROM_SEGMENT.to_le_bytes());
    }
}

/// Host-side configuration for one run: everything that is not part of the
/// CPU's architectural state.
pub struct RuntimeOptions {
    pub max_ram: u64,
    pub diagnostics: bool,
    pub call_trace_capacity: usize,
    pub max_steps: Option<u64>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            max_ram: crate::mem::DEFAULT_MAX_RAM,
            diagnostics: false,
            call_trace_capacity: 256,
            max_steps: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_max_ram(mut self, bytes: u64) -> Self {
        self.max_ram = bytes;
        self
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Stop the run after this many retired instructions even if nothing
    /// else would end it. Used by tests to bound runaway guest programs.
    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }
}

/// A fully wired machine: CPU, memory, ports, the BIOS façade, and the
/// background tickers. Built by [`Machine::new`], run via [`Machine::runtime`].
pub struct Machine {
    cpu: CpuState,
    memory: Memory,
    io: PortBus,
    bios: BiosFacade,
    tickers: TickerRegistry,
    diag: Option<CallTrace>,
    max_steps: Option<u64>,
}

impl Machine {
    /// Load the boot sector at `0x7C00` (the standard PC convention) and
    /// verify its `0x55AA` signature before anything runs.
    pub fn new(mut boot: Box<dyn BootStream>, options: RuntimeOptions, mode: CpuMode) -> Result<Self, RunError> {
        boot.verify_boot_signature()?;

        let mut memory = Memory::new(options.max_ram);
        let mut sector = [0u8; crate::bootstream::SECTOR_SIZE];
        boot.read_sector(0, &mut sector).map_err(RunError::Io)?;
        memory.phys.load(0x7C00, &sector);
        install_bios_stubs(&mut memory);

        let mut cpu = CpuState::new(mode);
        cpu.set_rip(0x7C00);

        let screen: SharedScreen = Rc::new(RefCell::new(Screen {
            video: VideoContext::default(),
            display: Box::new(NullDisplay),
        }));
        memory.phys.register_observer(Box::new(VgaObserver { screen: screen.clone() }));
        let bios = BiosFacade::new(boot, screen, Box::new(NullKeyboard));

        Ok(Machine {
            cpu,
            memory,
            io: PortBus::default(),
            bios,
            tickers: TickerRegistry::new(),
            diag: options.diagnostics.then(|| CallTrace::new(options.call_trace_capacity)),
            max_steps: options.max_steps,
        })
    }

    pub fn with_display(self, display: Box<dyn DisplaySink>) -> Self {
        self.bios.screen.borrow_mut().display = display;
        self
    }

    pub fn with_keyboard(mut self, keyboard: Box<dyn Keyboard>) -> Self {
        self.bios.keyboard_source = keyboard;
        self
    }

    /// Enter the run loop at `entrypoint`. A boot sector conventionally
    /// starts at `0x7C00`, but tests that hand-build a protected-mode image
    /// can start anywhere.
    pub fn runtime(mut self, entrypoint: u64) -> RuntimeContext {
        self.cpu.set_rip(entrypoint);
        RuntimeContext { machine: self }
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }
}

/// The running machine, ready for [`RuntimeContext::start`]. Split from
/// [`Machine`] so construction (which can fail on a bad boot image) and
/// entry (which cannot) are distinct steps.
pub struct RuntimeContext {
    machine: Machine,
}

impl RuntimeContext {
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Run until the guest halts, exits, or faults unrecoverably.
    pub fn start(&mut self) -> Result<ExitCondition, RunError> {
        let mut steps: u64 = 0;
        loop {
            if let Some(max) = self.machine.max_steps {
                if steps >= max {
                    return Err(RunError::Fatal("max_steps exceeded without the guest halting or exiting".into()));
                }
            }
            steps += 1;

            if self.machine.cpu.halted {
                return Ok(ExitCondition::Halt);
            }

            match self.step() {
                Ok(Some(exit)) => return Ok(exit),
                Ok(None) => {}
                Err(RunError::TripleFault) => return Ok(ExitCondition::TripleFault),
                Err(e) => return Err(e),
            }

            self.machine.tickers.tick(&mut self.machine.bios);
        }
    }

    fn step(&mut self) -> Result<Option<ExitCondition>, RunError> {
        let m = &mut self.machine;
        let rip = m.cpu.rip();
        let fetch_addr = m.cpu.segments.cs.base + rip;

        let decoded = match decode::decode(&mut m.memory, m.cpu.mode, fetch_addr, &m.cpu.segments) {
            Ok(d) => d,
            Err(e) => return self.deliver_fault(e),
        };

        if decode_would_block(m, &decoded) {
            return Ok(None); // suspend: re-fetch/redecode/re-execute next step
        }

        let next_rip = rip.wrapping_add(decoded.length as u64);
        self.trace_call(&decoded, rip, next_rip);

        let m = &mut self.machine;
        let result = exec::execute(&decoded, next_rip, &mut m.cpu, &mut m.memory, &mut m.io, &mut m.bios);
        match result {
            Ok(output) => self.apply_output(next_rip, output),
            Err(e) => self.deliver_fault(e),
        }
    }

    fn apply_output(&mut self, next_rip: u64, output: exec::ExecOutput) -> Result<Option<ExitCondition>, RunError> {
        if !output.rip_set_explicitly {
            self.machine.cpu.set_rip(next_rip);
        }
        if let Some(exec::SoftwareInterrupt(vector)) = output.software_interrupt {
            interrupts::deliver(&mut self.machine.cpu, &mut self.machine.memory, PendingEvent::SoftwareInterrupt(vector))?;
        }
        match output.outcome {
            StepOutcome::Continue => Ok(None),
            StepOutcome::Exit(exit) => Ok(Some(exit)),
            StepOutcome::Suspend => Ok(None),
        }
    }

    fn deliver_fault(&mut self, exception: crate::error::Exception) -> Result<Option<ExitCondition>, RunError> {
        match interrupts::deliver(&mut self.machine.cpu, &mut self.machine.memory, PendingEvent::Exception(exception)) {
            Ok(()) => Ok(None),
            Err(RunError::Undeliverable(second)) => {
                interrupts::escalate(&mut self.machine.cpu, &mut self.machine.memory, exception, second)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn trace_call(&mut self, decoded: &Decoded, from: u64, next_rip: u64) {
        let Some(trace) = &mut self.machine.diag else { return };
        match &decoded.op {
            crate::decode::Op::Call { .. } | crate::decode::Op::CallFar { .. } => {
                trace.push(Frame::Call { from, to: next_rip });
            }
            crate::decode::Op::Int { vector } => {
                trace.push(Frame::Interrupt { vector: *vector, from });
            }
            crate::decode::Op::Ret { .. } | crate::decode::Op::Retf { .. } | crate::decode::Op::Iret => {
                trace.pop();
            }
            _ => {}
        }
    }
}

fn decode_would_block(machine: &Machine, decoded: &Decoded) -> bool {
    match decoded.op {
        crate::decode::Op::BiosCall { vector } => machine.bios.would_block(vector, &machine.cpu),
        _ => false,
    }
}
