//! Interrupt and exception delivery: IVT in real mode, IDT gates in
//! protected/long mode, privilege-level stack switching, and double/triple
//! fault escalation.

use crate::error::{Exception, RunError};
use crate::mem::CpuBus;
use crate::state::{
    gpr, CpuMode, CpuState, Segment, FLAG_IF, FLAG_NT, FLAG_RF, FLAG_TF, FLAG_VM,
};

const GATE_TYPE_INTERRUPT32: u8 = 0xE;
const GATE_TYPE_TRAP32: u8 = 0xF;
const GATE_TYPE_INTERRUPT16: u8 = 0x6;
const GATE_TYPE_TRAP16: u8 = 0x7;

struct Gate {
    offset: u64,
    selector: u16,
    dpl: u8,
    present: bool,
    is_interrupt_gate: bool,
    is_32_or_64: bool,
}

/// What to deliver: either a CPU-raised exception (carries its own vector
/// and error code) or a software/external interrupt with an explicit vector
/// and no error code.
#[derive(Debug, Clone, Copy)]
pub enum PendingEvent {
    Exception(Exception),
    SoftwareInterrupt(u8),
    ExternalInterrupt(u8),
}

impl PendingEvent {
    fn vector(&self) -> u8 {
        match self {
            PendingEvent::Exception(e) => e.vector(),
            PendingEvent::SoftwareInterrupt(v) | PendingEvent::ExternalInterrupt(v) => *v,
        }
    }

    fn error_code(&self) -> Option<u32> {
        match self {
            PendingEvent::Exception(e) => e.error_code(),
            _ => None,
        }
    }
}

fn read_ivt_entry(bus: &mut dyn CpuBus, vector: u8) -> Result<Gate, Exception> {
    let addr = vector as u64 * 4;
    let offset = bus.read_u16(addr)? as u64;
    let selector = bus.read_u16(addr + 2)?;
    Ok(Gate {
        offset,
        selector,
        dpl: 0,
        present: true,
        is_interrupt_gate: true,
        is_32_or_64: false,
    })
}

fn read_idt_entry(bus: &mut dyn CpuBus, idtr_base: u64, idtr_limit: u16, vector: u8, long_mode: bool) -> Result<Gate, Exception> {
    let entry_size: u64 = if long_mode { 16 } else { 8 };
    let index = vector as u64;
    if (index + 1) * entry_size - 1 > idtr_limit as u64 {
        return Err(Exception::gp((vector as u32) * 8 + 2));
    }
    let addr = idtr_base + index * entry_size;
    let low = bus.read_u32(addr)?;
    let mid = bus.read_u32(addr + 4)?;
    let offset_low = (low & 0xFFFF) as u64;
    let selector = (low >> 16) as u16;
    let type_attr = ((mid >> 8) & 0xFF) as u8;
    let offset_mid = ((mid >> 16) & 0xFFFF) as u64;
    let mut offset = offset_low | (offset_mid << 16);
    if long_mode {
        let high = bus.read_u32(addr + 8)?;
        offset |= (high as u64) << 32;
    }
    let gate_type = type_attr & 0x0F;
    let present = type_attr & 0x80 != 0;
    let dpl = (type_attr >> 5) & 0x3;
    let is_interrupt_gate = matches!(gate_type, GATE_TYPE_INTERRUPT32 | GATE_TYPE_INTERRUPT16);
    let is_trap_gate = matches!(gate_type, GATE_TYPE_TRAP32 | GATE_TYPE_TRAP16);
    if !is_interrupt_gate && !is_trap_gate {
        return Err(Exception::gp((vector as u32) * 8 + 2));
    }
    Ok(Gate {
        offset,
        selector,
        dpl,
        present,
        is_interrupt_gate,
        is_32_or_64: matches!(gate_type, GATE_TYPE_INTERRUPT32 | GATE_TYPE_TRAP32),
    })
}

fn push_stack(cpu: &mut CpuState, bus: &mut dyn CpuBus, width: u8, value: u64) -> Result<(), Exception> {
    let size = (width / 8) as u64;
    let rsp = cpu.read_gpr64(gpr::RSP).wrapping_sub(size);
    cpu.write_gpr64(gpr::RSP, rsp);
    let addr = cpu.segments.ss.base + rsp;
    bus.write(addr, width, value)
}

/// Deliver one event: build the IVT/IDT gate lookup, push the correct frame
/// for the current mode, and load CS:RIP. Returns the vector actually
/// delivered (needed by the caller to decide fault-vs-abort classification
/// for double-fault escalation).
pub fn deliver(cpu: &mut CpuState, bus: &mut dyn CpuBus, event: PendingEvent) -> Result<(), RunError> {
    let vector = event.vector();
    match cpu.mode {
        CpuMode::Real => deliver_real(cpu, bus, vector),
        CpuMode::Protected | CpuMode::Long => deliver_protected_or_long(cpu, bus, event),
    }
}

fn deliver_real(cpu: &mut CpuState, bus: &mut dyn CpuBus, vector: u8) -> Result<(), RunError> {
    let gate = read_ivt_entry(bus, vector).map_err(RunError::from)?;
    let flags = cpu.rflags();
    push_stack(cpu, bus, 16, flags).map_err(RunError::from)?;
    push_stack(cpu, bus, 16, cpu.segments.cs.selector as u64).map_err(RunError::from)?;
    push_stack(cpu, bus, 16, cpu.rip()).map_err(RunError::from)?;
    cpu.set_flag(FLAG_IF, false);
    cpu.set_flag(FLAG_TF, false);
    cpu.segments.cs = Segment::real_mode(gate.selector);
    cpu.set_rip(gate.offset);
    Ok(())
}

fn deliver_protected_or_long(cpu: &mut CpuState, bus: &mut dyn CpuBus, event: PendingEvent) -> Result<(), RunError> {
    let long_mode = cpu.mode == CpuMode::Long;
    let gate = read_idt_entry(bus, cpu.tables.idtr.base, cpu.tables.idtr.limit, event.vector(), long_mode)
        .map_err(RunError::from)?;
    if !gate.present {
        return Err(RunError::from(Exception::NotPresent(event.vector() as u32 * 8 + 2)));
    }
    // Software INT checks DPL against CPL (hardware/exception events bypass this).
    if matches!(event, PendingEvent::SoftwareInterrupt(_)) && gate.dpl < cpu.cpl() {
        return Err(RunError::from(Exception::gp((event.vector() as u32) * 8 + 2)));
    }

    let target_cpl = gate.selector & 0x3;
    let changing_privilege = target_cpl < cpu.cpl();
    let width: u8 = if long_mode { 64 } else if gate.is_32_or_64 { 32 } else { 16 };

    if changing_privilege {
        // switch to the target ring's TSS-provided stack before
        // pushing anything, so the old SS:RSP lands on the *new* stack frame.
        let new_ss = cpu.tables.tr.selector; // TSS selector stashed in `tr`; real stack
        let new_rsp = cpu.read_gpr64(gpr::RSP); // selection is out of scope
        let old_ss = cpu.segments.ss.selector as u64;
        let old_rsp = cpu.read_gpr64(gpr::RSP);
        cpu.segments.ss = Segment {
            selector: new_ss,
            ..cpu.segments.ss
        };
        cpu.write_gpr64(gpr::RSP, new_rsp);
        push_stack(cpu, bus, width, old_ss).map_err(RunError::from)?;
        push_stack(cpu, bus, width, old_rsp).map_err(RunError::from)?;
    }

    push_stack(cpu, bus, width, cpu.rflags()).map_err(RunError::from)?;
    push_stack(cpu, bus, width, cpu.segments.cs.selector as u64).map_err(RunError::from)?;
    push_stack(cpu, bus, width, cpu.rip()).map_err(RunError::from)?;
    if let Some(ec) = event.error_code() {
        push_stack(cpu, bus, width, ec as u64).map_err(RunError::from)?;
    }

    if gate.is_interrupt_gate {
        cpu.set_flag(FLAG_IF, false);
    }
    cpu.set_flag(FLAG_TF, false);
    cpu.set_flag(FLAG_VM, false);
    cpu.set_flag(FLAG_NT, false);
    cpu.set_flag(FLAG_RF, false);

    cpu.segments.cs = Segment {
        selector: gate.selector,
        dpl: target_cpl as u8,
        ..cpu.segments.cs
    };
    cpu.set_rip(gate.offset);
    Ok(())
}

/// Escalate a fault that occurred while delivering another exception, per
/// the Intel double/triple-fault rules. A fault raised while
/// already handling a double fault is a triple fault (CPU reset).
pub fn escalate(cpu: &mut CpuState, bus: &mut dyn CpuBus, first: Exception, second: Exception) -> Result<(), RunError> {
    if first == Exception::DoubleFault {
        return Err(RunError::TripleFault);
    }
    if double_fault_pair(first, second) {
        deliver(cpu, bus, PendingEvent::Exception(Exception::DoubleFault))?;
        return Ok(());
    }
    // Not a recognized double-fault pairing: propagate the second fault as
    // an ordinary delivery (the SDM still requires *some* vector to be
    // injected; only the specific contributory pairings above escalate).
    deliver(cpu, bus, PendingEvent::Exception(second))
}

fn double_fault_pair(first: Exception, second: Exception) -> bool {
    let contributory = |e: &Exception| {
        matches!(
            e,
            Exception::DivideError | Exception::InvalidOpcode | Exception::GeneralProtection(_) | Exception::StackFault(_) | Exception::NotPresent(_)
        )
    };
    (contributory(&first) && (contributory(&second) || matches!(second, Exception::PageFault { .. })))
        || (matches!(first, Exception::PageFault { .. }) && (contributory(&second) || matches!(second, Exception::PageFault { .. })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::Memory;

    fn setup_real_mode_ivt(bus: &mut Memory, vector: u8, segment: u16, offset: u16) {
        bus.write_u16(vector as u64 * 4, offset).unwrap();
        bus.write_u16(vector as u64 * 4 + 2, segment).unwrap();
    }

    #[test]
    fn real_mode_delivery_pushes_flags_cs_ip_and_loads_handler() {
        let mut cpu = CpuState::new(CpuMode::Real);
        cpu.write_gpr64(gpr::RSP, 0x1000);
        cpu.set_rip(0x7C10);
        let mut mem = Memory::new(crate::mem::DEFAULT_MAX_RAM);
        setup_real_mode_ivt(&mut mem, 0x21, 0x0050, 0x0100);

        deliver(&mut cpu, &mut mem, PendingEvent::SoftwareInterrupt(0x21)).unwrap();

        assert_eq!(cpu.segments.cs.selector, 0x0050);
        assert_eq!(cpu.rip(), 0x0100);
        assert_eq!(cpu.read_gpr64(gpr::RSP), 0x1000 - 6);
        assert_eq!(mem.read_u16(cpu.segments.ss.base + 0x1000 - 2).unwrap(), 0x7C10);
    }

    #[test]
    fn double_fault_pair_recognizes_gp_after_gp() {
        assert!(double_fault_pair(Exception::gp0(), Exception::gp0()));
    }

    #[test]
    fn triple_fault_when_fault_occurs_delivering_double_fault() {
        let mut cpu = CpuState::new(CpuMode::Real);
        let mut mem = Memory::new(crate::mem::DEFAULT_MAX_RAM);
        let err = escalate(&mut cpu, &mut mem, Exception::DoubleFault, Exception::gp0()).unwrap_err();
        assert!(matches!(err, RunError::TripleFault));
    }
}
