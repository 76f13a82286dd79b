//! Instruction execution: given one decoded instruction, mutate
//! `CpuState`/memory/ports and report what should happen to RIP next.
//!
//! Handlers are grouped by the SDM's own categories (data movement,
//! arithmetic, logic, control transfer, string ops, stack frame, system) as
//! free functions rather than a 256-slot table, since [`crate::decode`]
//! already resolved the raw opcode byte down to an [`Op`] variant with
//! operands attached.

mod flags;

use crate::bios::BiosFacade;
use crate::decode::{Decoded, JumpTarget, LoopCond, Op, Operand, RepPrefix, SegOverride};
use crate::devices::IoBus;
use crate::error::{Exception, ExitCondition};
use crate::mem::CpuBus;
use crate::state::{
    gpr, CpuMode, CpuState, Segment, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF,
};

pub enum StepOutcome {
    Continue,
    Exit(ExitCondition),
    /// The instruction needs input that isn't available yet (INT 16h
    /// AH=00h/10h with an empty keyboard FIFO): re-run it next step instead
    /// of advancing RIP.
    Suspend,
}

/// A software-raised interrupt (`INT n`, `INT3`, `INTO`). Unlike a CPU
/// [`Exception`], this carries no error code and always goes through the
/// normal IDT/IVT gate lookup rather than the synthetic BIOS escape -- the
/// runtime loop hands it to [`crate::interrupts::deliver`] as a
/// `PendingEvent::SoftwareInterrupt`.
#[derive(Debug, Clone, Copy)]
pub struct SoftwareInterrupt(pub u8);

fn mask(width: u8) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn segment_base(cpu: &CpuState, seg: SegOverride, default: &Segment) -> u64 {
    match seg {
        SegOverride::None => default.base,
        SegOverride::Cs => cpu.segments.cs.base,
        SegOverride::Ds => cpu.segments.ds.base,
        SegOverride::Es => cpu.segments.es.base,
        SegOverride::Fs => cpu.segments.fs.base,
        SegOverride::Gs => cpu.segments.gs.base,
        SegOverride::Ss => cpu.segments.ss.base,
    }
}

/// Resolve a memory [`Operand`] to a linear address. `next_rip` is the
/// address right after the whole instruction, needed for RIP-relative
/// addressing.
fn effective_address(cpu: &CpuState, op: &Operand, next_rip: u64, rex: bool) -> u64 {
    match *op {
        Operand::Memory {
            seg,
            base,
            index,
            disp,
            address_size,
            rip_relative,
        } => {
            if rip_relative {
                return next_rip.wrapping_add(disp as u64);
            }
            let default_seg = match base {
                Some(b) if b == gpr::RSP as u8 || b == gpr::RBP as u8 => &cpu.segments.ss,
                _ => &cpu.segments.ds,
            };
            let mut addr: u64 = 0;
            if let Some(b) = base {
                addr = addr.wrapping_add(cpu.read_reg(b as usize, address_size, rex));
            }
            if let Some((idx, scale)) = index {
                addr = addr.wrapping_add(cpu.read_reg(idx as usize, address_size, rex) * scale as u64);
            }
            addr = addr.wrapping_add(disp as u64);
            let addr = addr & mask(address_size);
            segment_base(cpu, seg, default_seg).wrapping_add(addr)
        }
        _ => panic!("effective_address called on a non-memory operand"),
    }
}

fn read_operand(cpu: &CpuState, bus: &mut dyn CpuBus, op: &Operand, width: u8, next_rip: u64, rex: bool) -> Result<u64, Exception> {
    match *op {
        Operand::Register(idx, _) => Ok(cpu.read_reg(idx as usize, width, rex)),
        Operand::Immediate(imm) => Ok(imm as u64 & mask(width)),
        Operand::Memory { .. } => {
            let addr = effective_address(cpu, op, next_rip, rex);
            bus.read(addr, width)
        }
    }
}

fn write_operand(cpu: &mut CpuState, bus: &mut dyn CpuBus, op: &Operand, width: u8, value: u64, next_rip: u64, rex: bool) -> Result<(), Exception> {
    match *op {
        Operand::Register(idx, _) => {
            cpu.write_reg(idx as usize, width, rex, value);
            Ok(())
        }
        Operand::Immediate(_) => panic!("attempted to write to an immediate operand"),
        Operand::Memory { .. } => {
            let addr = effective_address(cpu, op, next_rip, rex);
            bus.write(addr, width, value)
        }
    }
}

fn operand_width(op: &Operand, fallback: u8) -> u8 {
    match op {
        Operand::Register(_, w) => *w,
        _ => fallback,
    }
}

fn evaluate_cond(cpu: &CpuState, cond: u8) -> bool {
    match cond & 0xF {
        0x0 => cpu.flag(FLAG_OF),
        0x1 => !cpu.flag(FLAG_OF),
        0x2 => cpu.flag(FLAG_CF),
        0x3 => !cpu.flag(FLAG_CF),
        0x4 => cpu.flag(FLAG_ZF),
        0x5 => !cpu.flag(FLAG_ZF),
        0x6 => cpu.flag(FLAG_CF) || cpu.flag(FLAG_ZF),
        0x7 => !cpu.flag(FLAG_CF) && !cpu.flag(FLAG_ZF),
        0x8 => cpu.flag(FLAG_SF),
        0x9 => !cpu.flag(FLAG_SF),
        0xA => cpu.flag(FLAG_PF),
        0xB => !cpu.flag(FLAG_PF),
        0xC => cpu.flag(FLAG_SF) != cpu.flag(FLAG_OF),
        0xD => cpu.flag(FLAG_SF) == cpu.flag(FLAG_OF),
        0xE => cpu.flag(FLAG_ZF) || (cpu.flag(FLAG_SF) != cpu.flag(FLAG_OF)),
        0xF => !cpu.flag(FLAG_ZF) && (cpu.flag(FLAG_SF) == cpu.flag(FLAG_OF)),
        _ => unreachable!(),
    }
}

fn push(cpu: &mut CpuState, bus: &mut dyn CpuBus, width: u8, value: u64) -> Result<(), Exception> {
    let size = (width / 8) as u64;
    let new_rsp = cpu.read_gpr64(gpr::RSP).wrapping_sub(size);
    let addr = cpu.segments.ss.base + (new_rsp & mask(cpu.segments.ss.stack_address_size()));
    bus.write(addr, width, value)?;
    cpu.write_gpr64(gpr::RSP, new_rsp);
    Ok(())
}

fn pop(cpu: &mut CpuState, bus: &mut dyn CpuBus, width: u8) -> Result<u64, Exception> {
    let rsp = cpu.read_gpr64(gpr::RSP);
    let addr = cpu.segments.ss.base + (rsp & mask(cpu.segments.ss.stack_address_size()));
    let v = bus.read(addr, width)?;
    cpu.write_gpr64(gpr::RSP, rsp.wrapping_add((width / 8) as u64));
    Ok(v)
}

/// Execute one decoded instruction. `rip_after_fetch` is the address right
/// after the instruction bytes; on a normal (non-control-flow) instruction
/// the caller advances RIP there, on a control-flow instruction this
/// function sets RIP directly and the caller must not re-advance it.
pub struct ExecOutput {
    pub outcome: StepOutcome,
    pub rip_set_explicitly: bool,
    pub software_interrupt: Option<SoftwareInterrupt>,
}

pub fn execute(
    decoded: &Decoded,
    rip_after_fetch: u64,
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    io: &mut dyn IoBus,
    bios: &mut BiosFacade,
) -> Result<ExecOutput, Exception> {
    let rex = decoded.rex_present;
    let w = decoded.operand_size;
    let next_rip = rip_after_fetch;

    macro_rules! r {
        ($op:expr, $width:expr) => {
            read_operand(cpu, bus, $op, $width, next_rip, rex)?
        };
    }
    macro_rules! wr {
        ($op:expr, $width:expr, $val:expr) => {
            write_operand(cpu, bus, $op, $width, $val, next_rip, rex)?
        };
    }

    let mut rip_set_explicitly = false;
    let mut outcome = StepOutcome::Continue;
    let mut software_interrupt = None;

    match &decoded.op {
        Op::Mov { dst, src } => {
            let width = operand_width(dst, w);
            let v = r!(src, width);
            wr!(dst, width, v);
        }
        Op::Movzx { dst, src } => {
            let src_width = operand_width(src, 8);
            let v = r!(src, src_width);
            wr!(dst, w, v);
        }
        Op::Movsx { dst, src } => {
            let src_width = operand_width(src, 8);
            let v = r!(src, src_width) as i64;
            let signed = match src_width {
                8 => v as i8 as i64,
                16 => v as i16 as i64,
                32 => v as i32 as i64,
                _ => v,
            };
            wr!(dst, w, signed as u64);
        }
        Op::Lea { dst, src } => {
            let addr = effective_address(cpu, src, next_rip, rex);
            wr!(dst, w, addr);
        }
        Op::Xchg { a, b } => {
            let width = operand_width(a, w);
            let va = r!(a, width);
            let vb = r!(b, width);
            wr!(a, width, vb);
            wr!(b, width, va);
        }
        Op::Cmovcc { cond, dst, src } => {
            if evaluate_cond(cpu, *cond) {
                let v = r!(src, w);
                wr!(dst, w, v);
            }
        }
        Op::Push { src } => {
            let width = operand_width(src, w);
            let v = r!(src, width);
            push(cpu, bus, width, v)?;
        }
        Op::Pop { dst } => {
            let width = operand_width(dst, w);
            let v = pop(cpu, bus, width)?;
            wr!(dst, width, v);
        }
        Op::Pusha => {
            let order = [gpr::RAX, gpr::RCX, gpr::RDX, gpr::RBX, gpr::RSP, gpr::RBP, gpr::RSI, gpr::RDI];
            let original_sp = cpu.read_gpr64(gpr::RSP);
            for reg in order {
                let v = if reg == gpr::RSP { original_sp } else { cpu.read_reg(reg, w, rex) };
                push(cpu, bus, w, v)?;
            }
        }
        Op::Popa => {
            let order = [gpr::RDI, gpr::RSI, gpr::RBP, gpr::RSP, gpr::RBX, gpr::RDX, gpr::RCX, gpr::RAX];
            for reg in order {
                let v = pop(cpu, bus, w)?;
                if reg != gpr::RSP {
                    cpu.write_reg(reg, w, rex, v);
                }
            }
        }
        Op::Pushf => push(cpu, bus, w.min(32).max(16), cpu.rflags())?,
        Op::Popf => {
            let v = pop(cpu, bus, w.min(32).max(16))?;
            cpu.set_rflags(v);
        }
        Op::Add { dst, src } => binop(cpu, bus, dst, src, w, next_rip, rex, |c, a, b, wd| flags::add(c, a, b, 0, wd))?,
        Op::Adc { dst, src } => {
            let carry = cpu.flag(FLAG_CF) as u64;
            binop(cpu, bus, dst, src, w, next_rip, rex, move |c, a, b, wd| flags::add(c, a, b, carry, wd))?
        }
        Op::Sub { dst, src } => binop(cpu, bus, dst, src, w, next_rip, rex, |c, a, b, wd| flags::sub(c, a, b, 0, wd))?,
        Op::Sbb { dst, src } => {
            let borrow = cpu.flag(FLAG_CF) as u64;
            binop(cpu, bus, dst, src, w, next_rip, rex, move |c, a, b, wd| flags::sub(c, a, b, borrow, wd))?
        }
        Op::Inc { dst } => unop(cpu, bus, dst, w, next_rip, rex, flags::inc)?,
        Op::Dec { dst } => unop(cpu, bus, dst, w, next_rip, rex, flags::dec)?,
        Op::Neg { dst } => unop(cpu, bus, dst, w, next_rip, rex, flags::neg)?,
        Op::Cmp { a, b } => {
            let width = operand_width(a, w);
            let va = r!(a, width);
            let vb = r!(b, width);
            flags::sub(cpu, va, vb, 0, width);
        }
        Op::And { dst, src } => binop(cpu, bus, dst, src, w, next_rip, rex, |c, a, b, wd| flags::logic(c, a & b, wd))?,
        Op::Or { dst, src } => binop(cpu, bus, dst, src, w, next_rip, rex, |c, a, b, wd| flags::logic(c, a | b, wd))?,
        Op::Xor { dst, src } => binop(cpu, bus, dst, src, w, next_rip, rex, |c, a, b, wd| flags::logic(c, a ^ b, wd))?,
        Op::Not { dst } => {
            let width = operand_width(dst, w);
            let v = r!(dst, width);
            wr!(dst, width, !v & mask(width));
        }
        Op::Test { a, b } => {
            let width = operand_width(a, w);
            let va = r!(a, width);
            let vb = r!(b, width);
            flags::logic(cpu, va & vb, width);
        }
        Op::Shl { dst, count } => shift(cpu, bus, dst, count, w, next_rip, rex, ShiftKind::Shl)?,
        Op::Shr { dst, count } => shift(cpu, bus, dst, count, w, next_rip, rex, ShiftKind::Shr)?,
        Op::Sar { dst, count } => shift(cpu, bus, dst, count, w, next_rip, rex, ShiftKind::Sar)?,
        Op::Rol { dst, count } => shift(cpu, bus, dst, count, w, next_rip, rex, ShiftKind::Rol)?,
        Op::Ror { dst, count } => shift(cpu, bus, dst, count, w, next_rip, rex, ShiftKind::Ror)?,
        Op::Rcl { dst, count } => shift(cpu, bus, dst, count, w, next_rip, rex, ShiftKind::Rcl)?,
        Op::Rcr { dst, count } => shift(cpu, bus, dst, count, w, next_rip, rex, ShiftKind::Rcr)?,
        Op::Shld { dst, src, count } => shift_double(cpu, bus, dst, src, count, w, next_rip, rex, true)?,
        Op::Shrd { dst, src, count } => shift_double(cpu, bus, dst, src, count, w, next_rip, rex, false)?,
        Op::Mul { src } => mul_unsigned(cpu, bus, src, w, next_rip, rex)?,
        Op::Imul1 { src } => imul_one_operand(cpu, bus, src, w, next_rip, rex)?,
        Op::Imul2 { dst, src } => {
            let width = operand_width(dst, w);
            let a = r!(dst, width) as i64;
            let b = r!(src, width) as i64;
            let (result, overflow) = imul_checked(a, b, width);
            wr!(dst, width, result as u64 & mask(width));
            cpu.set_flag(FLAG_CF, overflow);
            cpu.set_flag(FLAG_OF, overflow);
        }
        Op::Imul3 { dst, src, imm } => {
            let width = operand_width(dst, w);
            let a = r!(src, width) as i64;
            let (result, overflow) = imul_checked(a, *imm, width);
            wr!(dst, width, result as u64 & mask(width));
            cpu.set_flag(FLAG_CF, overflow);
            cpu.set_flag(FLAG_OF, overflow);
        }
        Op::Div { src } => div_unsigned(cpu, bus, src, w, next_rip, rex)?,
        Op::Idiv { src } => div_signed(cpu, bus, src, w, next_rip, rex)?,
        Op::Jmp { target } => {
            jump_to(cpu, bus, target, next_rip, rex, w)?;
            rip_set_explicitly = true;
        }
        Op::Jcc { cond, target } => {
            if evaluate_cond(cpu, *cond) {
                jump_to(cpu, bus, target, next_rip, rex, w)?;
                rip_set_explicitly = true;
            }
        }
        Op::Call { target } => {
            push(cpu, bus, w.max(16), next_rip)?;
            jump_to(cpu, bus, target, next_rip, rex, w)?;
            rip_set_explicitly = true;
        }
        Op::CallFar { seg, offset } => {
            push(cpu, bus, w.max(16), cpu.segments.cs.selector as u64)?;
            push(cpu, bus, w.max(16), next_rip)?;
            cpu.segments.cs = Segment::real_mode(*seg);
            cpu.set_rip(*offset);
            rip_set_explicitly = true;
        }
        Op::Ret { imm16 } => {
            let width = w.max(16);
            let ret_addr = pop(cpu, bus, width)?;
            if *imm16 != 0 {
                let rsp = cpu.read_gpr64(gpr::RSP) + *imm16 as u64;
                cpu.write_gpr64(gpr::RSP, rsp);
            }
            cpu.set_rip(ret_addr);
            rip_set_explicitly = true;
        }
        Op::Retf { imm16 } => {
            let width = w.max(16);
            let ret_addr = pop(cpu, bus, width)?;
            let cs_sel = pop(cpu, bus, width)? as u16;
            if *imm16 != 0 {
                let rsp = cpu.read_gpr64(gpr::RSP) + *imm16 as u64;
                cpu.write_gpr64(gpr::RSP, rsp);
            }
            cpu.segments.cs = Segment::real_mode(cs_sel);
            cpu.set_rip(ret_addr);
            rip_set_explicitly = true;
        }
        Op::Loop { cond, rel } => {
            let count_width = if decoded.address_size == 16 { 16 } else { 64 };
            let count = cpu.read_reg(gpr::RCX, count_width, rex).wrapping_sub(1);
            cpu.write_reg(gpr::RCX, count_width, rex, count);
            let take = match cond {
                LoopCond::Always => count != 0,
                LoopCond::Zero => count != 0 && cpu.flag(FLAG_ZF),
                LoopCond::NotZero => count != 0 && !cpu.flag(FLAG_ZF),
            };
            if take {
                cpu.set_rip(next_rip.wrapping_add(*rel as u64));
                rip_set_explicitly = true;
            }
        }
        Op::Jcxz { rel } => {
            let count_width = if decoded.address_size == 16 { 16 } else { 64 };
            let count = cpu.read_reg(gpr::RCX, count_width, rex);
            if count == 0 {
                cpu.set_rip(next_rip.wrapping_add(*rel as u64));
                rip_set_explicitly = true;
            }
        }
        Op::Iret => {
            let width = w.max(16);
            let ret_addr = pop(cpu, bus, width)?;
            let cs_sel = pop(cpu, bus, width)? as u16;
            let new_flags = pop(cpu, bus, width)?;
            cpu.segments.cs = Segment::real_mode(cs_sel);
            cpu.set_rip(ret_addr);
            cpu.set_rflags(new_flags);
            rip_set_explicitly = true;
        }
        Op::MovsString => string_op(cpu, bus, decoded.rep, decoded.address_size, rex, StringOp::Movs)?,
        Op::CmpsString => string_op(cpu, bus, decoded.rep, decoded.address_size, rex, StringOp::Cmps)?,
        Op::StosString => string_op(cpu, bus, decoded.rep, decoded.address_size, rex, StringOp::Stos { width: w })?,
        Op::LodsString => string_op(cpu, bus, decoded.rep, decoded.address_size, rex, StringOp::Lods { width: w })?,
        Op::ScasString => string_op(cpu, bus, decoded.rep, decoded.address_size, rex, StringOp::Scas { width: w })?,
        Op::InsString => string_op(cpu, bus, decoded.rep, decoded.address_size, rex, StringOp::Ins { width: w, io })?,
        Op::OutsString => string_op(cpu, bus, decoded.rep, decoded.address_size, rex, StringOp::Outs { width: w, io })?,
        Op::Enter { alloc, nesting } => {
            let _ = nesting; // nested-procedure frame copying is out of scope
            push(cpu, bus, w.max(16), cpu.read_gpr64(gpr::RBP))?;
            let frame_temp = cpu.read_gpr64(gpr::RSP);
            let rsp = frame_temp.wrapping_sub(*alloc as u64);
            cpu.write_gpr64(gpr::RBP, frame_temp);
            cpu.write_gpr64(gpr::RSP, rsp);
        }
        Op::Leave => {
            let rbp = cpu.read_gpr64(gpr::RBP);
            cpu.write_gpr64(gpr::RSP, rbp);
            let v = pop(cpu, bus, w.max(16))?;
            cpu.write_gpr64(gpr::RBP, v);
        }
        Op::Int { vector } => {
            cpu.set_rip(next_rip);
            rip_set_explicitly = true;
            software_interrupt = Some(SoftwareInterrupt(*vector));
        }
        Op::Int3 => {
            cpu.set_rip(next_rip);
            rip_set_explicitly = true;
            software_interrupt = Some(SoftwareInterrupt(3));
        }
        Op::Into => {
            if cpu.flag(FLAG_OF) {
                cpu.set_rip(next_rip);
                rip_set_explicitly = true;
                software_interrupt = Some(SoftwareInterrupt(4));
            }
        }
        Op::Hlt => {
            if cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            cpu.halted = true;
        }
        Op::Cli => {
            if cpu.iopl() < cpu.cpl() && cpu.mode != CpuMode::Real {
                return Err(Exception::gp0());
            }
            cpu.set_flag(FLAG_IF, false);
        }
        Op::Sti => {
            if cpu.iopl() < cpu.cpl() && cpu.mode != CpuMode::Real {
                return Err(Exception::gp0());
            }
            cpu.set_flag(FLAG_IF, true);
        }
        Op::Clc => cpu.set_flag(FLAG_CF, false),
        Op::Stc => cpu.set_flag(FLAG_CF, true),
        Op::Cmc => cpu.set_flag(FLAG_CF, !cpu.flag(FLAG_CF)),
        Op::Cld => cpu.set_flag(FLAG_DF, false),
        Op::Std => cpu.set_flag(FLAG_DF, true),
        Op::Lgdt { src } => {
            let addr = effective_address(cpu, src, next_rip, rex);
            let limit = bus.read_u16(addr)?;
            let base = bus.read_u32(addr + 2)? as u64;
            cpu.tables.gdtr.limit = limit;
            cpu.tables.gdtr.base = base;
        }
        Op::Lidt { src } => {
            let addr = effective_address(cpu, src, next_rip, rex);
            let limit = bus.read_u16(addr)?;
            let base = bus.read_u32(addr + 2)? as u64;
            cpu.tables.idtr.limit = limit;
            cpu.tables.idtr.base = base;
        }
        Op::Sgdt { dst } => {
            let addr = effective_address(cpu, dst, next_rip, rex);
            bus.write_u16(addr, cpu.tables.gdtr.limit)?;
            bus.write_u32(addr + 2, cpu.tables.gdtr.base as u32)?;
        }
        Op::Sidt { dst } => {
            let addr = effective_address(cpu, dst, next_rip, rex);
            bus.write_u16(addr, cpu.tables.idtr.limit)?;
            bus.write_u32(addr + 2, cpu.tables.idtr.base as u32)?;
        }
        Op::Lmsw { src } => {
            if cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let v = r!(src, 16);
            cpu.cr0 = (cpu.cr0 & !0xF) | (v & 0xF);
            cpu.sync_mode();
        }
        Op::Smsw { dst } => {
            let width = operand_width(dst, 16);
            wr!(dst, width, cpu.cr0 & mask(width));
        }
        Op::MovToCr { cr, src } => {
            if cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let v = r!(src, 64);
            match cr {
                0 => cpu.cr0 = v,
                2 => cpu.cr2 = v,
                3 => cpu.cr3 = v,
                4 => cpu.cr4 = v,
                _ => return Err(Exception::InvalidOpcode),
            }
            cpu.sync_mode();
        }
        Op::MovFromCr { dst, cr } => {
            if cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let v = match cr {
                0 => cpu.cr0,
                2 => cpu.cr2,
                3 => cpu.cr3,
                4 => cpu.cr4,
                _ => return Err(Exception::InvalidOpcode),
            };
            wr!(dst, 64, v);
        }
        Op::MovToDr { dr: _, src: _ } | Op::MovFromDr { dst: _, dr: _ } => {
            if cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            // Debug registers are accepted and stored nowhere: this emulator
            // has no hardware breakpoint model.
        }
        Op::Wrmsr => {
            if cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            handle_wrmsr(cpu);
        }
        Op::Rdmsr => {
            if cpu.cpl() != 0 {
                return Err(Exception::gp0());
            }
            handle_rdmsr(cpu);
        }
        Op::In { port, width } => {
            let p = r!(port, 16) as u16;
            check_io_privilege(cpu)?;
            let v = io.in_port(p, *width);
            let dst = Operand::Register(gpr::RAX as u8, *width);
            wr!(&dst, *width, v as u64);
        }
        Op::Out { port, width } => {
            let p = r!(port, 16) as u16;
            check_io_privilege(cpu)?;
            let v = cpu.read_reg(gpr::RAX, *width, rex) as u32;
            io.out_port(p, *width, v);
        }
        Op::Nop => {}
        Op::Cpuid => {
            // Minimal identification leaf; no feature-flag fidelity modeled.
            cpu.write_gpr32(gpr::RAX, 0x0000_0001);
            cpu.write_gpr32(gpr::RBX, 0x6F727478); // "xtro" — arbitrary vendor bytes
            cpu.write_gpr32(gpr::RCX, 0);
            cpu.write_gpr32(gpr::RDX, 0);
        }
        Op::Cbw => {
            let al = cpu.read_reg(gpr::RAX, 8, rex) as i8 as i64;
            cpu.write_reg(gpr::RAX, 16, rex, al as u64);
        }
        Op::Cwd => {
            let ax = cpu.read_reg(gpr::RAX, w, rex) as i64;
            let sign = if sign_bit(ax as u64, w) { mask(w) } else { 0 };
            cpu.write_reg(gpr::RDX, w, rex, sign);
        }
        Op::BiosCall { vector } => {
            if let Some(exit) = bios.dispatch(*vector, cpu, bus)? {
                outcome = StepOutcome::Exit(exit);
            }
        }
        Op::DebugBreak => return Err(Exception::Debug),
    }

    Ok(ExecOutput {
        outcome,
        rip_set_explicitly,
        software_interrupt,
    })
}

fn sign_bit(v: u64, width: u8) -> bool {
    v & (1u64 << (width - 1)) != 0
}

fn check_io_privilege(cpu: &CpuState) -> Result<(), Exception> {
    if cpu.mode == CpuMode::Real {
        return Ok(());
    }
    if cpu.iopl() < cpu.cpl() {
        return Err(Exception::gp0());
    }
    Ok(())
}

fn handle_wrmsr(_cpu: &mut CpuState) {
    // No MSRs beyond EFER are modeled.
}

fn handle_rdmsr(cpu: &mut CpuState) {
    let ecx = cpu.read_gpr32(gpr::RCX);
    let value = if ecx == 0xC000_0080 { cpu.efer } else { 0 };
    cpu.write_gpr32(gpr::RAX, value as u32);
    cpu.write_gpr32(gpr::RDX, (value >> 32) as u32);
}

fn binop(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: &Operand,
    src: &Operand,
    w: u8,
    next_rip: u64,
    rex: bool,
    f: impl FnOnce(&mut CpuState, u64, u64, u8) -> u64,
) -> Result<(), Exception> {
    let width = operand_width(dst, w);
    let a = read_operand(cpu, bus, dst, width, next_rip, rex)?;
    let b = read_operand(cpu, bus, src, width, next_rip, rex)?;
    let result = f(cpu, a, b, width);
    write_operand(cpu, bus, dst, width, result, next_rip, rex)
}

fn unop(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: &Operand,
    w: u8,
    next_rip: u64,
    rex: bool,
    f: impl FnOnce(&mut CpuState, u64, u8) -> u64,
) -> Result<(), Exception> {
    let width = operand_width(dst, w);
    let a = read_operand(cpu, bus, dst, width, next_rip, rex)?;
    let result = f(cpu, a, width);
    write_operand(cpu, bus, dst, width, result, next_rip, rex)
}

enum ShiftKind {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
}

fn shift(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: &Operand,
    count_op: &Operand,
    w: u8,
    next_rip: u64,
    rex: bool,
    kind: ShiftKind,
) -> Result<(), Exception> {
    let width = operand_width(dst, w);
    let count = (read_operand(cpu, bus, count_op, 8, next_rip, rex)? as u32) % mod_for(width, &kind);
    if count == 0 {
        return Ok(());
    }
    let v = read_operand(cpu, bus, dst, width, next_rip, rex)?;
    let result = apply_shift(cpu, v, count, width, kind);
    write_operand(cpu, bus, dst, width, result, next_rip, rex)
}

fn mod_for(width: u8, kind: &ShiftKind) -> u32 {
    match kind {
        ShiftKind::Rcl | ShiftKind::Rcr => width as u32 + 1,
        _ => 32, // masked to 5 bits (6 in 64-bit mode) per SDM; 32 is a safe superset for this emulator's widths
    }
    .min(if width == 64 { 64 } else { 32 })
}

fn apply_shift(cpu: &mut CpuState, v: u64, count: u32, width: u8, kind: ShiftKind) -> u64 {
    let m = mask(width);
    let v = v & m;
    match kind {
        ShiftKind::Shl => {
            let result = (v << count) & m;
            let cf = count <= width as u32 && (v & (1 << (width as u32 - count))) != 0;
            cpu.set_flag(FLAG_CF, cf);
            if count == 1 {
                cpu.set_flag(FLAG_OF, sign_bit(result, width) != (cf));
            }
            flags::set_result_flags(cpu, result, width);
            result
        }
        ShiftKind::Shr => {
            let cf = count >= 1 && (v >> (count - 1)) & 1 != 0;
            let result = v >> count;
            cpu.set_flag(FLAG_CF, cf);
            if count == 1 {
                cpu.set_flag(FLAG_OF, sign_bit(v, width));
            }
            flags::set_result_flags(cpu, result, width);
            result
        }
        ShiftKind::Sar => {
            let signed = sign_extend64(v, width);
            let cf = count >= 1 && (v >> (count - 1)) & 1 != 0;
            let result = ((signed >> count.min(63)) as u64) & m;
            cpu.set_flag(FLAG_CF, cf);
            if count == 1 {
                cpu.set_flag(FLAG_OF, false);
            }
            flags::set_result_flags(cpu, result, width);
            result
        }
        ShiftKind::Rol => {
            let n = width as u32;
            let c = count % n;
            let result = ((v << c) | (v >> (n - c))) & m;
            cpu.set_flag(FLAG_CF, result & 1 != 0);
            if count == 1 {
                cpu.set_flag(FLAG_OF, sign_bit(result, width) != (result & 1 != 0));
            }
            result
        }
        ShiftKind::Ror => {
            let n = width as u32;
            let c = count % n;
            let result = ((v >> c) | (v << (n - c))) & m;
            cpu.set_flag(FLAG_CF, sign_bit(result, width));
            if count == 1 {
                let bit_n2 = (result >> (width as u32 - 2)) & 1 != 0;
                cpu.set_flag(FLAG_OF, sign_bit(result, width) != bit_n2);
            }
            result
        }
        ShiftKind::Rcl => {
            let n = width as u32 + 1;
            let c = count % n;
            let mut wide = (v << 1) | cpu.flag(FLAG_CF) as u64;
            for _ in 1..c {
                let carry = (wide >> width) & 1;
                wide = ((wide << 1) | carry) & ((m << 1) | 1);
            }
            let new_cf = (wide >> width) & 1 != 0;
            let result = wide & m;
            cpu.set_flag(FLAG_CF, new_cf);
            result
        }
        ShiftKind::Rcr => {
            let n = width as u32 + 1;
            let c = count % n;
            let mut wide = v | ((cpu.flag(FLAG_CF) as u64) << width);
            for _ in 0..c {
                let carry = wide & 1;
                wide = (wide >> 1) | (carry << width);
            }
            let new_cf = (wide >> width) & 1 != 0;
            let result = wide & m;
            cpu.set_flag(FLAG_CF, new_cf);
            result
        }
    }
}

fn sign_extend64(v: u64, width: u8) -> i64 {
    let shift = 64 - width;
    ((v << shift) as i64) >> shift
}

fn shift_double(
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
    dst: &Operand,
    src: &Operand,
    count_op: &Operand,
    w: u8,
    next_rip: u64,
    rex: bool,
    left: bool,
) -> Result<(), Exception> {
    let width = operand_width(dst, w);
    let count = (read_operand(cpu, bus, count_op, 8, next_rip, rex)? as u32) % width as u32;
    if count == 0 {
        return Ok(());
    }
    let d = read_operand(cpu, bus, dst, width, next_rip, rex)?;
    let s = read_operand(cpu, bus, src, width, next_rip, rex)?;
    let wide = if left { ((d as u128) << width) | s as u128 } else { ((s as u128) << width) | d as u128 };
    let result = if left {
        ((wide << count) >> width) as u64 & mask(width)
    } else {
        (wide >> count) as u64 & mask(width)
    };
    let cf = if left {
        count as u64 <= width as u64 && (d >> (width as u32 - count)) & 1 != 0
    } else {
        (d >> (count - 1)) & 1 != 0
    };
    cpu.set_flag(FLAG_CF, cf);
    flags::set_result_flags(cpu, result, width);
    write_operand(cpu, bus, dst, width, result, next_rip, rex)
}

fn mul_unsigned(cpu: &mut CpuState, bus: &mut dyn CpuBus, src: &Operand, w: u8, next_rip: u64, rex: bool) -> Result<(), Exception> {
    let width = operand_width(src, w);
    let a = cpu.read_reg(gpr::RAX, width, rex);
    let b = read_operand(cpu, bus, src, width, next_rip, rex)?;
    let product = a as u128 * b as u128;
    let low = product as u64 & mask(width);
    let high = (product >> width) as u64 & mask(width);
    cpu.write_reg(gpr::RAX, width, rex, low);
    if width == 8 {
        cpu.write_reg(gpr::RAX, 16, rex, (high << 8) | low);
    } else {
        cpu.write_reg(gpr::RDX, width, rex, high);
    }
    let overflow = high != 0;
    cpu.set_flag(FLAG_CF, overflow);
    cpu.set_flag(FLAG_OF, overflow);
    Ok(())
}

fn imul_one_operand(cpu: &mut CpuState, bus: &mut dyn CpuBus, src: &Operand, w: u8, next_rip: u64, rex: bool) -> Result<(), Exception> {
    let width = operand_width(src, w);
    let a = cpu.read_reg(gpr::RAX, width, rex) as i64;
    let a = sign_extend64(a as u64, width);
    let b = read_operand(cpu, bus, src, width, next_rip, rex)? as i64;
    let b = sign_extend64(b as u64, width);
    let product = a as i128 * b as i128;
    let low = (product as u128 & mask(width) as u128) as u64;
    let high = ((product as u128) >> width) as u64 & mask(width);
    cpu.write_reg(gpr::RAX, width, rex, low);
    if width == 8 {
        cpu.write_reg(gpr::RAX, 16, rex, (high << 8) | low);
    } else {
        cpu.write_reg(gpr::RDX, width, rex, high);
    }
    let sign_extended_low = sign_extend64(low, width);
    let overflow = product != sign_extended_low as i128;
    cpu.set_flag(FLAG_CF, overflow);
    cpu.set_flag(FLAG_OF, overflow);
    Ok(())
}

fn imul_checked(a: i64, b: i64, width: u8) -> (i64, bool) {
    let m = mask(width) as i128;
    let product = a as i128 * b as i128;
    let truncated = (product & m) as u64;
    let result = sign_extend64(truncated, width);
    (result, product != result as i128)
}

fn div_unsigned(cpu: &mut CpuState, bus: &mut dyn CpuBus, src: &Operand, w: u8, next_rip: u64, rex: bool) -> Result<(), Exception> {
    let width = operand_width(src, w);
    let divisor = read_operand(cpu, bus, src, width, next_rip, rex)?;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend: u128 = if width == 8 {
        cpu.read_reg(gpr::RAX, 16, rex) as u128
    } else {
        ((cpu.read_reg(gpr::RDX, width, rex) as u128) << width) | cpu.read_reg(gpr::RAX, width, rex) as u128
    };
    let quotient = dividend / divisor as u128;
    let remainder = dividend % divisor as u128;
    if quotient > mask(width) as u128 {
        return Err(Exception::DivideError);
    }
    if width == 8 {
        cpu.write_reg(gpr::RAX, 16, rex, ((remainder as u64) << 8) | quotient as u64);
    } else {
        cpu.write_reg(gpr::RAX, width, rex, quotient as u64);
        cpu.write_reg(gpr::RDX, width, rex, remainder as u64);
    }
    Ok(())
}

fn div_signed(cpu: &mut CpuState, bus: &mut dyn CpuBus, src: &Operand, w: u8, next_rip: u64, rex: bool) -> Result<(), Exception> {
    let width = operand_width(src, w);
    let divisor = read_operand(cpu, bus, src, width, next_rip, rex)? as i64;
    let divisor = sign_extend64(divisor as u64, width);
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend: i128 = if width == 8 {
        cpu.read_reg(gpr::RAX, 16, rex) as i16 as i128
    } else {
        let hi = sign_extend64(cpu.read_reg(gpr::RDX, width, rex), width) as i128;
        let lo = cpu.read_reg(gpr::RAX, width, rex) as i128 & mask(width) as i128;
        (hi << width) | lo
    };
    let quotient = dividend / divisor as i128;
    let remainder = dividend % divisor as i128;
    let qi = quotient as i64;
    if sign_extend64(qi as u64 & mask(width), width) as i128 != quotient {
        return Err(Exception::DivideError);
    }
    if width == 8 {
        cpu.write_reg(gpr::RAX, 16, rex, (((remainder as u64) & 0xFF) << 8) | (qi as u64 & 0xFF));
    } else {
        cpu.write_reg(gpr::RAX, width, rex, qi as u64 & mask(width));
        cpu.write_reg(gpr::RDX, width, rex, remainder as u64 & mask(width));
    }
    Ok(())
}

fn jump_to(cpu: &mut CpuState, bus: &mut dyn CpuBus, target: &JumpTarget, next_rip: u64, rex: bool, w: u8) -> Result<(), Exception> {
    match target {
        JumpTarget::Relative(rel) => {
            let width_mask = if w == 16 { mask(16) } else { u64::MAX };
            cpu.set_rip(next_rip.wrapping_add(*rel as u64) & width_mask | (next_rip & !width_mask));
        }
        JumpTarget::Absolute(op) => {
            let v = read_operand(cpu, bus, op, w, next_rip, rex)?;
            cpu.set_rip(v);
        }
    }
    Ok(())
}

enum StringOp<'a> {
    Movs,
    Cmps,
    Stos { width: u8 },
    Lods { width: u8 },
    Scas { width: u8 },
    Ins { width: u8, io: &'a mut dyn IoBus },
    Outs { width: u8, io: &'a mut dyn IoBus },
}

fn string_op(cpu: &mut CpuState, bus: &mut dyn CpuBus, rep: RepPrefix, address_size: u8, rex: bool, op: StringOp<'_>) -> Result<(), Exception> {
    let step = |cpu: &CpuState, width: u8| -> u64 {
        let n = (width / 8) as i64;
        if cpu.flag(FLAG_DF) {
            (-n) as u64
        } else {
            n as u64
        }
    };

    let mut iterations: u64 = match rep {
        RepPrefix::None => 1,
        _ => cpu.read_reg(gpr::RCX, address_size, rex),
    };

    let mut op = op;
    while iterations > 0 {
        let si = cpu.segments.ds.base + cpu.read_reg(gpr::RSI, address_size, rex);
        let di = cpu.segments.es.base + cpu.read_reg(gpr::RDI, address_size, rex);
        let mut zf_for_repeat_check: Option<bool> = None;
        match &mut op {
            StringOp::Movs => {
                let v = bus.read_u8(si)?;
                bus.write_u8(di, v)?;
                advance_index(cpu, gpr::RSI, address_size, rex, step(cpu, 8));
                advance_index(cpu, gpr::RDI, address_size, rex, step(cpu, 8));
            }
            StringOp::Cmps => {
                let a = bus.read_u8(si)?;
                let b = bus.read_u8(di)?;
                flags::sub(cpu, a as u64, b as u64, 0, 8);
                zf_for_repeat_check = Some(cpu.flag(FLAG_ZF));
                advance_index(cpu, gpr::RSI, address_size, rex, step(cpu, 8));
                advance_index(cpu, gpr::RDI, address_size, rex, step(cpu, 8));
            }
            StringOp::Stos { width } => {
                let v = cpu.read_reg(gpr::RAX, *width, rex);
                bus.write(di, *width, v)?;
                advance_index(cpu, gpr::RDI, address_size, rex, step(cpu, *width));
            }
            StringOp::Lods { width } => {
                let v = bus.read(si, *width)?;
                cpu.write_reg(gpr::RAX, *width, rex, v);
                advance_index(cpu, gpr::RSI, address_size, rex, step(cpu, *width));
            }
            StringOp::Scas { width } => {
                let a = cpu.read_reg(gpr::RAX, *width, rex);
                let b = bus.read(di, *width)?;
                flags::sub(cpu, a, b, 0, *width);
                zf_for_repeat_check = Some(cpu.flag(FLAG_ZF));
                advance_index(cpu, gpr::RDI, address_size, rex, step(cpu, *width));
            }
            StringOp::Ins { width, io } => {
                let port = cpu.read_reg(gpr::RDX, 16, rex) as u16;
                let v = io.in_port(port, *width);
                bus.write(di, *width, v as u64)?;
                advance_index(cpu, gpr::RDI, address_size, rex, step(cpu, *width));
            }
            StringOp::Outs { width, io } => {
                let port = cpu.read_reg(gpr::RDX, 16, rex) as u16;
                let v = bus.read(si, *width)?;
                io.out_port(port, *width, v as u32);
                advance_index(cpu, gpr::RSI, address_size, rex, step(cpu, *width));
            }
        }

        iterations -= 1;
        if let RepPrefix::Repz | RepPrefix::Repnz = rep {
            let new_count = cpu.read_reg(gpr::RCX, address_size, rex).wrapping_sub(1);
            cpu.write_reg(gpr::RCX, address_size, rex, new_count);
            if let Some(zf) = zf_for_repeat_check {
                let stop = match rep {
                    RepPrefix::Repz => !zf,
                    RepPrefix::Repnz => zf,
                    RepPrefix::None => false,
                };
                if stop {
                    break;
                }
            }
            if new_count == 0 {
                break;
            }
            iterations = new_count;
        } else if matches!(rep, RepPrefix::None) {
            break;
        }
    }
    Ok(())
}

fn advance_index(cpu: &mut CpuState, reg: usize, address_size: u8, rex: bool, delta: u64) {
    let v = cpu.read_reg(reg, address_size, rex).wrapping_add(delta);
    cpu.write_reg(reg, address_size, rex, v);
}
