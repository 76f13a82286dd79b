//! Instruction decoder.
//!
//! Hand-rolled rather than built on an existing x86 decoding crate: the
//! synthetic BIOS-call opcode (`0F FF ib`) and the debug-break opcode (`F1`)
//! live outside Intel's published opcode map, so a general-purpose decoder
//! would reject them outright. Everything else follows the Intel SDM volume
//! 2 encoding tables for the subset this emulator executes.

mod modrm;

pub use modrm::{Operand, Scale};

use crate::mem::CpuBus;
use crate::state::{CpuMode, Segments};
use crate::error::Exception;

const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    None,
    Repz,
    Repnz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegOverride {
    None,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
}

/// Everything the fetch stage discovered about one instruction: prefixes,
/// the resolved operand/address size, operands, and which operation to run.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub length: usize,
    pub op: Op,
    pub operand_size: u8,
    pub address_size: u8,
    pub seg_override: SegOverride,
    pub rep: RepPrefix,
    pub lock: bool,
    /// Whether a REX prefix was present. Selects AH/CH/DH/BH aliasing
    /// (absent) vs SPL/BPL/SIL/DIL (present) for 8-bit register operands
    ///.
    pub rex_present: bool,
}

/// The operation this instruction performs, with already-decoded operands.
/// The executor switches on this directly rather than re-dispatching on raw
/// opcode bytes.
#[derive(Debug, Clone)]
pub enum Op {
    Mov { dst: Operand, src: Operand },
    Movzx { dst: Operand, src: Operand },
    Movsx { dst: Operand, src: Operand },
    Lea { dst: Operand, src: Operand },
    Xchg { a: Operand, b: Operand },
    Cmovcc { cond: u8, dst: Operand, src: Operand },
    Push { src: Operand },
    Pop { dst: Operand },
    Pusha,
    Popa,
    Pushf,
    Popf,
    Add { dst: Operand, src: Operand },
    Adc { dst: Operand, src: Operand },
    Sub { dst: Operand, src: Operand },
    Sbb { dst: Operand, src: Operand },
    Inc { dst: Operand },
    Dec { dst: Operand },
    Neg { dst: Operand },
    Cmp { a: Operand, b: Operand },
    Mul { src: Operand },
    Imul1 { src: Operand },
    Imul2 { dst: Operand, src: Operand },
    Imul3 { dst: Operand, src: Operand, imm: i64 },
    Div { src: Operand },
    Idiv { src: Operand },
    And { dst: Operand, src: Operand },
    Or { dst: Operand, src: Operand },
    Xor { dst: Operand, src: Operand },
    Not { dst: Operand },
    Test { a: Operand, b: Operand },
    Shl { dst: Operand, count: Operand },
    Shr { dst: Operand, count: Operand },
    Sar { dst: Operand, count: Operand },
    Rol { dst: Operand, count: Operand },
    Ror { dst: Operand, count: Operand },
    Rcl { dst: Operand, count: Operand },
    Rcr { dst: Operand, count: Operand },
    Shld { dst: Operand, src: Operand, count: Operand },
    Shrd { dst: Operand, src: Operand, count: Operand },
    Jmp { target: JumpTarget },
    Jcc { cond: u8, target: JumpTarget },
    Call { target: JumpTarget },
    CallFar { seg: u16, offset: u64 },
    Ret { imm16: u16 },
    Retf { imm16: u16 },
    Loop { cond: LoopCond, rel: i64 },
    Jcxz { rel: i64 },
    Iret,
    MovsString,
    CmpsString,
    StosString,
    LodsString,
    ScasString,
    InsString,
    OutsString,
    Enter { alloc: u16, nesting: u8 },
    Leave,
    Int { vector: u8 },
    Int3,
    Into,
    Hlt,
    Cli,
    Sti,
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Lgdt { src: Operand },
    Lidt { src: Operand },
    Sgdt { dst: Operand },
    Sidt { dst: Operand },
    Lmsw { src: Operand },
    Smsw { dst: Operand },
    MovToCr { cr: u8, src: Operand },
    MovFromCr { dst: Operand, cr: u8 },
    MovToDr { dr: u8, src: Operand },
    MovFromDr { dst: Operand, dr: u8 },
    Wrmsr,
    Rdmsr,
    In { port: Operand, width: u8 },
    Out { port: Operand, width: u8 },
    Nop,
    Cpuid,
    Cbw,
    Cwd,
    /// Synthetic non-Intel escape `0F FF ib`: invoke the BIOS façade for
    /// interrupt vector `vector` without an IDT round-trip.
    BiosCall { vector: u8 },
    /// `0xF1`: the undocumented debug-break opcode, wired to `#DB`.
    DebugBreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCond {
    Always,
    Zero,
    NotZero,
}

#[derive(Debug, Clone, Copy)]
pub enum JumpTarget {
    Relative(i64),
    Absolute(Operand),
}

struct Prefixes {
    seg_override: SegOverride,
    rep: RepPrefix,
    lock: bool,
    operand_size_override: bool,
    address_size_override: bool,
    rex: Option<u8>,
}

fn is_prefix_byte(b: u8) -> bool {
    matches!(
        b,
        0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
    )
}

/// Fetch and decode one instruction starting at linear address `rip`.
pub fn decode(
    bus: &mut dyn CpuBus,
    mode: CpuMode,
    rip: u64,
    _segs: &Segments,
) -> Result<Decoded, Exception> {
    let mut bytes = Vec::with_capacity(16);
    let mut cursor = rip;
    let mut next = || -> Result<u8, Exception> {
        if bytes.len() >= MAX_INSTRUCTION_LEN {
            return Err(Exception::InvalidOpcode);
        }
        let b = bus.fetch_code(cursor)?;
        bytes.push(b);
        cursor += 1;
        Ok(b)
    };

    let mut prefixes = Prefixes {
        seg_override: SegOverride::None,
        rep: RepPrefix::None,
        lock: false,
        operand_size_override: false,
        address_size_override: false,
        rex: None,
    };

    let mut b = next()?;
    while is_prefix_byte(b) {
        match b {
            0x26 => prefixes.seg_override = SegOverride::Es,
            0x2E => prefixes.seg_override = SegOverride::Cs,
            0x36 => prefixes.seg_override = SegOverride::Ss,
            0x3E => prefixes.seg_override = SegOverride::Ds,
            0x64 => prefixes.seg_override = SegOverride::Fs,
            0x65 => prefixes.seg_override = SegOverride::Gs,
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.rep = RepPrefix::Repnz,
            0xF3 => prefixes.rep = RepPrefix::Repz,
            _ => unreachable!(),
        }
        b = next()?;
    }
    if mode == CpuMode::Long && (0x40..=0x4F).contains(&b) {
        prefixes.rex = Some(b);
        b = next()?;
    }

    let default_op = mode.default_operand_size();
    let default_addr = mode.default_address_size();
    let operand_size = if prefixes.rex.map(|r| r & 0x08 != 0).unwrap_or(false) {
        64
    } else if prefixes.operand_size_override {
        if default_op == 16 {
            32
        } else {
            16
        }
    } else {
        default_op
    };
    let address_size = if prefixes.address_size_override {
        if default_addr == 16 {
            32
        } else if default_addr == 32 {
            64
        } else {
            32
        }
    } else {
        default_addr
    };

    let mut ctx = modrm::DecodeCtx {
        bus,
        cursor: &mut cursor,
        len_budget: &mut bytes,
        mode,
        rex: prefixes.rex,
        operand_size,
        address_size,
        seg_override: prefixes.seg_override,
    };

    let op = decode_opcode(&mut ctx, b)?;

    Ok(Decoded {
        length: bytes.len(),
        op,
        operand_size,
        address_size,
        seg_override: prefixes.seg_override,
        rep: prefixes.rep,
        lock: prefixes.lock,
        rex_present: prefixes.rex.is_some(),
    })
}

fn decode_opcode(ctx: &mut modrm::DecodeCtx, b: u8) -> Result<Op, Exception> {
    use modrm::*;

    match b {
        0x0F => {
            let b2 = ctx.fetch_u8()?;
            decode_0f(ctx, b2)
        }
        0xF1 => Ok(Op::DebugBreak),
        0x00..=0x03 => arith_rm_r(ctx, b, Op::Add),
        0x04 | 0x05 => arith_acc_imm(ctx, b, Op::Add),
        0x08..=0x0B => arith_rm_r(ctx, b, Op::Or),
        0x0C | 0x0D => arith_acc_imm(ctx, b, Op::Or),
        0x10..=0x13 => arith_rm_r(ctx, b, Op::Adc),
        0x14 | 0x15 => arith_acc_imm(ctx, b, Op::Adc),
        0x18..=0x1B => arith_rm_r(ctx, b, Op::Sbb),
        0x1C | 0x1D => arith_acc_imm(ctx, b, Op::Sbb),
        0x20..=0x23 => arith_rm_r(ctx, b, Op::And),
        0x24 | 0x25 => arith_acc_imm(ctx, b, Op::And),
        0x28..=0x2B => arith_rm_r(ctx, b, Op::Sub),
        0x2C | 0x2D => arith_acc_imm(ctx, b, Op::Sub),
        0x30..=0x33 => arith_rm_r(ctx, b, Op::Xor),
        0x34 | 0x35 => arith_acc_imm(ctx, b, Op::Xor),
        0x38..=0x3B => {
            let (a, bb) = decode_rm_r_operands(ctx, b)?;
            Ok(Op::Cmp { a, b: bb })
        }
        0x3C | 0x3D => {
            let (a, bb) = decode_acc_imm_operands(ctx, b)?;
            Ok(Op::Cmp { a, b: bb })
        }
        0x50..=0x57 => {
            let reg = reg_index(ctx.rex, b - 0x50);
            Ok(Op::Push {
                src: Operand::Register(reg, ctx.operand_size),
            })
        }
        0x58..=0x5F => {
            let reg = reg_index(ctx.rex, b - 0x58);
            Ok(Op::Pop {
                dst: Operand::Register(reg, ctx.operand_size),
            })
        }
        0x60 => Ok(Op::Pusha),
        0x61 => Ok(Op::Popa),
        0x68 => {
            let imm = ctx.fetch_imm(ctx.operand_size.min(32))?;
            Ok(Op::Push {
                src: Operand::Immediate(imm),
            })
        }
        0x6A => {
            let imm = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Push {
                src: Operand::Immediate(imm),
            })
        }
        0x69 => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.reg_operand(&modrm, ctx.operand_size);
            let src = ctx.rm_operand(&modrm, ctx.operand_size)?;
            let imm = ctx.fetch_imm(ctx.operand_size.min(32))?;
            Ok(Op::Imul3 { dst, src, imm })
        }
        0x6B => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.reg_operand(&modrm, ctx.operand_size);
            let src = ctx.rm_operand(&modrm, ctx.operand_size)?;
            let imm = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Imul3 { dst, src, imm })
        }
        0x70..=0x7F => {
            let rel = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Jcc {
                cond: b - 0x70,
                target: JumpTarget::Relative(rel),
            })
        }
        0x80 | 0x81 | 0x83 => decode_group1(ctx, b),
        0x84 | 0x85 => {
            let (a, bb) = decode_rm_r_operands(ctx, b)?;
            Ok(Op::Test { a, b: bb })
        }
        0x86 | 0x87 => {
            let (a, bb) = decode_rm_r_operands(ctx, b)?;
            Ok(Op::Xchg { a, b: bb })
        }
        0x88..=0x8B => {
            let (dst, src) = decode_rm_r_operands_mov(ctx, b)?;
            Ok(Op::Mov { dst, src })
        }
        0x8D => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.reg_operand(&modrm, ctx.operand_size);
            let src = ctx.rm_operand_no_register(&modrm)?;
            Ok(Op::Lea { dst, src })
        }
        0x8F => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.rm_operand(&modrm, ctx.operand_size)?;
            Ok(Op::Pop { dst })
        }
        0x90 => Ok(Op::Nop),
        0x91..=0x97 => {
            let reg = reg_index(ctx.rex, b - 0x90);
            Ok(Op::Xchg {
                a: Operand::Register(0, ctx.operand_size),
                b: Operand::Register(reg, ctx.operand_size),
            })
        }
        0x98 => Ok(Op::Cbw),
        0x99 => Ok(Op::Cwd),
        0x9C => Ok(Op::Pushf),
        0x9D => Ok(Op::Popf),
        0xA4 => Ok(Op::MovsString),
        0xA5 => Ok(Op::MovsString),
        0xA6 | 0xA7 => Ok(Op::CmpsString),
        0xAA | 0xAB => Ok(Op::StosString),
        0xAC | 0xAD => Ok(Op::LodsString),
        0xAE | 0xAF => Ok(Op::ScasString),
        0x6C | 0x6D => Ok(Op::InsString),
        0x6E | 0x6F => Ok(Op::OutsString),
        0xA8 | 0xA9 => {
            let (a, bb) = decode_acc_imm_operands(ctx, b)?;
            Ok(Op::Test { a, b: bb })
        }
        0xB0..=0xB7 => {
            let reg = reg_index(ctx.rex, b - 0xB0);
            let imm = ctx.fetch_imm(8)?;
            Ok(Op::Mov {
                dst: Operand::Register(reg, 8),
                src: Operand::Immediate(imm),
            })
        }
        0xB8..=0xBF => {
            let reg = reg_index(ctx.rex, b - 0xB8);
            let width = if ctx.operand_size == 64 { 64 } else { ctx.operand_size };
            let imm = ctx.fetch_imm(width)?;
            Ok(Op::Mov {
                dst: Operand::Register(reg, width),
                src: Operand::Immediate(imm),
            })
        }
        0xC0 | 0xC1 | 0xD0 | 0xD1 | 0xD2 | 0xD3 => decode_group2(ctx, b),
        0xC2 => {
            let imm = ctx.fetch_imm16()?;
            Ok(Op::Ret { imm16: imm })
        }
        0xC3 => Ok(Op::Ret { imm16: 0 }),
        0xC6 | 0xC7 => decode_group11_mov(ctx, b),
        0xC8 => {
            let alloc = ctx.fetch_imm16()?;
            let nesting = ctx.fetch_u8()?;
            Ok(Op::Enter { alloc, nesting })
        }
        0xC9 => Ok(Op::Leave),
        0xCA => {
            let imm = ctx.fetch_imm16()?;
            Ok(Op::Retf { imm16: imm })
        }
        0xCB => Ok(Op::Retf { imm16: 0 }),
        0xCC => Ok(Op::Int3),
        0xCD => {
            let vector = ctx.fetch_u8()?;
            Ok(Op::Int { vector })
        }
        0xCE => Ok(Op::Into),
        0xCF => Ok(Op::Iret),
        0xE0 => {
            let rel = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Loop { cond: LoopCond::NotZero, rel })
        }
        0xE1 => {
            let rel = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Loop { cond: LoopCond::Zero, rel })
        }
        0xE2 => {
            let rel = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Loop { cond: LoopCond::Always, rel })
        }
        0xE3 => {
            let rel = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Jcxz { rel })
        }
        0xE4 | 0xE5 => {
            let port = ctx.fetch_imm(8)?;
            let width = if b == 0xE4 { 8 } else { ctx.operand_size.min(32) };
            Ok(Op::In {
                port: Operand::Immediate(port),
                width,
            })
        }
        0xE6 | 0xE7 => {
            let port = ctx.fetch_imm(8)?;
            let width = if b == 0xE6 { 8 } else { ctx.operand_size.min(32) };
            Ok(Op::Out {
                port: Operand::Immediate(port),
                width,
            })
        }
        0xE8 => {
            let rel = ctx.fetch_imm(ctx.operand_size.min(32))?;
            Ok(Op::Call {
                target: JumpTarget::Relative(rel),
            })
        }
        0xE9 => {
            let rel = ctx.fetch_imm(ctx.operand_size.min(32))?;
            Ok(Op::Jmp {
                target: JumpTarget::Relative(rel),
            })
        }
        0xEB => {
            let rel = ctx.fetch_imm8_sign_extend()?;
            Ok(Op::Jmp {
                target: JumpTarget::Relative(rel),
            })
        }
        0xEC | 0xED => {
            let width = if b == 0xEC { 8 } else { ctx.operand_size.min(32) };
            Ok(Op::In {
                port: Operand::Register(2, 16),
                width,
            })
        }
        0xEE | 0xEF => {
            let width = if b == 0xEE { 8 } else { ctx.operand_size.min(32) };
            Ok(Op::Out {
                port: Operand::Register(2, 16),
                width,
            })
        }
        0xF4 => Ok(Op::Hlt),
        0xF5 => Ok(Op::Cmc),
        0xF6 | 0xF7 => decode_group3(ctx, b),
        0xF8 => Ok(Op::Clc),
        0xF9 => Ok(Op::Stc),
        0xFA => Ok(Op::Cli),
        0xFB => Ok(Op::Sti),
        0xFC => Ok(Op::Cld),
        0xFD => Ok(Op::Std),
        0xFE | 0xFF => decode_group4_5(ctx, b),
        _ => Err(Exception::InvalidOpcode),
    }
}

fn decode_0f(ctx: &mut modrm::DecodeCtx, b2: u8) -> Result<Op, Exception> {
    use modrm::*;
    match b2 {
        0xFF => {
            let vector = ctx.fetch_u8()?;
            Ok(Op::BiosCall { vector })
        }
        0x80..=0x8F => {
            let rel = ctx.fetch_imm(ctx.operand_size.min(32))?;
            Ok(Op::Jcc {
                cond: b2 - 0x80,
                target: JumpTarget::Relative(rel),
            })
        }
        0x40..=0x4F => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.reg_operand(&modrm, ctx.operand_size);
            let src = ctx.rm_operand(&modrm, ctx.operand_size)?;
            Ok(Op::Cmovcc { cond: b2 - 0x40, dst, src })
        }
        0xB6 | 0xB7 => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.reg_operand(&modrm, ctx.operand_size);
            let width = if b2 == 0xB6 { 8 } else { 16 };
            let src = ctx.rm_operand(&modrm, width)?;
            Ok(Op::Movzx { dst, src })
        }
        0xBE | 0xBF => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.reg_operand(&modrm, ctx.operand_size);
            let width = if b2 == 0xBE { 8 } else { 16 };
            let src = ctx.rm_operand(&modrm, width)?;
            Ok(Op::Movsx { dst, src })
        }
        0xA3 => {
            let modrm = ctx.fetch_modrm()?;
            let a = ctx.rm_operand(&modrm, ctx.operand_size)?;
            let b_op = ctx.reg_operand(&modrm, ctx.operand_size);
            Ok(Op::Test { a, b: b_op })
        }
        0xA4 => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.rm_operand(&modrm, ctx.operand_size)?;
            let src = ctx.reg_operand(&modrm, ctx.operand_size);
            let count = Operand::Immediate(ctx.fetch_imm(8)?);
            Ok(Op::Shld { dst, src, count })
        }
        0xAC => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.rm_operand(&modrm, ctx.operand_size)?;
            let src = ctx.reg_operand(&modrm, ctx.operand_size);
            let count = Operand::Immediate(ctx.fetch_imm(8)?);
            Ok(Op::Shrd { dst, src, count })
        }
        0x01 => decode_0f01(ctx),
        0x06 => Ok(Op::MovFromCr { dst: Operand::Register(0, 32), cr: 0 }), // CLTS placeholder not used
        0x09 => Ok(Op::Nop), // WBINVD: no cache model, treated as no-op
        0x0B => Err(Exception::InvalidOpcode), // UD2
        0x18..=0x1F => Ok(Op::Nop), // multi-byte NOP / prefetch encodings
        0x20 => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.rm_operand(&modrm, ctx.operand_size)?;
            Ok(Op::MovFromCr { dst, cr: modrm.reg })
        }
        0x22 => {
            let modrm = ctx.fetch_modrm()?;
            let src = ctx.rm_operand(&modrm, ctx.operand_size)?;
            Ok(Op::MovToCr { cr: modrm.reg, src })
        }
        0x21 => {
            let modrm = ctx.fetch_modrm()?;
            let dst = ctx.rm_operand(&modrm, ctx.operand_size)?;
            Ok(Op::MovFromDr { dst, dr: modrm.reg })
        }
        0x23 => {
            let modrm = ctx.fetch_modrm()?;
            let src = ctx.rm_operand(&modrm, ctx.operand_size)?;
            Ok(Op::MovToDr { dr: modrm.reg, src })
        }
        0x30 => Ok(Op::Wrmsr),
        0x32 => Ok(Op::Rdmsr),
        0xA2 => Ok(Op::Cpuid),
        _ => Err(Exception::InvalidOpcode),
    }
}

fn decode_0f01(ctx: &mut modrm::DecodeCtx) -> Result<Op, Exception> {
    let modrm = ctx.fetch_modrm()?;
    match modrm.reg {
        0 => {
            let dst = ctx.rm_operand_no_register(&modrm)?;
            Ok(Op::Sgdt { dst })
        }
        1 => {
            let dst = ctx.rm_operand_no_register(&modrm)?;
            Ok(Op::Sidt { dst })
        }
        2 => {
            let src = ctx.rm_operand_no_register(&modrm)?;
            Ok(Op::Lgdt { src })
        }
        3 => {
            let src = ctx.rm_operand_no_register(&modrm)?;
            Ok(Op::Lidt { src })
        }
        4 => {
            let dst = ctx.rm_operand(&modrm, 16)?;
            Ok(Op::Smsw { dst })
        }
        6 => {
            let src = ctx.rm_operand(&modrm, 16)?;
            Ok(Op::Lmsw { src })
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

fn reg_index(rex: Option<u8>, low3: u8) -> u8 {
    let ext = rex.map(|r| (r & 0x01) << 3).unwrap_or(0);
    low3 | ext
}

fn arith_rm_r(ctx: &mut modrm::DecodeCtx, opcode: u8, f: fn(Operand, Operand) -> Op) -> Result<Op, Exception> {
    let (dst, src) = decode_rm_r_operands(ctx, opcode)?;
    Ok(f(dst, src))
}

fn arith_acc_imm(ctx: &mut modrm::DecodeCtx, opcode: u8, f: fn(Operand, Operand) -> Op) -> Result<Op, Exception> {
    let (dst, src) = decode_acc_imm_operands(ctx, opcode)?;
    Ok(f(dst, src))
}

fn decode_rm_r_operands(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<(Operand, Operand), Exception> {
    let width = if opcode & 1 == 0 { 8 } else { ctx.operand_size };
    let modrm = ctx.fetch_modrm()?;
    let reg = ctx.reg_operand(&modrm, width);
    let rm = ctx.rm_operand(&modrm, width)?;
    // direction bit: bit 1 set means reg is destination (e.g. 0x03 ADD r, r/m)
    if opcode & 0x02 != 0 {
        Ok((reg, rm))
    } else {
        Ok((rm, reg))
    }
}

fn decode_rm_r_operands_mov(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<(Operand, Operand), Exception> {
    let width = if opcode & 1 == 0 { 8 } else { ctx.operand_size };
    let modrm = ctx.fetch_modrm()?;
    let reg = ctx.reg_operand(&modrm, width);
    let rm = ctx.rm_operand(&modrm, width)?;
    if opcode & 0x02 != 0 {
        Ok((reg, rm))
    } else {
        Ok((rm, reg))
    }
}

fn decode_acc_imm_operands(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<(Operand, Operand), Exception> {
    let width = if opcode & 1 == 0 { 8 } else { ctx.operand_size.min(32) };
    let imm = ctx.fetch_imm(width)?;
    Ok((Operand::Register(0, width), Operand::Immediate(imm)))
}

fn decode_group1(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<Op, Exception> {
    let width = if opcode == 0x80 { 8 } else { ctx.operand_size };
    let modrm = ctx.fetch_modrm()?;
    let dst = ctx.rm_operand(&modrm, width)?;
    let imm = match opcode {
        0x80 => ctx.fetch_imm(8)?,
        0x81 => ctx.fetch_imm(width.min(32))?,
        0x83 => ctx.fetch_imm8_sign_extend()?,
        _ => unreachable!(),
    };
    let src = Operand::Immediate(imm);
    Ok(match modrm.reg {
        0 => Op::Add { dst, src },
        1 => Op::Or { dst, src },
        2 => Op::Adc { dst, src },
        3 => Op::Sbb { dst, src },
        4 => Op::And { dst, src },
        5 => Op::Sub { dst, src },
        6 => Op::Xor { dst, src },
        7 => Op::Cmp { a: dst, b: src },
        _ => unreachable!(),
    })
}

fn decode_group2(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<Op, Exception> {
    let width = if matches!(opcode, 0xC0 | 0xD0 | 0xD2) { 8 } else { ctx.operand_size };
    let modrm = ctx.fetch_modrm()?;
    let dst = ctx.rm_operand(&modrm, width)?;
    let count = match opcode {
        0xC0 | 0xC1 => Operand::Immediate(ctx.fetch_imm(8)?),
        0xD0 | 0xD1 => Operand::Immediate(1),
        0xD2 | 0xD3 => Operand::Register(1, 8), // CL
        _ => unreachable!(),
    };
    Ok(match modrm.reg {
        0 => Op::Rol { dst, count },
        1 => Op::Ror { dst, count },
        2 => Op::Rcl { dst, count },
        3 => Op::Rcr { dst, count },
        4 | 6 => Op::Shl { dst, count },
        5 => Op::Shr { dst, count },
        7 => Op::Sar { dst, count },
        _ => unreachable!(),
    })
}

fn decode_group3(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<Op, Exception> {
    let width = if opcode == 0xF6 { 8 } else { ctx.operand_size };
    let modrm = ctx.fetch_modrm()?;
    let dst = ctx.rm_operand(&modrm, width)?;
    Ok(match modrm.reg {
        0 | 1 => {
            let imm_width = if opcode == 0xF6 { 8 } else { width.min(32) };
            let imm = ctx.fetch_imm(imm_width)?;
            Op::Test { a: dst, b: Operand::Immediate(imm) }
        }
        2 => Op::Not { dst },
        3 => Op::Neg { dst },
        4 => Op::Mul { src: dst },
        5 => Op::Imul1 { src: dst },
        6 => Op::Div { src: dst },
        7 => Op::Idiv { src: dst },
        _ => unreachable!(),
    })
}

fn decode_group11_mov(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<Op, Exception> {
    let width = if opcode == 0xC6 { 8 } else { ctx.operand_size };
    let modrm = ctx.fetch_modrm()?;
    let dst = ctx.rm_operand(&modrm, width)?;
    let imm = ctx.fetch_imm(if opcode == 0xC6 { 8 } else { width.min(32) })?;
    Ok(Op::Mov { dst, src: Operand::Immediate(imm) })
}

fn decode_group4_5(ctx: &mut modrm::DecodeCtx, opcode: u8) -> Result<Op, Exception> {
    let width = if opcode == 0xFE { 8 } else { ctx.operand_size };
    let modrm = ctx.fetch_modrm()?;
    match (opcode, modrm.reg) {
        (0xFE, 0) | (0xFF, 0) => Ok(Op::Inc { dst: ctx.rm_operand(&modrm, width)? }),
        (0xFE, 1) | (0xFF, 1) => Ok(Op::Dec { dst: ctx.rm_operand(&modrm, width)? }),
        (0xFF, 2) => Ok(Op::Call { target: JumpTarget::Absolute(ctx.rm_operand(&modrm, ctx.operand_size)?) }),
        (0xFF, 4) => Ok(Op::Jmp { target: JumpTarget::Absolute(ctx.rm_operand(&modrm, ctx.operand_size)?) }),
        (0xFF, 6) => Ok(Op::Push { src: ctx.rm_operand(&modrm, ctx.operand_size)? }),
        _ => Err(Exception::InvalidOpcode),
    }
}
