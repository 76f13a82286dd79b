//! CPU-domain and host-domain error taxonomy.
//!
//! [`Exception`] is what every fallible CPU operation (decode, execute, memory
//! access) returns. It carries exactly what [`crate::interrupts`] needs to push
//! an interrupt frame: a vector number and, for the vectors that carry one, an
//! error code. Nothing above the interrupt-delivery layer should construct an
//! IDT/IVT frame directly.
//!
//! [`RunError`] is the host-domain wrapper returned by [`crate::runtime::Machine::run`];
//! it is the only error type that ever escapes the fetch/decode/execute loop.

use std::fmt;

/// A CPU fault, trap, or abort as defined by the Intel SDM vector table.
///
/// `Copy` because every executor handler needs to thread this through `Result`
/// without fighting the borrow checker, and none of these variants owns
/// heap data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// `#DE` (vector 0): divide by zero or quotient overflow in DIV/IDIV.
    DivideError,
    /// `#DB` (vector 1): reserved for the debug-break opcode `0xF1`.
    Debug,
    /// `#UD` (vector 6): undecodable opcode, bad ModR/M, or a prefix-count overflow.
    InvalidOpcode,
    /// `#NP` (vector 11): segment marked not-present.
    NotPresent(u32),
    /// `#SS` (vector 12): stack segment fault (limit violation, not-present SS).
    StackFault(u32),
    /// `#GP` (vector 13): general protection fault.
    GeneralProtection(u32),
    /// `#PF` (vector 14): page fault. `cr2` is the faulting linear address.
    PageFault { cr2: u64, error_code: u32 },
    /// `#AC` (vector 17): alignment check (only raised when CR0.AM & RFLAGS.AC).
    AlignmentCheck(u32),
    /// Double fault escalation (vector 8, always error code 0).
    DoubleFault,
}

impl Exception {
    /// The interrupt vector this exception is delivered through.
    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::InvalidOpcode => 6,
            Exception::NotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::AlignmentCheck(_) => 17,
            Exception::DoubleFault => 8,
        }
    }

    /// The error code pushed onto the stack frame, if this vector carries one.
    pub fn error_code(&self) -> Option<u32> {
        match *self {
            Exception::NotPresent(ec) => Some(ec),
            Exception::StackFault(ec) => Some(ec),
            Exception::GeneralProtection(ec) => Some(ec),
            Exception::PageFault { error_code, .. } => Some(error_code),
            Exception::AlignmentCheck(ec) => Some(ec),
            Exception::DoubleFault => Some(0),
            Exception::DivideError | Exception::Debug | Exception::InvalidOpcode => None,
        }
    }

    /// Whether this exception is a *fault* (re-executes the faulting instruction
    /// once delivery completes, per the Intel taxonomy) as opposed to an abort.
    pub fn is_fault(&self) -> bool {
        !matches!(self, Exception::DoubleFault)
    }

    pub fn gp(error_code: u32) -> Self {
        Exception::GeneralProtection(error_code)
    }

    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::DivideError => write!(f, "#DE divide error"),
            Exception::Debug => write!(f, "#DB debug break"),
            Exception::InvalidOpcode => write!(f, "#UD invalid opcode"),
            Exception::NotPresent(ec) => write!(f, "#NP({ec:#x})"),
            Exception::StackFault(ec) => write!(f, "#SS({ec:#x})"),
            Exception::GeneralProtection(ec) => write!(f, "#GP({ec:#x})"),
            Exception::PageFault { cr2, error_code } => {
                write!(f, "#PF at {cr2:#x} (error {error_code:#x})")
            }
            Exception::AlignmentCheck(ec) => write!(f, "#AC({ec:#x})"),
            Exception::DoubleFault => write!(f, "#DF double fault"),
        }
    }
}

impl std::error::Error for Exception {}

/// Why a run terminated, or failed to start. The only error type that escapes
/// [`crate::runtime::Machine::run`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A CPU exception reached the top of the interrupt-delivery escalation
    /// chain without finding a deliverable gate (an undeliverable triple
    /// fault candidate, or a fault raised before any IDT/IVT exists).
    #[error("undeliverable CPU exception: {0}")]
    Undeliverable(#[source] Exception),

    /// Escalation beyond a double fault: the CPU shuts down.
    #[error("triple fault: CPU shutdown")]
    TripleFault,

    /// A host-side invariant was violated (corrupt observer list, an executor
    /// handler that forgot to advance RIP, etc). Not a guest-visible fault.
    #[error("fatal emulator error: {0}")]
    Fatal(String),

    /// The boot medium failed the MBR/El Torito signature check, or the
    /// configured entrypoint falls outside allocated memory.
    #[error("invalid boot image: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Exception> for RunError {
    fn from(e: Exception) -> Self {
        RunError::Undeliverable(e)
    }
}

/// The terminal state of a run that stopped cleanly (as opposed to [`RunError`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    /// `HLT` with interrupts disabled and nothing pending: nothing can ever
    /// wake the CPU again, so the run ends. Exit code 0.
    Halt,
    /// `INT 20h`, or `INT 21h/AH=4Ch` with the DOS exit code in AL.
    DosExit(u8),
    /// Triple fault: the CPU reset condition, treated as a non-zero exit.
    TripleFault,
}

impl ExitCondition {
    pub fn code(&self) -> i32 {
        match self {
            ExitCondition::Halt => 0,
            ExitCondition::DosExit(code) => *code as i32,
            ExitCondition::TripleFault => 1,
        }
    }
}
