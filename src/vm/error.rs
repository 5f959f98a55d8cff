//! Runtime errors raised by the interpreter.
//!
//! Every error is fatal: the dispatch loop stops at the instruction that
//! detected it and hands the error to the host. The four language-level
//! kinds (arithmetic, memory, assertion, user) are what a well-formed program
//! can trigger; everything else means the program or the host broke the
//! calling contract.

use thiserror::Error;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, VmError>;

/// Coarse classification of a [`VmError`], used for exit statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Arithmetic,
    Memory,
    Assertion,
    User,
    InvalidOpcode,
    /// The bytecode or host broke an invariant a well-formed program keeps.
    Contract,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Arithmetic => "arithmetic error",
            ErrorKind::Memory => "memory error",
            ErrorKind::Assertion => "assertion failed",
            ErrorKind::User => "error",
            ErrorKind::InvalidOpcode => "invalid opcode",
            ErrorKind::Contract => "bytecode contract violation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Division by zero, `INT_MIN / -1`, or a shift outside `[0, 32)`.
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    /// Null dereference, out-of-bounds index, or an access outside a block.
    #[error("memory error: {0}")]
    Memory(String),

    /// An `ASSERT` whose condition was zero.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    /// An `ATHROW`.
    #[error("error: {0}")]
    User(String),

    #[error("invalid opcode 0x{opcode:02x} at pc {pc}")]
    InvalidOpcode { opcode: u8, pc: usize },

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("local variable {index} out of range (function has {num_vars})")]
    InvalidLocal { index: usize, num_vars: usize },

    #[error("{pool} pool index {index} out of range")]
    InvalidPoolIndex { pool: &'static str, index: usize },

    #[error("native function {0} is not registered")]
    UnknownNative(u16),

    #[error("native {name} expects {expected} argument(s), got {found}")]
    NativeArity {
        name: &'static str,
        expected: u16,
        found: usize,
    },

    #[error("return with {remaining} value(s) left on the operand stack")]
    UnbalancedReturn { remaining: usize },

    #[error("program counter {pc} outside function code ({len} bytes)")]
    PcOutOfBounds { pc: usize, len: usize },

    #[error("native i/o failed: {0}")]
    NativeIo(String),
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Arithmetic(_) => ErrorKind::Arithmetic,
            VmError::Memory(_) => ErrorKind::Memory,
            VmError::AssertionFailed(_) => ErrorKind::Assertion,
            VmError::User(_) => ErrorKind::User,
            VmError::InvalidOpcode { .. } => ErrorKind::InvalidOpcode,
            VmError::StackUnderflow
            | VmError::TypeMismatch { .. }
            | VmError::InvalidLocal { .. }
            | VmError::InvalidPoolIndex { .. }
            | VmError::UnknownNative(_)
            | VmError::NativeArity { .. }
            | VmError::UnbalancedReturn { .. }
            | VmError::PcOutOfBounds { .. }
            | VmError::NativeIo(_) => ErrorKind::Contract,
        }
    }

    pub(crate) fn arith(msg: &str) -> Self {
        VmError::Arithmetic(msg.to_string())
    }

    pub(crate) fn memory(msg: &str) -> Self {
        VmError::Memory(msg.to_string())
    }
}

impl From<std::io::Error> for VmError {
    fn from(e: std::io::Error) -> Self {
        VmError::NativeIo(e.to_string())
    }
}
