mod value;
mod ops;
mod stack;
mod frame;
mod heap;
mod vm;
pub mod error;
pub mod natives;
pub mod bytecode;
pub mod dump;

pub use value::{Address, BlockId, Value};
pub use ops::{Op, extension_name};
pub use stack::{OperandStack, Stack};
pub use frame::Frame;
pub use heap::{ArrayHeader, Heap, INT_SIZE, PTR_SIZE};
pub use vm::{VM, VmStats};
pub use error::{ErrorKind, VmError};
pub use natives::{NativeContext, NativeFn, NativeTable};

/// A function in the function pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub num_args: u16,
    /// Number of local variable slots, arguments included.
    pub num_vars: u16,
    pub code: Vec<u8>,
}

impl Function {
    pub fn new(num_args: u16, num_vars: u16, code: Vec<u8>) -> Self {
        Self {
            num_args,
            num_vars,
            code,
        }
    }
}

/// An entry of the native pool: how to reach a host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeInfo {
    pub num_args: u16,
    /// Index into the [`NativeTable`].
    pub function_table_index: u16,
}

/// A loaded program. Execution starts at `functions[0]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub int_pool: Vec<i32>,
    /// NUL-terminated strings laid end to end; `ALDC` operands are byte
    /// offsets into this segment.
    pub string_pool: Vec<u8>,
    pub functions: Vec<Function>,
    pub natives: Vec<NativeInfo>,
}

impl Program {
    /// A program consisting of a single entry function with no pools.
    pub fn from_main(num_vars: u16, code: Vec<u8>) -> Self {
        Self {
            functions: vec![Function::new(0, num_vars, code)],
            ..Default::default()
        }
    }
}
