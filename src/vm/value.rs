use std::fmt;

use super::error::VmError;

/// Handle of a heap block.
pub type BlockId = u32;

/// A location in the VM heap: a block plus a byte offset into it.
///
/// Pointer arithmetic (`AADDF`, `AADDS`) only ever moves the offset; the
/// block is consulted on every access, so an address can never escape the
/// buffer it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub block: BlockId,
    pub offset: u32,
}

impl Address {
    pub fn new(block: BlockId, offset: u32) -> Self {
        Self { block, offset }
    }

    /// Address `bytes` further into the same block.
    pub fn add(self, bytes: u32) -> Self {
        Self {
            block: self.block,
            offset: self.offset.wrapping_add(bytes),
        }
    }
}

/// A tagged value.
///
/// Every operand-stack slot and local variable holds one of these:
/// - Int: 32-bit signed integer (also used for `bool` and `char`)
/// - Ptr: heap address, or `None` for `NULL`
#[derive(Clone, Copy)]
pub enum Value {
    Int(i32),
    Ptr(Option<Address>),
}

impl Default for Value {
    /// Zeroed storage, as fresh locals are.
    fn default() -> Self {
        Value::Int(0)
    }
}

impl Value {
    pub fn int(n: i32) -> Self {
        Value::Int(n)
    }

    pub fn ptr(addr: Option<Address>) -> Self {
        Value::Ptr(addr)
    }

    pub fn null() -> Self {
        Value::Ptr(None)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Value::Ptr(_))
    }

    pub fn as_int(&self) -> Result<i32, VmError> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Ptr(_) => Err(VmError::TypeMismatch {
                expected: "int",
                found: "pointer",
            }),
        }
    }

    pub fn as_ptr(&self) -> Result<Option<Address>, VmError> {
        match self {
            Value::Ptr(p) => Ok(*p),
            Value::Int(_) => Err(VmError::TypeMismatch {
                expected: "pointer",
                found: "int",
            }),
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Ptr(_) => "pointer",
        }
    }
}

/// Equality as observed by `IF_CMPEQ` / `IF_CMPNE`: only within a variant.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Ptr(a), Value::Ptr(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Ptr(None) => write!(f, "Null"),
            Value::Ptr(Some(a)) => write!(f, "Ptr({}+{})", a.block, a.offset),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Ptr(None) => write!(f, "NULL"),
            Value::Ptr(Some(a)) => write!(f, "<{}:{}>", a.block, a.offset),
        }
    }
}
