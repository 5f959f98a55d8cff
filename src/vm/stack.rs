use super::error::{Result, VmError};
use super::value::{Address, Value};

/// A LIFO container.
///
/// Used both for the per-frame operand stack and for the call stack of
/// suspended frames. Values move in and out by ownership.
#[derive(Debug, Clone)]
pub struct Stack<T> {
    items: Vec<T>,
}

/// The per-frame operand stack.
pub type OperandStack = Stack<Value>;

impl<T> Stack<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Remove and return the top item.
    ///
    /// Balanced code never pops an empty stack; if it does, that is
    /// reported rather than trusted.
    pub fn pop(&mut self) -> Result<T> {
        self.items.pop().ok_or(VmError::StackUnderflow)
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Items from bottom to top.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl OperandStack {
    pub fn pop_int(&mut self) -> Result<i32> {
        self.pop()?.as_int()
    }

    pub fn pop_ptr(&mut self) -> Result<Option<Address>> {
        self.pop()?.as_ptr()
    }
}
