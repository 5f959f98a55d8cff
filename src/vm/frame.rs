use super::error::{Result, VmError};
use super::stack::OperandStack;
use super::value::Value;

/// A call frame: one active (or suspended) function invocation.
///
/// The frame owns its operand stack and locals; both are dropped when the
/// frame returns.
#[derive(Debug)]
pub struct Frame {
    /// Index into the function pool
    pub function: usize,
    /// Program counter (byte offset into the function's code)
    pub pc: usize,
    pub stack: OperandStack,
    pub locals: Vec<Value>,
}

impl Frame {
    /// A fresh frame with `num_vars` zeroed locals and an empty stack.
    pub fn new(function: usize, num_vars: usize) -> Self {
        Self {
            function,
            pc: 0,
            stack: OperandStack::with_capacity(16),
            locals: vec![Value::default(); num_vars],
        }
    }

    pub fn local(&self, index: usize) -> Result<Value> {
        self.locals
            .get(index)
            .copied()
            .ok_or(VmError::InvalidLocal {
                index,
                num_vars: self.locals.len(),
            })
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> Result<()> {
        let num_vars = self.locals.len();
        let slot = self
            .locals
            .get_mut(index)
            .ok_or(VmError::InvalidLocal { index, num_vars })?;
        *slot = value;
        Ok(())
    }
}
