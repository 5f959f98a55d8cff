//! c0vm - a virtual machine for C0 bytecode
//!
//! This library provides the bytecode loader, the interpreter and its
//! native function library.

pub mod config;
pub mod vm;

// Re-export commonly used types
pub use config::{RuntimeConfig, StatsFormat};
pub use vm::{NativeTable, Program, VM, Value, VmError};
