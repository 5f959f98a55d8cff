//! Host functions reachable through `INVOKENATIVE`.
//!
//! A program's native pool names functions by their index in the
//! [`NativeTable`]. The table is built once by the host and handed to the
//! VM before execution; the VM never populates it itself.

use std::fmt;
use std::io::{BufRead, Write};

use super::error::{Result, VmError};
use super::heap::Heap;
use super::value::Value;

/// What a native function may touch: the heap and the VM's I/O streams.
pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub input: &'a mut dyn BufRead,
    pub output: &'a mut dyn Write,
}

/// A native function: takes its arguments in source order, returns one value.
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> Result<Value>;

#[derive(Clone, Copy)]
struct NativeEntry {
    name: &'static str,
    arity: u16,
    func: NativeFn,
}

/// Registry of native functions indexed by function-table index.
#[derive(Clone, Default)]
pub struct NativeTable {
    entries: Vec<Option<NativeEntry>>,
}

impl fmt::Debug for NativeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| e.map(|e| (i, e.name))),
            )
            .finish()
    }
}

// Standard C0 function-table indices of the conio library.
pub const CONIO_EOF: u16 = 4;
pub const CONIO_FLUSH: u16 = 5;
pub const CONIO_PRINT: u16 = 6;
pub const CONIO_PRINTBOOL: u16 = 7;
pub const CONIO_PRINTCHAR: u16 = 8;
pub const CONIO_PRINTINT: u16 = 9;
pub const CONIO_PRINTLN: u16 = 10;
pub const CONIO_READLINE: u16 = 11;

impl NativeTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table with the standard libraries registered.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register(CONIO_EOF, "eof", 0, native_eof);
        table.register(CONIO_FLUSH, "flush", 0, native_flush);
        table.register(CONIO_PRINT, "print", 1, native_print);
        table.register(CONIO_PRINTBOOL, "printbool", 1, native_printbool);
        table.register(CONIO_PRINTCHAR, "printchar", 1, native_printchar);
        table.register(CONIO_PRINTINT, "printint", 1, native_printint);
        table.register(CONIO_PRINTLN, "println", 1, native_println);
        table.register(CONIO_READLINE, "readline", 0, native_readline);
        table
    }

    /// Register `func` at `index`, replacing any previous entry.
    pub fn register(&mut self, index: u16, name: &'static str, arity: u16, func: NativeFn) {
        let index = index as usize;
        if self.entries.len() <= index {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = Some(NativeEntry { name, arity, func });
    }

    /// Name of the function at `index`, if one is registered.
    pub fn name(&self, index: u16) -> Option<&'static str> {
        self.entry(index).map(|e| e.name)
    }

    fn entry(&self, index: u16) -> Option<&NativeEntry> {
        self.entries.get(index as usize).and_then(Option::as_ref)
    }

    /// Call the function at `index`.
    pub fn call(&self, index: u16, ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value> {
        let entry = self.entry(index).ok_or(VmError::UnknownNative(index))?;
        if args.len() != entry.arity as usize {
            return Err(VmError::NativeArity {
                name: entry.name,
                expected: entry.arity,
                found: args.len(),
            });
        }
        (entry.func)(ctx, args)
    }
}

// ---------------------------------------------------------------------------
// conio
// ---------------------------------------------------------------------------

fn native_eof(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value> {
    let at_end = ctx.input.fill_buf()?.is_empty();
    Ok(Value::int(at_end as i32))
}

fn native_flush(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value> {
    ctx.output.flush()?;
    Ok(Value::int(0))
}

fn native_print(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value> {
    let s = ctx.heap.read_c_string(args[0].as_ptr()?)?;
    ctx.output.write_all(&s)?;
    Ok(Value::int(0))
}

fn native_println(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value> {
    let s = ctx.heap.read_c_string(args[0].as_ptr()?)?;
    ctx.output.write_all(&s)?;
    ctx.output.write_all(b"\n")?;
    Ok(Value::int(0))
}

fn native_printbool(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value> {
    let text = if args[0].as_int()? != 0 { "true" } else { "false" };
    ctx.output.write_all(text.as_bytes())?;
    Ok(Value::int(0))
}

fn native_printchar(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value> {
    ctx.output.write_all(&[args[0].as_int()? as u8])?;
    Ok(Value::int(0))
}

fn native_printint(ctx: &mut NativeContext<'_>, args: &[Value]) -> Result<Value> {
    write!(ctx.output, "{}", args[0].as_int()?)?;
    Ok(Value::int(0))
}

fn native_readline(ctx: &mut NativeContext<'_>, _args: &[Value]) -> Result<Value> {
    let mut line = Vec::new();
    if ctx.input.read_until(b'\n', &mut line)? == 0 {
        return Err(VmError::NativeIo("readline: end of input".to_string()));
    }
    if line.ends_with(b"\n") {
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
    }
    let s = ctx.heap.alloc_c_string(&line)?;
    Ok(Value::ptr(Some(s)))
}
