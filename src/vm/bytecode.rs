//! Loader for the textual `.bc0` bytecode format.
//!
//! A `.bc0` file is a sequence of two-digit hex bytes separated by
//! whitespace; `#` starts a comment that runs to the end of the line.
//! The bytes decode as (all integers big-endian):
//! - Magic: `C0 C0 FF EE`
//! - Version word: u16 (`version << 1 | arch`)
//! - Int pool: u16 count + i32 entries
//! - String pool: u16 byte count + bytes
//! - Functions: u16 count + (u16 num_args, u16 num_vars, u16 code length, code)
//! - Natives: u16 count + (u16 num_args, u16 function table index)

use std::fmt::Write as _;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use super::{Function, NativeInfo, Program};

/// Magic bytes opening every bytecode file
pub const MAGIC: [u8; 4] = [0xC0, 0xC0, 0xFF, 0xEE];

/// Supported bytecode version (the high 15 bits of the version word)
pub const VERSION: u16 = 11;

/// Error type for bytecode loading
#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("cannot read bytecode: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: invalid byte '{token}'")]
    InvalidToken { line: usize, token: String },
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported bytecode version {0} (expected {VERSION})")]
    UnsupportedVersion(u16),
    #[error("unexpected end of bytecode while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("{0} trailing byte(s) after native pool")]
    TrailingBytes(usize),
    #[error("program has no functions")]
    NoFunctions,
    #[error("function {index}: {num_args} argument(s) but only {num_vars} local(s)")]
    InvalidFunction {
        index: usize,
        num_args: u16,
        num_vars: u16,
    },
}

/// Parse `.bc0` text into raw bytes.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, BytecodeError> {
    let mut bytes = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let code = line.split('#').next().unwrap_or("");
        for token in code.split_whitespace() {
            let valid = token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit());
            let byte = valid
                .then(|| u8::from_str_radix(token, 16).ok())
                .flatten()
                .ok_or_else(|| BytecodeError::InvalidToken {
                    line: lineno + 1,
                    token: token.to_string(),
                })?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], BytecodeError> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(BytecodeError::UnexpectedEof(what))?;
        self.pos += len;
        Ok(slice)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, BytecodeError> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, BytecodeError> {
        let b = self.bytes(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Decode raw bytecode bytes into a [`Program`].
pub fn decode(data: &[u8]) -> Result<Program, BytecodeError> {
    let mut r = Reader::new(data);

    if r.bytes(4, "magic")? != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }
    let version = r.u16("version")? >> 1;
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let int_count = r.u16("int pool")?;
    let int_pool = (0..int_count)
        .map(|_| r.i32("int pool"))
        .collect::<Result<Vec<_>, _>>()?;

    let string_len = r.u16("string pool")? as usize;
    let string_pool = r.bytes(string_len, "string pool")?.to_vec();

    let function_count = r.u16("function pool")? as usize;
    if function_count == 0 {
        return Err(BytecodeError::NoFunctions);
    }
    let mut functions = Vec::with_capacity(function_count);
    for index in 0..function_count {
        let num_args = r.u16("function header")?;
        let num_vars = r.u16("function header")?;
        if num_vars < num_args {
            return Err(BytecodeError::InvalidFunction {
                index,
                num_args,
                num_vars,
            });
        }
        let code_len = r.u16("function header")? as usize;
        let code = r.bytes(code_len, "function code")?.to_vec();
        functions.push(Function::new(num_args, num_vars, code));
    }

    let native_count = r.u16("native pool")?;
    let natives = (0..native_count)
        .map(|_| {
            Ok(NativeInfo {
                num_args: r.u16("native pool")?,
                function_table_index: r.u16("native pool")?,
            })
        })
        .collect::<Result<Vec<_>, BytecodeError>>()?;

    if r.remaining() > 0 {
        return Err(BytecodeError::TrailingBytes(r.remaining()));
    }

    info!(
        ints = int_pool.len(),
        string_bytes = string_pool.len(),
        functions = functions.len(),
        natives = natives.len(),
        "loaded bytecode"
    );

    Ok(Program {
        int_pool,
        string_pool,
        functions,
        natives,
    })
}

/// Load a program from `.bc0` text.
pub fn load_str(text: &str) -> Result<Program, BytecodeError> {
    decode(&parse_hex(text)?)
}

/// Load a program from a `.bc0` file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Program, BytecodeError> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

/// Render a program as commented `.bc0` text that [`load_str`] accepts.
pub fn serialize(program: &Program) -> String {
    let mut out = String::new();
    let hex = |out: &mut String, bytes: &[u8]| {
        let line: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        out.push_str(&line.join(" "));
    };

    hex(&mut out, &MAGIC);
    out.push_str(" # magic number\n");
    hex(&mut out, &((VERSION << 1) | 1).to_be_bytes());
    out.push_str(" # version, arch\n\n");

    hex(&mut out, &(program.int_pool.len() as u16).to_be_bytes());
    out.push_str(" # int pool count\n");
    for n in &program.int_pool {
        hex(&mut out, &n.to_be_bytes());
        let _ = writeln!(out, " # {}", n);
    }

    out.push('\n');
    hex(&mut out, &(program.string_pool.len() as u16).to_be_bytes());
    out.push_str(" # string pool total size\n");
    for chunk in program.string_pool.split_inclusive(|&b| b == 0) {
        hex(&mut out, chunk);
        let text = String::from_utf8_lossy(chunk.strip_suffix(&[0]).unwrap_or(chunk));
        let _ = writeln!(out, " # {:?}", text);
    }

    out.push('\n');
    hex(&mut out, &(program.functions.len() as u16).to_be_bytes());
    out.push_str(" # function count\n");
    for (i, f) in program.functions.iter().enumerate() {
        let _ = writeln!(out, "\n# function {}", i);
        hex(&mut out, &f.num_args.to_be_bytes());
        out.push_str(" # number of arguments\n");
        hex(&mut out, &f.num_vars.to_be_bytes());
        out.push_str(" # number of local variables\n");
        hex(&mut out, &(f.code.len() as u16).to_be_bytes());
        out.push_str(" # code length\n");
        for chunk in f.code.chunks(16) {
            hex(&mut out, chunk);
            out.push('\n');
        }
    }

    out.push('\n');
    hex(&mut out, &(program.natives.len() as u16).to_be_bytes());
    out.push_str(" # native count\n");
    for n in &program.natives {
        hex(&mut out, &n.num_args.to_be_bytes());
        out.push(' ');
        hex(&mut out, &n.function_table_index.to_be_bytes());
        out.push_str(" # native\n");
    }
    out
}
