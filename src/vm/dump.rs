//! Human-readable listing of a loaded program.

use std::fmt::Write as _;

use super::natives::NativeTable;
use super::ops::{Op, extension_name};
use super::{Function, Program};

/// Disassembler for bytecode.
pub struct Disassembler<'a> {
    program: &'a Program,
    natives: Option<&'a NativeTable>,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            natives: None,
            output: String::new(),
        }
    }

    /// Annotate native calls with names from `natives`.
    pub fn with_natives(mut self, natives: &'a NativeTable) -> Self {
        self.natives = Some(natives);
        self
    }

    pub fn disassemble(&mut self) -> &str {
        if !self.program.int_pool.is_empty() {
            self.output.push_str("== Int Constants ==\n");
            for (i, n) in self.program.int_pool.iter().enumerate() {
                let _ = writeln!(self.output, "  [{:04}] {}", i, n);
            }
            self.output.push('\n');
        }

        if !self.program.string_pool.is_empty() {
            self.output.push_str("== String Constants ==\n");
            let mut offset = 0;
            for s in self.program.string_pool.split_inclusive(|&b| b == 0) {
                let text = String::from_utf8_lossy(s.strip_suffix(&[0]).unwrap_or(s));
                let _ = writeln!(self.output, "  [{:04}] {:?}", offset, text);
                offset += s.len();
            }
            self.output.push('\n');
        }

        if !self.program.natives.is_empty() {
            self.output.push_str("== Natives ==\n");
            for i in 0..self.program.natives.len() {
                let label = self.native_label(i);
                let _ = writeln!(self.output, "  [{:04}] {}", i, label);
            }
            self.output.push('\n');
        }

        for (i, func) in self.program.functions.iter().enumerate() {
            self.disassemble_function(func, i);
            self.output.push('\n');
        }

        &self.output
    }

    fn disassemble_function(&mut self, func: &Function, index: usize) {
        let _ = writeln!(
            self.output,
            "== Function[{}] (args: {}, locals: {}, {} bytes) ==",
            index,
            func.num_args,
            func.num_vars,
            func.code.len()
        );

        let code = &func.code;
        let mut pc = 0;
        while pc < code.len() {
            let byte = code[pc];
            let _ = write!(self.output, "{:04}: ", pc);
            let Some(op) = Op::from_byte(byte) else {
                match extension_name(byte) {
                    Some(name) => {
                        let _ = writeln!(self.output, "<{} 0x{:02x}: unsupported>", name, byte);
                    }
                    None => {
                        let _ = writeln!(self.output, "<invalid 0x{:02x}>", byte);
                    }
                }
                pc += 1;
                continue;
            };

            let operands = code.get(pc + 1..pc + 1 + op.operand_len());
            match operands {
                Some(operands) => self.disassemble_op(op, operands, pc),
                None => {
                    let _ = write!(self.output, "{} <truncated>", op.name());
                }
            }
            self.output.push('\n');
            pc += 1 + op.operand_len();
        }
    }

    fn disassemble_op(&mut self, op: Op, operands: &[u8], pc: usize) {
        let wide = || u16::from_be_bytes([operands[0], operands[1]]);
        let name = op.name();
        match op {
            Op::Bipush => {
                let _ = write!(self.output, "{} {}", name, operands[0] as i8);
            }
            Op::Vload | Op::Vstore | Op::New | Op::NewArray | Op::AAddF => {
                let _ = write!(self.output, "{} {}", name, operands[0]);
            }
            Op::Ildc => {
                let index = wide() as usize;
                match self.program.int_pool.get(index) {
                    Some(n) => {
                        let _ = write!(self.output, "{} {}  # {}", name, index, n);
                    }
                    None => {
                        let _ = write!(self.output, "{} {}  # <invalid>", name, index);
                    }
                }
            }
            Op::Aldc => {
                let offset = wide() as usize;
                let text = self
                    .program
                    .string_pool
                    .get(offset..)
                    .map(|rest| rest.split(|&b| b == 0).next().unwrap_or(rest))
                    .map(|s| format!("{:?}", String::from_utf8_lossy(s)))
                    .unwrap_or_else(|| "<invalid>".to_string());
                let _ = write!(self.output, "{} {}  # {}", name, offset, text);
            }
            _ if op.is_branch() => {
                let offset = wide() as i16;
                let target = pc as isize + offset as isize;
                let _ = write!(self.output, "{} {:+}  # -> {:04}", name, offset, target);
            }
            Op::InvokeStatic => {
                let _ = write!(self.output, "{} {}", name, wide());
            }
            Op::InvokeNative => {
                let index = wide() as usize;
                let label = self.native_label(index);
                let _ = write!(self.output, "{} {}  # {}", name, index, label);
            }
            _ => self.output.push_str(name),
        }
    }

    fn native_label(&self, index: usize) -> String {
        let Some(native) = self.program.natives.get(index) else {
            return "<invalid>".to_string();
        };
        let name = self
            .natives
            .and_then(|t| t.name(native.function_table_index))
            .unwrap_or("?");
        format!(
            "{}/{} (table {})",
            name, native.num_args, native.function_table_index
        )
    }
}

/// Disassemble `program`, naming natives from the standard library.
pub fn disassemble(program: &Program) -> String {
    let natives = NativeTable::standard();
    let mut disassembler = Disassembler::new(program).with_natives(&natives);
    disassembler.disassemble().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::NativeInfo;

    #[test]
    fn test_listing() {
        let program = Program {
            int_pool: vec![100000],
            string_pool: b"hi\0".to_vec(),
            functions: vec![Function::new(
                0,
                1,
                vec![
                    0x10, 0xFF, // bipush -1
                    0x13, 0x00, 0x00, // ildc 0
                    0x14, 0x00, 0x00, // aldc 0
                    0xB7, 0x00, 0x00, // invokenative 0
                    0xA7, 0xFF, 0xF5, // goto -11
                    0xB0,
                ],
            )],
            natives: vec![NativeInfo {
                num_args: 1,
                function_table_index: 10,
            }],
        };
        let out = disassemble(&program);
        assert!(out.contains("0000: bipush -1"));
        assert!(out.contains("0002: ildc 0  # 100000"));
        assert!(out.contains("0005: aldc 0  # \"hi\""));
        assert!(out.contains("0008: invokenative 0  # println/1 (table 10)"));
        assert!(out.contains("0011: goto -11  # -> 0000"));
        assert!(out.contains("0014: return"));
    }

    #[test]
    fn test_unknown_bytes() {
        let program = Program::from_main(0, vec![0xB6, 0xFE, 0x10]);
        let out = disassemble(&program);
        assert!(out.contains("0000: <invokedynamic 0xb6: unsupported>"));
        assert!(out.contains("0001: <invalid 0xfe>"));
        assert!(out.contains("0002: bipush <truncated>"));
    }
}
