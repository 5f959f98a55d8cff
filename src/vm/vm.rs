use std::io::{self, BufRead, Write};

use serde::Serialize;
use tracing::{debug, trace};

use super::error::{Result, VmError};
use super::frame::Frame;
use super::heap::Heap;
use super::natives::{NativeContext, NativeTable};
use super::ops::Op;
use super::stack::Stack;
use super::value::{Address, Value};
use super::{Function, Program};

/// Execution statistics for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VmStats {
    pub instructions: u64,
    pub calls: u64,
    pub native_calls: u64,
    pub max_call_depth: usize,
    /// Blocks the program allocated (the mapped string pool is excluded)
    pub heap_blocks: usize,
    pub heap_bytes: usize,
}

/// Outcome of executing one instruction.
enum ControlFlow {
    Continue,
    Exit(i32),
}

/// The C0 virtual machine.
pub struct VM {
    heap: Heap,
    natives: NativeTable,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
    /// Emit a trace event per executed instruction
    trace: bool,
    /// Per-opcode execution counts (only when profiling)
    opcode_counts: Option<Box<[u64; 256]>>,
    stats: VmStats,
}

impl VM {
    /// A VM with the standard natives wired to stdin/stdout.
    pub fn new() -> Self {
        Self::new_with_config(
            NativeTable::standard(),
            Box::new(io::BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    /// Create a VM with custom natives and I/O streams.
    pub fn new_with_config(
        natives: NativeTable,
        input: Box<dyn BufRead>,
        output: Box<dyn Write>,
    ) -> Self {
        Self {
            heap: Heap::new(),
            natives,
            input,
            output,
            trace: false,
            opcode_counts: None,
            stats: VmStats::default(),
        }
    }

    /// Create a VM with a custom native table wired to stdin/stdout.
    pub fn with_natives(natives: NativeTable) -> Self {
        Self::new_with_config(
            natives,
            Box::new(io::BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    /// Create a VM with the standard natives and custom I/O streams.
    pub fn with_io(input: Box<dyn BufRead>, output: Box<dyn Write>) -> Self {
        Self::new_with_config(NativeTable::standard(), input, output)
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn set_profile_opcodes(&mut self, enabled: bool) {
        self.opcode_counts = enabled.then(|| Box::new([0u64; 256]));
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Executed opcodes and their counts, most frequent first.
    pub fn opcode_profile(&self) -> Vec<(&'static str, u64)> {
        let Some(counts) = &self.opcode_counts else {
            return Vec::new();
        };
        let mut profile: Vec<(&'static str, u64)> = counts
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .filter_map(|(byte, n)| Op::from_byte(byte as u8).map(|op| (op.name(), *n)))
            .collect();
        profile.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        profile
    }

    /// Run `program` from `functions[0]` until its outermost `RETURN`.
    pub fn run(&mut self, program: &Program) -> Result<i32> {
        let main = function(program, 0)?;
        let strings = self.heap.alloc_static(&program.string_pool)?;
        // Heap figures count what the program allocates, not the string pool.
        let blocks_before = self.heap.block_count();
        let bytes_before = self.heap.bytes_allocated();

        let mut frame = Frame::new(0, main.num_vars as usize);
        let mut call_stack: Stack<Frame> = Stack::new();
        self.stats = VmStats {
            max_call_depth: 1,
            ..VmStats::default()
        };
        if let Some(counts) = &mut self.opcode_counts {
            counts.fill(0);
        }

        let result = loop {
            match self.step(program, strings, &mut frame, &mut call_stack) {
                Ok(ControlFlow::Continue) => {}
                Ok(ControlFlow::Exit(value)) => break Ok(value),
                Err(e) => {
                    debug!(function = frame.function, pc = frame.pc, error = %e, "abort");
                    break Err(e);
                }
            }
        };

        self.stats.heap_blocks = self.heap.block_count() - blocks_before;
        self.stats.heap_bytes = self.heap.bytes_allocated() - bytes_before;
        let flushed = self.output.flush();
        let value = result?;
        flushed?;
        Ok(value)
    }

    fn step(
        &mut self,
        program: &Program,
        strings: Address,
        frame: &mut Frame,
        call_stack: &mut Stack<Frame>,
    ) -> Result<ControlFlow> {
        let code = &function(program, frame.function)?.code;
        let pc = frame.pc;
        let byte = *code.get(pc).ok_or(VmError::PcOutOfBounds {
            pc,
            len: code.len(),
        })?;
        let op = Op::from_byte(byte).ok_or(VmError::InvalidOpcode { opcode: byte, pc })?;

        self.stats.instructions += 1;
        if let Some(counts) = &mut self.opcode_counts {
            counts[byte as usize] += 1;
        }
        if self.trace {
            trace!(
                function = frame.function,
                pc,
                op = op.name(),
                stack = frame.stack.len(),
                "exec"
            );
        }

        let next_pc = pc + 1 + op.operand_len();
        let stack = &mut frame.stack;

        match op {
            // Stack operations
            Op::Pop => {
                stack.pop()?;
            }
            Op::Dup => {
                let v = stack.pop()?;
                stack.push(v);
                stack.push(v);
            }
            Op::Swap => {
                let v1 = stack.pop()?;
                let v2 = stack.pop()?;
                stack.push(v1);
                stack.push(v2);
            }

            // Arithmetic
            Op::IAdd
            | Op::ISub
            | Op::IMul
            | Op::IDiv
            | Op::IRem
            | Op::IAnd
            | Op::IOr
            | Op::IXor
            | Op::IShl
            | Op::IShr => {
                let a = stack.pop_int()?;
                let b = stack.pop_int()?;
                stack.push(Value::int(arith(op, b, a)?));
            }

            // Constants
            Op::Bipush => {
                let n = operand_u8(code, pc)? as i8;
                stack.push(Value::int(n as i32));
            }
            Op::Ildc => {
                let index = operand_u16(code, pc)? as usize;
                let n = *program
                    .int_pool
                    .get(index)
                    .ok_or(VmError::InvalidPoolIndex { pool: "int", index })?;
                stack.push(Value::int(n));
            }
            Op::Aldc => {
                let index = operand_u16(code, pc)? as usize;
                if index >= program.string_pool.len() {
                    return Err(VmError::InvalidPoolIndex {
                        pool: "string",
                        index,
                    });
                }
                stack.push(Value::ptr(Some(strings.add(index as u32))));
            }
            Op::AconstNull => {
                stack.push(Value::null());
            }

            // Locals
            Op::Vload => {
                let index = operand_u8(code, pc)? as usize;
                let v = frame.local(index)?;
                frame.stack.push(v);
            }
            Op::Vstore => {
                let index = operand_u8(code, pc)? as usize;
                let v = stack.pop()?;
                frame.set_local(index, v)?;
            }

            // Assertions and errors
            Op::Athrow => {
                let msg = stack.pop_ptr()?;
                return Err(VmError::User(self.message(msg)?));
            }
            Op::Assert => {
                let msg = stack.pop_ptr()?;
                let cond = stack.pop_int()?;
                if cond == 0 {
                    return Err(VmError::AssertionFailed(self.message(msg)?));
                }
            }

            // Control flow
            Op::Nop => {}
            Op::IfCmpEq | Op::IfCmpNe => {
                let x = stack.pop()?;
                let y = stack.pop()?;
                let taken = if op == Op::IfCmpEq { x == y } else { x != y };
                if taken {
                    frame.pc = branch_target(code, pc)?;
                    return Ok(ControlFlow::Continue);
                }
            }
            Op::IfICmpLt | Op::IfICmpGe | Op::IfICmpGt | Op::IfICmpLe => {
                let x = stack.pop_int()?;
                let y = stack.pop_int()?;
                let taken = match op {
                    Op::IfICmpLt => y < x,
                    Op::IfICmpGe => y >= x,
                    Op::IfICmpGt => y > x,
                    _ => y <= x,
                };
                if taken {
                    frame.pc = branch_target(code, pc)?;
                    return Ok(ControlFlow::Continue);
                }
            }
            Op::Goto => {
                frame.pc = branch_target(code, pc)?;
                return Ok(ControlFlow::Continue);
            }

            // Calls
            Op::InvokeStatic => {
                let index = operand_u16(code, pc)? as usize;
                let callee = function(program, index)?;
                let mut callee_frame = Frame::new(index, callee.num_vars as usize);
                for i in (0..callee.num_args as usize).rev() {
                    let arg = frame.stack.pop()?;
                    callee_frame.set_local(i, arg)?;
                }
                frame.pc = next_pc;
                let caller = std::mem::replace(frame, callee_frame);
                call_stack.push(caller);

                self.stats.calls += 1;
                self.stats.max_call_depth = self.stats.max_call_depth.max(call_stack.len() + 1);
                debug!(function = index, depth = call_stack.len(), "call");
                return Ok(ControlFlow::Continue);
            }
            Op::Return => {
                let result = stack.pop()?;
                if !stack.is_empty() {
                    return Err(VmError::UnbalancedReturn {
                        remaining: stack.len(),
                    });
                }
                if call_stack.is_empty() {
                    return Ok(ControlFlow::Exit(result.as_int()?));
                }
                *frame = call_stack.pop()?;
                frame.stack.push(result);
                debug!(function = frame.function, depth = call_stack.len(), "return");
                return Ok(ControlFlow::Continue);
            }
            Op::InvokeNative => {
                let index = operand_u16(code, pc)? as usize;
                let native = *program.natives.get(index).ok_or(VmError::InvalidPoolIndex {
                    pool: "native",
                    index,
                })?;
                let mut args = vec![Value::default(); native.num_args as usize];
                for slot in args.iter_mut().rev() {
                    *slot = stack.pop()?;
                }
                let mut ctx = NativeContext {
                    heap: &mut self.heap,
                    input: &mut *self.input,
                    output: &mut *self.output,
                };
                let result = self
                    .natives
                    .call(native.function_table_index, &mut ctx, &args)?;
                self.stats.native_calls += 1;
                stack.push(result);
            }

            // Memory
            Op::New => {
                let size = operand_u8(code, pc)? as usize;
                let p = self.heap.alloc(size)?;
                stack.push(Value::ptr(Some(p)));
            }
            Op::IMLoad => {
                let p = stack.pop_ptr()?;
                stack.push(Value::int(self.heap.load_int(p)?));
            }
            Op::IMStore => {
                let v = stack.pop_int()?;
                let p = stack.pop_ptr()?;
                self.heap.store_int(p, v)?;
            }
            Op::AMLoad => {
                let p = stack.pop_ptr()?;
                stack.push(Value::ptr(self.heap.load_ptr(p)?));
            }
            Op::AMStore => {
                let v = stack.pop_ptr()?;
                let p = stack.pop_ptr()?;
                self.heap.store_ptr(p, v)?;
            }
            Op::CMLoad => {
                let p = stack.pop_ptr()?;
                stack.push(Value::int(self.heap.load_char(p)?));
            }
            Op::CMStore => {
                let v = stack.pop_int()?;
                let p = stack.pop_ptr()?;
                self.heap.store_char(p, v)?;
            }
            Op::AAddF => {
                let offset = operand_u8(code, pc)?;
                let p = stack.pop_ptr()?;
                stack.push(Value::ptr(Some(self.heap.field(p, offset)?)));
            }

            // Arrays
            Op::NewArray => {
                let elt_size = operand_u8(code, pc)?;
                let count = stack.pop_int()?;
                let p = self.heap.alloc_array(elt_size, count)?;
                stack.push(Value::ptr(Some(p)));
            }
            Op::ArrayLength => {
                let p = stack.pop_ptr()?;
                stack.push(Value::int(self.heap.array_length(p)?));
            }
            Op::AAddS => {
                let index = stack.pop_int()?;
                let p = stack.pop_ptr()?;
                stack.push(Value::ptr(Some(self.heap.array_element(p, index)?)));
            }
        }

        frame.pc = next_pc;
        Ok(ControlFlow::Continue)
    }

    /// Text of an error message string; `NULL` prints the way C's printf does.
    fn message(&self, ptr: Option<Address>) -> Result<String> {
        match ptr {
            None => Ok("(null)".to_string()),
            Some(_) => Ok(String::from_utf8_lossy(&self.heap.read_c_string(ptr)?).into_owned()),
        }
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

fn function(program: &Program, index: usize) -> Result<&Function> {
    program.functions.get(index).ok_or(VmError::InvalidPoolIndex {
        pool: "function",
        index,
    })
}

/// Integer arithmetic on `b OP a`, where `a` was on top of the stack.
fn arith(op: Op, b: i32, a: i32) -> Result<i32> {
    let n = match op {
        Op::IAdd => b.wrapping_add(a),
        Op::ISub => b.wrapping_sub(a),
        Op::IMul => b.wrapping_mul(a),
        Op::IDiv | Op::IRem => {
            if a == 0 {
                return Err(VmError::arith("division by zero"));
            }
            if a == -1 && b == i32::MIN {
                return Err(VmError::arith("division of INT_MIN by -1 overflows"));
            }
            if op == Op::IDiv { b / a } else { b % a }
        }
        Op::IAnd => b & a,
        Op::IOr => b | a,
        Op::IXor => b ^ a,
        Op::IShl | Op::IShr => {
            if !(0..32).contains(&a) {
                return Err(VmError::Arithmetic(format!("shift by {} out of range", a)));
            }
            if op == Op::IShl { b << a } else { b >> a }
        }
        _ => unreachable!("{} is not an arithmetic opcode", op.name()),
    };
    Ok(n)
}

fn operand_u8(code: &[u8], pc: usize) -> Result<u8> {
    code.get(pc + 1).copied().ok_or(VmError::PcOutOfBounds {
        pc: pc + 1,
        len: code.len(),
    })
}

/// Big-endian two-byte operand following the opcode at `pc`.
fn operand_u16(code: &[u8], pc: usize) -> Result<u16> {
    match code.get(pc + 1..pc + 3) {
        Some(&[hi, lo]) => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(VmError::PcOutOfBounds {
            pc: pc + 1,
            len: code.len(),
        }),
    }
}

/// Target of the branch at `pc`: its offset is relative to the opcode byte.
fn branch_target(code: &[u8], pc: usize) -> Result<usize> {
    let offset = operand_u16(code, pc)? as i16;
    let target = pc as isize + offset as isize;
    if target < 0 || target as usize >= code.len() {
        return Err(VmError::PcOutOfBounds {
            pc: target.max(0) as usize,
            len: code.len(),
        });
    }
    Ok(target as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::NativeInfo;
    use std::cell::RefCell;
    use std::rc::Rc;

    // Opcode bytes for hand-assembled code.
    const BIPUSH: u8 = 0x10;
    const IADD: u8 = 0x60;
    const ISUB: u8 = 0x64;
    const IMUL: u8 = 0x68;
    const IDIV: u8 = 0x6C;
    const IREM: u8 = 0x70;
    const ISHL: u8 = 0x78;
    const ISHR: u8 = 0x7A;
    const ILDC: u8 = 0x13;
    const RETURN: u8 = 0xB0;
    const POP: u8 = 0x57;
    const DUP: u8 = 0x59;
    const SWAP: u8 = 0x5F;
    const VLOAD: u8 = 0x15;
    const VSTORE: u8 = 0x36;
    const GOTO: u8 = 0xA7;
    const IF_CMPEQ: u8 = 0x9F;
    const IF_ICMPLT: u8 = 0xA1;
    const IF_ICMPGE: u8 = 0xA2;
    const IF_ICMPGT: u8 = 0xA3;
    const IF_ICMPLE: u8 = 0xA4;
    const INVOKESTATIC: u8 = 0xB8;
    const INVOKENATIVE: u8 = 0xB7;
    const ACONST_NULL: u8 = 0x01;
    const ALDC: u8 = 0x14;
    const ATHROW: u8 = 0xBF;
    const ASSERT: u8 = 0xCF;
    const NEW: u8 = 0xBB;
    const IMLOAD: u8 = 0x2E;
    const IMSTORE: u8 = 0x4E;
    const AMLOAD: u8 = 0x2F;
    const AMSTORE: u8 = 0x4F;
    const CMLOAD: u8 = 0x34;
    const CMSTORE: u8 = 0x55;
    const AADDF: u8 = 0x62;
    const NEWARRAY: u8 = 0xBC;
    const ARRAYLENGTH: u8 = 0xBE;
    const AADDS: u8 = 0x63;

    fn run_program(program: &Program) -> Result<i32> {
        let mut vm = VM::with_io(Box::new(io::empty()), Box::new(io::sink()));
        vm.run(program)
    }

    fn run_code(num_vars: u16, code: Vec<u8>) -> Result<i32> {
        run_program(&Program::from_main(num_vars, code))
    }

    /// Evaluate `b OP a` for an arithmetic opcode using the int pool.
    fn binop(b: i32, a: i32, op: u8) -> Result<i32> {
        let program = Program {
            int_pool: vec![b, a],
            functions: vec![Function::new(0, 0, vec![ILDC, 0, 0, ILDC, 0, 1, op, RETURN])],
            ..Default::default()
        };
        run_program(&program)
    }

    /// Runs `y; x; IF_xx +7; BIPUSH 0; RETURN; BIPUSH 1; RETURN`: 1 iff taken.
    fn branch_taken(y: i32, x: i32, op: u8) -> bool {
        let program = Program {
            int_pool: vec![y, x],
            functions: vec![Function::new(
                0,
                0,
                vec![
                    ILDC, 0, 0, // 0
                    ILDC, 0, 1, // 3
                    op, 0, 7, // 6 -> 13
                    BIPUSH, 0, // 9
                    RETURN, // 11
                    0x00, // 12
                    BIPUSH, 1, // 13
                    RETURN,
                ],
            )],
            ..Default::default()
        };
        run_program(&program).unwrap() == 1
    }

    #[test]
    fn test_add() {
        assert_eq!(run_code(0, vec![BIPUSH, 5, BIPUSH, 3, IADD, RETURN]), Ok(8));
    }

    #[test]
    fn test_bipush_sign_extends() {
        assert_eq!(run_code(0, vec![BIPUSH, 0xFF, RETURN]), Ok(-1));
        assert_eq!(run_code(0, vec![BIPUSH, 0x80, RETURN]), Ok(-128));
    }

    #[test]
    fn test_operand_order() {
        assert_eq!(binop(10, 3, ISUB), Ok(7));
        assert_eq!(binop(10, 3, IDIV), Ok(3));
        assert_eq!(binop(-7, 2, IDIV), Ok(-3));
        assert_eq!(binop(-7, 2, IREM), Ok(-1));
        assert_eq!(binop(7, -2, IREM), Ok(1));
        assert_eq!(binop(1, 4, ISHL), Ok(16));
        assert_eq!(binop(-16, 2, ISHR), Ok(-4));
    }

    #[test]
    fn test_wrapping_arithmetic() {
        assert_eq!(binop(i32::MAX, 1, IADD), Ok(i32::MIN));
        assert_eq!(binop(i32::MIN, 1, ISUB), Ok(i32::MAX));
        assert_eq!(binop(i32::MAX, 2, IMUL), Ok(-2));
        assert_eq!(binop(0x10000, 0x10000, IMUL), Ok(0));
    }

    #[test]
    fn test_division_errors() {
        assert!(matches!(
            run_code(0, vec![BIPUSH, 1, BIPUSH, 0, IDIV, RETURN]),
            Err(VmError::Arithmetic(_))
        ));
        assert!(matches!(binop(5, 0, IREM), Err(VmError::Arithmetic(_))));
        assert!(matches!(binop(i32::MIN, -1, IDIV), Err(VmError::Arithmetic(_))));
        assert!(matches!(binop(i32::MIN, -1, IREM), Err(VmError::Arithmetic(_))));
        assert_eq!(binop(i32::MIN, 1, IDIV), Ok(i32::MIN));
    }

    #[test]
    fn test_shift_range() {
        assert!(matches!(binop(1, 32, ISHL), Err(VmError::Arithmetic(_))));
        assert!(matches!(binop(1, -1, ISHL), Err(VmError::Arithmetic(_))));
        assert!(matches!(binop(1, 32, ISHR), Err(VmError::Arithmetic(_))));
        assert_eq!(binop(1, 31, ISHL), Ok(i32::MIN));
        assert_eq!(binop(i32::MIN, 31, ISHR), Ok(-1));
    }

    #[test]
    fn test_stack_ops() {
        // 7 3 SWAP ISUB = 3 - 7
        assert_eq!(run_code(0, vec![BIPUSH, 7, BIPUSH, 3, SWAP, ISUB, RETURN]), Ok(-4));
        assert_eq!(run_code(0, vec![BIPUSH, 6, DUP, IMUL, RETURN]), Ok(36));
        assert_eq!(run_code(0, vec![BIPUSH, 1, BIPUSH, 2, POP, RETURN]), Ok(1));
    }

    #[test]
    fn test_locals() {
        let code = vec![BIPUSH, 42, VSTORE, 1, VLOAD, 1, VLOAD, 0, IADD, RETURN];
        assert_eq!(run_code(2, code), Ok(42));
    }

    #[test]
    fn test_local_out_of_range() {
        assert!(matches!(
            run_code(1, vec![VLOAD, 1, RETURN]),
            Err(VmError::InvalidLocal { index: 1, num_vars: 1 })
        ));
    }

    #[test]
    fn test_branch_polarity() {
        // Taken iff `y OP x`, with x on top of the stack.
        assert!(branch_taken(1, 2, IF_ICMPLT));
        assert!(!branch_taken(2, 2, IF_ICMPLT));
        assert!(!branch_taken(3, 2, IF_ICMPLT));

        assert!(branch_taken(2, 2, IF_ICMPGE));
        assert!(branch_taken(3, 2, IF_ICMPGE));
        assert!(!branch_taken(1, 2, IF_ICMPGE));

        assert!(branch_taken(3, 2, IF_ICMPGT));
        assert!(!branch_taken(2, 2, IF_ICMPGT));

        assert!(branch_taken(2, 2, IF_ICMPLE));
        assert!(branch_taken(1, 2, IF_ICMPLE));
        assert!(!branch_taken(3, 2, IF_ICMPLE));

        assert!(branch_taken(-5, -5, IF_CMPEQ));
        assert!(!branch_taken(-5, 5, IF_CMPEQ));
    }

    #[test]
    fn test_backward_loop() {
        // sum = 0; i = 0; while (i < 10) { sum += i; i++; } return sum;
        let code = vec![
            BIPUSH, 0, VSTORE, 0, // 0: sum = 0
            BIPUSH, 0, VSTORE, 1, // 4: i = 0
            VLOAD, 1, BIPUSH, 10, // 8: loop head
            IF_ICMPLT, 0, 6, // 12 -> 18
            GOTO, 0, 20, // 15 -> 35
            VLOAD, 0, VLOAD, 1, IADD, VSTORE, 0, // 18
            VLOAD, 1, BIPUSH, 1, IADD, VSTORE, 1, // 25
            GOTO, 0xFF, 0xE8, // 32 -> 8
            VLOAD, 0, RETURN, // 35
        ];
        assert_eq!(run_code(2, code), Ok(45));
    }

    #[test]
    fn test_branch_outside_code() {
        assert!(matches!(
            run_code(0, vec![GOTO, 0xFF, 0x00]),
            Err(VmError::PcOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_invalid_and_extension_opcodes() {
        assert_eq!(
            run_code(0, vec![BIPUSH, 1, 0xFE]),
            Err(VmError::InvalidOpcode { opcode: 0xFE, pc: 2 })
        );
        for ext in [0x16, 0x17, 0xB6, 0xC0, 0xC1, 0xC2] {
            assert_eq!(
                run_code(0, vec![ext]),
                Err(VmError::InvalidOpcode { opcode: ext, pc: 0 })
            );
        }
    }

    #[test]
    fn test_running_off_the_end() {
        assert!(matches!(
            run_code(0, vec![BIPUSH, 1]),
            Err(VmError::PcOutOfBounds { pc: 2, len: 2 })
        ));
    }

    #[test]
    fn test_unbalanced_return() {
        assert_eq!(
            run_code(0, vec![BIPUSH, 1, BIPUSH, 2, RETURN]),
            Err(VmError::UnbalancedReturn { remaining: 1 })
        );
    }

    #[test]
    fn test_athrow_and_assert() {
        let program = Program {
            string_pool: b"boom\0ok\0".to_vec(),
            functions: vec![Function::new(0, 0, vec![ALDC, 0, 0, ATHROW])],
            ..Default::default()
        };
        assert_eq!(run_program(&program), Err(VmError::User("boom".into())));

        let failing = Program {
            string_pool: b"boom\0x > 0\0".to_vec(),
            functions: vec![Function::new(0, 0, vec![BIPUSH, 0, ALDC, 0, 5, ASSERT])],
            ..Default::default()
        };
        assert_eq!(
            run_program(&failing),
            Err(VmError::AssertionFailed("x > 0".into()))
        );

        let passing = Program {
            string_pool: b"boom\0".to_vec(),
            functions: vec![Function::new(
                0,
                0,
                vec![BIPUSH, 1, ALDC, 0, 0, ASSERT, BIPUSH, 9, RETURN],
            )],
            ..Default::default()
        };
        assert_eq!(run_program(&passing), Ok(9));
    }

    #[test]
    fn test_athrow_null_message() {
        assert_eq!(
            run_code(0, vec![ACONST_NULL, ATHROW]),
            Err(VmError::User("(null)".into()))
        );
    }

    #[test]
    fn test_null_pointer_memory_errors() {
        for code in [
            vec![ACONST_NULL, IMLOAD, RETURN],
            vec![ACONST_NULL, BIPUSH, 1, IMSTORE],
            vec![ACONST_NULL, AMLOAD],
            vec![ACONST_NULL, ACONST_NULL, AMSTORE],
            vec![ACONST_NULL, CMLOAD, RETURN],
            vec![ACONST_NULL, BIPUSH, 65, CMSTORE],
            vec![ACONST_NULL, AADDF, 4],
            vec![ACONST_NULL, BIPUSH, 0, AADDS],
            vec![ACONST_NULL, ARRAYLENGTH],
        ] {
            assert!(
                matches!(run_code(0, code.clone()), Err(VmError::Memory(_))),
                "{:?}",
                code
            );
        }
    }

    #[test]
    fn test_struct_fields() {
        // struct { int a; int b; }* p = alloc; p->b = 7; p->a = 5; return p->a * p->b
        let code = vec![
            NEW, 8, VSTORE, 0, //
            VLOAD, 0, AADDF, 4, BIPUSH, 7, IMSTORE, //
            VLOAD, 0, AADDF, 0, BIPUSH, 5, IMSTORE, //
            VLOAD, 0, AADDF, 0, IMLOAD, //
            VLOAD, 0, AADDF, 4, IMLOAD, //
            IMUL, RETURN,
        ];
        assert_eq!(run_code(1, code), Ok(35));
    }

    #[test]
    fn test_pointer_fields() {
        // node->next = node; return node->next == node
        let code = vec![
            NEW, 16, VSTORE, 0, //
            VLOAD, 0, AADDF, 8, VLOAD, 0, AMSTORE, //
            VLOAD, 0, AADDF, 8, AMLOAD, VLOAD, 0, //
            IF_CMPEQ, 0, 9, // 18 -> 27
            BIPUSH, 0, RETURN, //
            0x00, 0x00, 0x00, //
            BIPUSH, 1, RETURN,
        ];
        assert_eq!(run_code(1, code), Ok(1));
    }

    #[test]
    fn test_char_store_masks() {
        let code = vec![NEW, 1, DUP, BIPUSH, 0xC1, CMSTORE, CMLOAD, RETURN];
        assert_eq!(run_code(0, code), Ok(0x41));
    }

    #[test]
    fn test_arrays() {
        // int[] A = alloc_array(int, 3); A[2] = 11; return A[2] + \length(A)
        let code = vec![
            BIPUSH, 3, NEWARRAY, 4, VSTORE, 0, //
            VLOAD, 0, BIPUSH, 2, AADDS, BIPUSH, 11, IMSTORE, //
            VLOAD, 0, BIPUSH, 2, AADDS, IMLOAD, //
            VLOAD, 0, ARRAYLENGTH, IADD, RETURN,
        ];
        assert_eq!(run_code(1, code), Ok(14));
    }

    #[test]
    fn test_array_out_of_bounds() {
        let code = vec![BIPUSH, 3, NEWARRAY, 4, BIPUSH, 5, AADDS, IMLOAD, RETURN];
        assert!(matches!(run_code(0, code), Err(VmError::Memory(_))));
        let code = vec![BIPUSH, 3, NEWARRAY, 4, BIPUSH, 0xFF, AADDS, IMLOAD, RETURN];
        assert!(matches!(run_code(0, code), Err(VmError::Memory(_))));
    }

    #[test]
    fn test_negative_array_size() {
        let code = vec![BIPUSH, 0xFF, NEWARRAY, 4, ARRAYLENGTH, RETURN];
        assert!(matches!(run_code(0, code), Err(VmError::Memory(_))));
    }

    #[test]
    fn test_string_constant_chars() {
        let program = Program {
            string_pool: b"x\0hey\0".to_vec(),
            functions: vec![Function::new(0, 0, vec![ALDC, 0, 2, AADDF, 1, CMLOAD, RETURN])],
            ..Default::default()
        };
        assert_eq!(run_program(&program), Ok(b'e' as i32));
    }

    #[test]
    fn test_write_to_string_constant_fails() {
        let program = Program {
            string_pool: b"hey\0".to_vec(),
            functions: vec![Function::new(0, 0, vec![ALDC, 0, 0, BIPUSH, 65, CMSTORE])],
            ..Default::default()
        };
        assert!(matches!(run_program(&program), Err(VmError::Memory(_))));
    }

    fn factorial_program() -> Program {
        // int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); }
        let fact = vec![
            VLOAD, 0, BIPUSH, 1, //
            IF_ICMPGT, 0, 6, // n > 1 -> 10
            BIPUSH, 1, RETURN, //
            VLOAD, 0, // 10
            VLOAD, 0, BIPUSH, 1, ISUB, //
            INVOKESTATIC, 0, 1, //
            IMUL, RETURN,
        ];
        Program {
            functions: vec![
                Function::new(0, 0, vec![BIPUSH, 5, INVOKESTATIC, 0, 1, RETURN]),
                Function::new(1, 1, fact),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_recursive_factorial() {
        let mut vm = VM::with_io(Box::new(io::empty()), Box::new(io::sink()));
        assert_eq!(vm.run(&factorial_program()), Ok(120));
        assert_eq!(vm.stats().calls, 5);
        assert_eq!(vm.stats().max_call_depth, 6);
    }

    #[test]
    fn test_call_preserves_caller_state() {
        // main: locals[0] = 100; push 7; push 3; push 4; call sub; ... stack is [7, 1]
        let main = vec![
            BIPUSH, 100, VSTORE, 0, //
            BIPUSH, 7, BIPUSH, 3, BIPUSH, 4, //
            INVOKESTATIC, 0, 1, // sub(3, 4) = 3 - 4
            IADD, // 7 + -1
            VLOAD, 0, IADD, RETURN,
        ];
        let sub = vec![
            BIPUSH, 0, VSTORE, 2, // scratch local
            VLOAD, 0, VLOAD, 1, ISUB, RETURN,
        ];
        let program = Program {
            functions: vec![Function::new(0, 1, main), Function::new(2, 3, sub)],
            ..Default::default()
        };
        assert_eq!(run_program(&program), Ok(106));
    }

    #[test]
    fn test_nested_calls_restore_frames() {
        // f0 -> f1 -> f2 -> f3, each callee returns 1 + its callee.
        let leaf = vec![BIPUSH, 1, RETURN];
        let mid = |next: u8| vec![INVOKESTATIC, 0, next, BIPUSH, 1, IADD, RETURN];
        let main = vec![
            BIPUSH, 50, VSTORE, 0, BIPUSH, 9, // stack [9], locals [50]
            INVOKESTATIC, 0, 1, //
            IADD, VLOAD, 0, IADD, RETURN,
        ];
        let program = Program {
            functions: vec![
                Function::new(0, 1, main),
                Function::new(0, 0, mid(2)),
                Function::new(0, 0, mid(3)),
                Function::new(0, 0, leaf),
            ],
            ..Default::default()
        };
        assert_eq!(run_program(&program), Ok(9 + 3 + 50));
    }

    #[test]
    fn test_returning_a_pointer_to_caller() {
        let make = vec![NEW, 4, DUP, BIPUSH, 21, IMSTORE, RETURN];
        let program = Program {
            functions: vec![
                Function::new(0, 0, vec![INVOKESTATIC, 0, 1, IMLOAD, RETURN]),
                Function::new(0, 0, make),
            ],
            ..Default::default()
        };
        assert_eq!(run_program(&program), Ok(21));
    }

    #[test]
    fn test_main_must_return_int() {
        assert!(matches!(
            run_code(0, vec![ACONST_NULL, RETURN]),
            Err(VmError::TypeMismatch { .. })
        ));
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invoke_native() {
        // printint(40 + 2); println("done"); return 0
        let program = Program {
            string_pool: b"done\0".to_vec(),
            functions: vec![Function::new(
                0,
                0,
                vec![
                    BIPUSH, 40, BIPUSH, 2, IADD, INVOKENATIVE, 0, 0, POP, //
                    ALDC, 0, 0, INVOKENATIVE, 0, 1, POP, //
                    BIPUSH, 0, RETURN,
                ],
            )],
            natives: vec![
                NativeInfo {
                    num_args: 1,
                    function_table_index: crate::vm::natives::CONIO_PRINTINT,
                },
                NativeInfo {
                    num_args: 1,
                    function_table_index: crate::vm::natives::CONIO_PRINTLN,
                },
            ],
            ..Default::default()
        };
        let out = SharedBuf::default();
        let mut vm = VM::with_io(Box::new(io::empty()), Box::new(out.clone()));
        assert_eq!(vm.run(&program), Ok(0));
        assert_eq!(String::from_utf8(out.0.borrow().clone()).unwrap(), "42done\n");
        assert_eq!(vm.stats().native_calls, 2);
    }

    #[test]
    fn test_native_argument_order() {
        fn minus(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value> {
            Ok(Value::int(args[0].as_int()? - args[1].as_int()?))
        }
        let mut natives = NativeTable::new();
        natives.register(0, "minus", 2, minus);
        let program = Program {
            functions: vec![Function::new(
                0,
                0,
                vec![BIPUSH, 10, BIPUSH, 4, INVOKENATIVE, 0, 0, RETURN],
            )],
            natives: vec![NativeInfo {
                num_args: 2,
                function_table_index: 0,
            }],
            ..Default::default()
        };
        let mut vm = VM::new_with_config(natives, Box::new(io::empty()), Box::new(io::sink()));
        assert_eq!(vm.run(&program), Ok(6));
    }

    #[test]
    fn test_unregistered_native() {
        let program = Program {
            functions: vec![Function::new(0, 0, vec![INVOKENATIVE, 0, 0, RETURN])],
            natives: vec![NativeInfo {
                num_args: 0,
                function_table_index: 200,
            }],
            ..Default::default()
        };
        assert_eq!(run_program(&program), Err(VmError::UnknownNative(200)));
    }

    #[test]
    fn test_heap_stats_count_program_allocations() {
        let program = Program {
            string_pool: b"padding\0".to_vec(),
            functions: vec![Function::new(
                0,
                0,
                vec![NEW, 12, POP, BIPUSH, 3, NEWARRAY, 4, POP, BIPUSH, 0, RETURN],
            )],
            ..Default::default()
        };
        let mut vm = VM::with_io(Box::new(io::empty()), Box::new(io::sink()));
        assert_eq!(vm.run(&program), Ok(0));
        // One struct block plus the array's header and element blocks.
        assert_eq!(vm.stats().heap_blocks, 3);
        assert_eq!(vm.stats().heap_bytes, 12 + 3 * 4);
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_failed_final_flush_is_an_error() {
        let mut vm = VM::with_io(Box::new(io::empty()), Box::new(BrokenPipe));
        let result = vm.run(&Program::from_main(0, vec![BIPUSH, 7, RETURN]));
        assert!(matches!(result, Err(VmError::NativeIo(_))));

        // A runtime error takes precedence over the flush failure.
        let result = vm.run(&Program::from_main(0, vec![BIPUSH, 1, BIPUSH, 0, IDIV, RETURN]));
        assert!(matches!(result, Err(VmError::Arithmetic(_))));
    }

    #[test]
    fn test_opcode_profile_resets_between_runs() {
        let mut vm = VM::with_io(Box::new(io::empty()), Box::new(io::sink()));
        vm.set_profile_opcodes(true);
        vm.run(&factorial_program()).unwrap();
        vm.run(&factorial_program()).unwrap();
        let profile = vm.opcode_profile();
        let vload = profile.iter().find(|(name, _)| *name == "vload").unwrap();
        assert_eq!(vload.1, 4 * 3 + 1);
        assert_eq!(vm.stats().calls, 5);
    }

    #[test]
    fn test_opcode_profile() {
        let mut vm = VM::with_io(Box::new(io::empty()), Box::new(io::sink()));
        vm.set_profile_opcodes(true);
        vm.run(&factorial_program()).unwrap();
        let profile = vm.opcode_profile();
        let vload = profile.iter().find(|(name, _)| *name == "vload").unwrap();
        // Four calls recurse (3 loads each), the base case loads once.
        assert_eq!(vload.1, 4 * 3 + 1);
        assert_eq!(vm.stats().instructions, profile.iter().map(|(_, n)| n).sum::<u64>());
    }
}
