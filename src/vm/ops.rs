/// Opcodes of the C0 virtual machine.
///
/// The discriminant of each variant is its byte value in `.bc0` code.
/// Immediate operands follow the opcode byte; see [`Op::operand_len`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // ========================================
    // Stack Manipulation
    // ========================================
    Pop = 0x57,
    Dup = 0x59,
    Swap = 0x5F,

    // ========================================
    // Arithmetic
    // ========================================
    IAdd = 0x60,
    ISub = 0x64,
    IMul = 0x68,
    IDiv = 0x6C,
    IRem = 0x70,
    IAnd = 0x7E,
    IOr = 0x80,
    IXor = 0x82,
    IShl = 0x78,
    IShr = 0x7A,

    // ========================================
    // Constants
    // ========================================
    Bipush = 0x10,
    Ildc = 0x13,
    Aldc = 0x14,
    AconstNull = 0x01,

    // ========================================
    // Local Variables
    // ========================================
    Vload = 0x15,
    Vstore = 0x36,

    // ========================================
    // Assertions and Errors
    // ========================================
    Athrow = 0xBF,
    Assert = 0xCF,

    // ========================================
    // Control Flow
    // ========================================
    Nop = 0x00,
    IfCmpEq = 0x9F,
    IfCmpNe = 0xA0,
    IfICmpLt = 0xA1,
    IfICmpGe = 0xA2,
    IfICmpGt = 0xA3,
    IfICmpLe = 0xA4,
    Goto = 0xA7,

    // ========================================
    // Calls
    // ========================================
    InvokeStatic = 0xB8,
    InvokeNative = 0xB7,
    Return = 0xB0,

    // ========================================
    // Memory
    // ========================================
    New = 0xBB,
    IMLoad = 0x2E,
    IMStore = 0x4E,
    AMLoad = 0x2F,
    AMStore = 0x4F,
    CMLoad = 0x34,
    CMStore = 0x55,
    AAddF = 0x62,

    // ========================================
    // Arrays
    // ========================================
    NewArray = 0xBC,
    ArrayLength = 0xBE,
    AAddS = 0x63,
}

impl Op {
    /// Decode an opcode byte. Unknown bytes and the C1 extensions yield `None`.
    pub fn from_byte(byte: u8) -> Option<Op> {
        let op = match byte {
            0x00 => Op::Nop,
            0x01 => Op::AconstNull,
            0x10 => Op::Bipush,
            0x13 => Op::Ildc,
            0x14 => Op::Aldc,
            0x15 => Op::Vload,
            0x2E => Op::IMLoad,
            0x2F => Op::AMLoad,
            0x34 => Op::CMLoad,
            0x36 => Op::Vstore,
            0x4E => Op::IMStore,
            0x4F => Op::AMStore,
            0x55 => Op::CMStore,
            0x57 => Op::Pop,
            0x59 => Op::Dup,
            0x5F => Op::Swap,
            0x60 => Op::IAdd,
            0x62 => Op::AAddF,
            0x63 => Op::AAddS,
            0x64 => Op::ISub,
            0x68 => Op::IMul,
            0x6C => Op::IDiv,
            0x70 => Op::IRem,
            0x78 => Op::IShl,
            0x7A => Op::IShr,
            0x7E => Op::IAnd,
            0x80 => Op::IOr,
            0x82 => Op::IXor,
            0x9F => Op::IfCmpEq,
            0xA0 => Op::IfCmpNe,
            0xA1 => Op::IfICmpLt,
            0xA2 => Op::IfICmpGe,
            0xA3 => Op::IfICmpGt,
            0xA4 => Op::IfICmpLe,
            0xA7 => Op::Goto,
            0xB0 => Op::Return,
            0xB7 => Op::InvokeNative,
            0xB8 => Op::InvokeStatic,
            0xBB => Op::New,
            0xBC => Op::NewArray,
            0xBE => Op::ArrayLength,
            0xBF => Op::Athrow,
            0xCF => Op::Assert,
            _ => return None,
        };
        Some(op)
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Number of immediate operand bytes following the opcode.
    pub fn operand_len(self) -> usize {
        match self {
            Op::Bipush | Op::Vload | Op::Vstore | Op::New | Op::NewArray | Op::AAddF => 1,
            Op::Ildc
            | Op::Aldc
            | Op::IfCmpEq
            | Op::IfCmpNe
            | Op::IfICmpLt
            | Op::IfICmpGe
            | Op::IfICmpGt
            | Op::IfICmpLe
            | Op::Goto
            | Op::InvokeStatic
            | Op::InvokeNative => 2,
            _ => 0,
        }
    }

    /// Whether the two operand bytes are a signed branch offset.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::IfCmpEq
                | Op::IfCmpNe
                | Op::IfICmpLt
                | Op::IfICmpGe
                | Op::IfICmpGt
                | Op::IfICmpLe
                | Op::Goto
        )
    }

    /// Mnemonic as written in `.bc0` listings.
    pub fn name(self) -> &'static str {
        match self {
            Op::Pop => "pop",
            Op::Dup => "dup",
            Op::Swap => "swap",
            Op::IAdd => "iadd",
            Op::ISub => "isub",
            Op::IMul => "imul",
            Op::IDiv => "idiv",
            Op::IRem => "irem",
            Op::IAnd => "iand",
            Op::IOr => "ior",
            Op::IXor => "ixor",
            Op::IShl => "ishl",
            Op::IShr => "ishr",
            Op::Bipush => "bipush",
            Op::Ildc => "ildc",
            Op::Aldc => "aldc",
            Op::AconstNull => "aconst_null",
            Op::Vload => "vload",
            Op::Vstore => "vstore",
            Op::Athrow => "athrow",
            Op::Assert => "assert",
            Op::Nop => "nop",
            Op::IfCmpEq => "if_cmpeq",
            Op::IfCmpNe => "if_cmpne",
            Op::IfICmpLt => "if_icmplt",
            Op::IfICmpGe => "if_icmpge",
            Op::IfICmpGt => "if_icmpgt",
            Op::IfICmpLe => "if_icmple",
            Op::Goto => "goto",
            Op::InvokeStatic => "invokestatic",
            Op::InvokeNative => "invokenative",
            Op::Return => "return",
            Op::New => "new",
            Op::IMLoad => "imload",
            Op::IMStore => "imstore",
            Op::AMLoad => "amload",
            Op::AMStore => "amstore",
            Op::CMLoad => "cmload",
            Op::CMStore => "cmstore",
            Op::AAddF => "aaddf",
            Op::NewArray => "newarray",
            Op::ArrayLength => "arraylength",
            Op::AAddS => "aadds",
        }
    }
}

/// Mnemonic of a C1 extension opcode, which this VM recognises but does not run.
pub fn extension_name(byte: u8) -> Option<&'static str> {
    match byte {
        0x16 => Some("addrof_static"),
        0x17 => Some("addrof_native"),
        0xB6 => Some("invokedynamic"),
        0xC0 => Some("checktag"),
        0xC1 => Some("hastag"),
        0xC2 => Some("addtag"),
        _ => None,
    }
}
