//! Opcode Table
//!
//! One byte of opcode followed by operands in a fixed per-opcode
//! pattern. Register operands are one byte, with 255 meaning "no
//! register". Jump offsets are 16-bit little-endian, signed, and
//! pre-scaled by 2: the decoder multiplies by 2 to obtain a byte offset
//! relative to the start of the jump instruction. Every instruction is
//! padded to an even total length so that jump targets always fall on
//! instruction boundaries.

/// Register operand value meaning "no register".
pub const NO_REG: u8 = 255;

/// Highest register index addressable by an instruction.
pub const MAX_REG: u8 = 254;

/// Operand kinds appearing in instruction encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// One register byte.
    Reg,
    /// One signed byte.
    Imm8,
    /// One unsigned byte.
    UImm8,
    /// 16-bit little-endian signed jump offset, pre-scaled by 2.
    Jump16,
    /// Variable-length unsigned immediate.
    UImm,
}

macro_rules! define_opcodes {
    ($( $name:ident = $val:literal, $mnemonic:literal, [ $($operand:ident),* ] ; )*) => {
        /// Instruction opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( $name = $val, )*
        }

        impl Opcode {
            /// Decode an opcode byte.
            pub fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $val => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Assembly mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Operand pattern for this opcode.
            pub fn operands(self) -> &'static [Operand] {
                match self {
                    $( Opcode::$name => &[ $( Operand::$operand ),* ], )*
                }
            }
        }
    };
}

define_opcodes! {
    // Value construction
    LoadVoid        = 0x10, "LOAD.VOID",          [Reg];
    LoadFalse       = 0x11, "LOAD.FALSE",         [Reg];
    LoadTrue        = 0x12, "LOAD.TRUE",          [Reg];
    LoadInt8        = 0x13, "LOAD.INT8",          [Reg, Imm8];
    LoadConst       = 0x14, "LOAD.CONST",         [Reg, UImm];
    NewArray8       = 0x15, "NEW.ARRAY8",         [Reg, UImm8];
    NewObj          = 0x16, "NEW.OBJ",            [Reg, Reg];

    // Generic data access
    Get             = 0x20, "GET",                [Reg, Reg, Reg];
    GetOpt          = 0x21, "GET.OPT",            [Reg, Reg, Reg];
    GetElem8        = 0x22, "GET.ELEM8",          [Reg, Reg, Imm8];
    GetElem8Opt     = 0x23, "GET.ELEM8.OPT",      [Reg, Reg, Imm8];
    GetRange        = 0x24, "GET.RANGE",          [Reg, Reg, Reg, Reg];
    GetProp8        = 0x25, "GET.PROP8",          [Reg, Reg, UImm];
    GetProp8Opt     = 0x26, "GET.PROP8.OPT",      [Reg, Reg, UImm];
    GetProto        = 0x27, "GET.PROTO",          [Reg, Reg];
    Set             = 0x28, "SET",                [Reg, Reg, Reg];
    SetElem8        = 0x29, "SET.ELEM8",          [Reg, Imm8, Reg];
    SetProp8        = 0x2A, "SET.PROP8",          [Reg, UImm, Reg];
    Del             = 0x2B, "DEL",                [Reg, Reg];
    Push            = 0x2C, "PUSH",               [Reg, Reg];
    PushEx          = 0x2D, "PUSH.EX",            [Reg, Reg];

    // Module-scoped access
    GetMod          = 0x30, "GET.MOD",            [Reg, UImm];
    GetModElem      = 0x31, "GET.MOD.ELEM",       [Reg, UImm, UImm];
    GetModGlobal    = 0x32, "GET.MOD.GLOBAL",     [Reg, UImm, Reg];
    GetModGlobalOpt = 0x33, "GET.MOD.GLOBAL.OPT", [Reg, UImm, Reg];
    GetGlobal       = 0x34, "GET.GLOBAL",         [Reg, UImm];

    // Type queries
    Type            = 0x38, "TYPE",               [Reg, Reg];
    HasDp           = 0x39, "HAS.DP",             [Reg, Reg, Reg];
    HasSh           = 0x3A, "HAS.SH",             [Reg, Reg, Reg];
    HasDpProp8      = 0x3B, "HAS.DP.PROP8",       [Reg, Reg, UImm];
    HasShProp8      = 0x3C, "HAS.SH.PROP8",       [Reg, Reg, UImm];

    // Arithmetic
    Add             = 0x40, "ADD",                [Reg, Reg, Reg];
    Sub             = 0x41, "SUB",                [Reg, Reg, Reg];
    Mul             = 0x42, "MUL",                [Reg, Reg, Reg];
    Div             = 0x43, "DIV",                [Reg, Reg, Reg];
    Mod             = 0x44, "MOD",                [Reg, Reg, Reg];

    // Bitwise
    And             = 0x48, "AND",                [Reg, Reg, Reg];
    Or              = 0x49, "OR",                 [Reg, Reg, Reg];
    Xor             = 0x4A, "XOR",                [Reg, Reg, Reg];
    Shl             = 0x4B, "SHL",                [Reg, Reg, Reg];
    Shr             = 0x4C, "SHR",                [Reg, Reg, Reg];
    Shru            = 0x4D, "SHRU",               [Reg, Reg, Reg];
    Not             = 0x4E, "NOT",                [Reg, Reg];

    // Comparison
    CmpEq           = 0x50, "CMP.EQ",             [Reg, Reg, Reg];
    CmpNe           = 0x51, "CMP.NE",             [Reg, Reg, Reg];
    CmpLe           = 0x52, "CMP.LE",             [Reg, Reg, Reg];
    CmpLt           = 0x53, "CMP.LT",             [Reg, Reg, Reg];

    // Control flow
    Jump            = 0x60, "JUMP",               [Jump16];
    JumpCond        = 0x61, "JUMP.COND",          [Jump16, Reg];
    JumpNotCond     = 0x62, "JUMP.NOT.COND",      [Jump16, Reg];
    Call            = 0x63, "CALL",               [Reg, Reg, Reg, Reg];
    TailCall        = 0x64, "TAIL.CALL",          [Reg, Reg, Reg];
    Return          = 0x65, "RETURN",             [Reg];
    Yield           = 0x66, "YIELD",              [Reg];
    Throw           = 0x67, "THROW",              [Reg];
    Catch           = 0x68, "CATCH",              [Reg, Jump16];
}

impl Opcode {
    /// True for instructions that may transfer control backwards.
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpCond | Opcode::JumpNotCond | Opcode::Catch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_opcodes() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
                assert!(!op.mnemonic().is_empty());
            }
        }
    }

    #[test]
    fn test_known_patterns() {
        assert_eq!(Opcode::LoadVoid.operands(), &[Operand::Reg]);
        assert_eq!(Opcode::Add.operands(), &[Operand::Reg, Operand::Reg, Operand::Reg]);
        assert_eq!(Opcode::Jump.operands(), &[Operand::Jump16]);
        assert_eq!(Opcode::Catch.operands(), &[Operand::Reg, Operand::Jump16]);
    }

    #[test]
    fn test_invalid_opcodes_rejected() {
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }
}
