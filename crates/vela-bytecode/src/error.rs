//! Error types for bytecode decoding and assembly.

use thiserror::Error;

/// Errors raised while decoding or validating a bytecode blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("instruction at offset {offset} is truncated")]
    Truncated { offset: usize },

    #[error("variable-length immediate truncated after {len} bytes")]
    TruncatedImm { len: usize },

    #[error("variable-length immediate does not fit in 64 bits (offset {offset})")]
    ImmOverflow { offset: usize },

    #[error("jump at offset {offset} targets {target}, which is not an instruction start")]
    BadJumpTarget { offset: usize, target: i64 },

    #[error("register operand {reg} at offset {offset} exceeds the frame limit")]
    BadRegister { reg: u8, offset: usize },
}

/// Errors raised by the assembler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("label {0} was never bound")]
    UnboundLabel(usize),

    #[error("jump distance {0} does not fit in a 16-bit pre-scaled offset")]
    JumpOutOfRange(i64),

    #[error("immediate operand {0} is out of range for its encoding")]
    ImmOutOfRange(i64),
}
