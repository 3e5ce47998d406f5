//! Disassembler
//!
//! Renders one instruction per line. Used by the runtime when a module
//! is loaded on an instance with the DISASM flag, and by tests.

use crate::decode::decode;
use crate::error::BytecodeError;
use crate::opcode::{Operand, NO_REG};
use std::fmt::Write;

/// Disassemble a whole blob.
pub fn disassemble(code: &[u8]) -> Result<String, BytecodeError> {
    let mut out = String::new();
    let mut offset = 0;

    while offset < code.len() {
        let instr = decode(code, offset)?;
        write!(out, "{:05x}: {:<18}", offset, instr.op.mnemonic()).unwrap();

        let mut regs = instr.regs.iter();
        let mut imms = instr.imms.iter();
        let mut first = true;
        for operand in instr.op.operands() {
            if !first {
                out.push_str(", ");
            } else {
                first = false;
            }
            match operand {
                Operand::Reg => {
                    let reg = *regs.next().unwrap();
                    if reg == NO_REG {
                        out.push('-');
                    } else {
                        write!(out, "r{}", reg).unwrap();
                    }
                }
                Operand::Imm8 | Operand::UImm8 | Operand::UImm => {
                    write!(out, "{}", imms.next().unwrap()).unwrap();
                }
                Operand::Jump16 => {
                    let delta = *imms.next().unwrap();
                    write!(out, "{:+} ({:05x})", delta, offset as i64 + delta).unwrap();
                }
            }
        }
        out.push('\n');
        offset += instr.len;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Assembler;

    #[test]
    fn test_disassemble_basic_block() {
        let mut asm = Assembler::new();
        let done = asm.label();
        asm.load_int8(0, 5);
        asm.load_int8(1, 3);
        asm.add(2, 0, 1);
        asm.jump_cond(done, 2);
        asm.load_void(2);
        asm.bind(done);
        asm.ret(2);
        let code = asm.finish().unwrap();

        let text = disassemble(&code).unwrap();
        assert!(text.contains("LOAD.INT8"));
        assert!(text.contains("ADD"));
        assert!(text.contains("JUMP.COND"));
        assert!(text.contains("RETURN"));
        assert_eq!(text.lines().count(), 6);
    }

    #[test]
    fn test_disassemble_rejects_garbage() {
        assert!(disassemble(&[0xEE, 0x00]).is_err());
    }
}
