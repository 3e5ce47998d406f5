//! Bytecode Assembler
//!
//! A small label-based assembler. The compiler front end is an external
//! collaborator; this builder exists for embedders, for builtin module
//! bootstrap code, and for tests that hand-assemble programs.
//!
//! Jump operands reference labels; `finish` patches every jump with the
//! pre-scaled 16-bit offset once all labels are bound. Instructions are
//! padded to even lengths as they are emitted, so labels always bind to
//! even offsets.

use crate::error::AsmError;
use crate::imm::store_uimm;
use crate::opcode::{Opcode, NO_REG};

/// A forward-referencable position in the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Patch {
    /// Offset of the instruction that owns the jump operand.
    instr_start: usize,
    /// Offset of the 16-bit operand within the code buffer.
    operand_at: usize,
    label: Label,
}

/// Incremental bytecode builder.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new, unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    /// Current position, always even.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Finish assembly, patching all jumps.
    pub fn finish(mut self) -> Result<Vec<u8>, AsmError> {
        for patch in &self.patches {
            let target = self.labels[patch.label.0].ok_or(AsmError::UnboundLabel(patch.label.0))?;
            let delta = target as i64 - patch.instr_start as i64;
            debug_assert_eq!(delta % 2, 0);
            let scaled = delta / 2;
            if scaled < i16::MIN as i64 || scaled > i16::MAX as i64 {
                return Err(AsmError::JumpOutOfRange(delta));
            }
            let bytes = (scaled as i16).to_le_bytes();
            self.code[patch.operand_at] = bytes[0];
            self.code[patch.operand_at + 1] = bytes[1];
        }
        Ok(self.code)
    }

    // === Emission helpers ===

    fn begin(&mut self, op: Opcode) -> usize {
        let start = self.code.len();
        debug_assert_eq!(start % 2, 0);
        self.code.push(op as u8);
        start
    }

    fn end(&mut self, start: usize) {
        if (self.code.len() - start) % 2 != 0 {
            self.code.push(0);
        }
    }

    fn put_jump(&mut self, start: usize, label: Label) {
        self.patches.push(Patch { instr_start: start, operand_at: self.code.len(), label });
        self.code.extend_from_slice(&[0, 0]);
    }

    fn emit_r(&mut self, op: Opcode, r: u8) {
        let s = self.begin(op);
        self.code.push(r);
        self.end(s);
    }

    fn emit_rr(&mut self, op: Opcode, a: u8, b: u8) {
        let s = self.begin(op);
        self.code.extend_from_slice(&[a, b]);
        self.end(s);
    }

    fn emit_rrr(&mut self, op: Opcode, a: u8, b: u8, c: u8) {
        let s = self.begin(op);
        self.code.extend_from_slice(&[a, b, c]);
        self.end(s);
    }

    fn emit_r_uimm(&mut self, op: Opcode, r: u8, imm: u64) {
        let s = self.begin(op);
        self.code.push(r);
        store_uimm(&mut self.code, imm);
        self.end(s);
    }

    // === Value construction ===

    pub fn load_void(&mut self, dst: u8) {
        self.emit_r(Opcode::LoadVoid, dst);
    }

    pub fn load_false(&mut self, dst: u8) {
        self.emit_r(Opcode::LoadFalse, dst);
    }

    pub fn load_true(&mut self, dst: u8) {
        self.emit_r(Opcode::LoadTrue, dst);
    }

    pub fn load_int8(&mut self, dst: u8, value: i8) {
        let s = self.begin(Opcode::LoadInt8);
        self.code.push(dst);
        self.code.push(value as u8);
        self.end(s);
    }

    pub fn load_const(&mut self, dst: u8, index: u32) {
        self.emit_r_uimm(Opcode::LoadConst, dst, index as u64);
    }

    pub fn new_array8(&mut self, dst: u8, size: u8) {
        let s = self.begin(Opcode::NewArray8);
        self.code.extend_from_slice(&[dst, size]);
        self.end(s);
    }

    pub fn new_obj(&mut self, dst: u8, proto: u8) {
        self.emit_rr(Opcode::NewObj, dst, proto);
    }

    pub fn new_obj_default(&mut self, dst: u8) {
        self.new_obj(dst, NO_REG);
    }

    // === Data access ===

    pub fn get(&mut self, dst: u8, src: u8, key: u8) {
        self.emit_rrr(Opcode::Get, dst, src, key);
    }

    pub fn get_opt(&mut self, dst: u8, src: u8, key: u8) {
        self.emit_rrr(Opcode::GetOpt, dst, src, key);
    }

    pub fn get_elem8(&mut self, dst: u8, src: u8, index: i8) {
        let s = self.begin(Opcode::GetElem8);
        self.code.extend_from_slice(&[dst, src, index as u8]);
        self.end(s);
    }

    pub fn get_elem8_opt(&mut self, dst: u8, src: u8, index: i8) {
        let s = self.begin(Opcode::GetElem8Opt);
        self.code.extend_from_slice(&[dst, src, index as u8]);
        self.end(s);
    }

    pub fn get_range(&mut self, dst: u8, src: u8, begin: u8, end: u8) {
        let s = self.begin(Opcode::GetRange);
        self.code.extend_from_slice(&[dst, src, begin, end]);
        self.end(s);
    }

    pub fn get_prop8(&mut self, dst: u8, src: u8, name_const: u32) {
        let s = self.begin(Opcode::GetProp8);
        self.code.extend_from_slice(&[dst, src]);
        store_uimm(&mut self.code, name_const as u64);
        self.end(s);
    }

    pub fn get_prop8_opt(&mut self, dst: u8, src: u8, name_const: u32) {
        let s = self.begin(Opcode::GetProp8Opt);
        self.code.extend_from_slice(&[dst, src]);
        store_uimm(&mut self.code, name_const as u64);
        self.end(s);
    }

    pub fn get_proto(&mut self, dst: u8, src: u8) {
        self.emit_rr(Opcode::GetProto, dst, src);
    }

    pub fn set(&mut self, obj: u8, key: u8, value: u8) {
        self.emit_rrr(Opcode::Set, obj, key, value);
    }

    pub fn set_elem8(&mut self, obj: u8, index: i8, value: u8) {
        let s = self.begin(Opcode::SetElem8);
        self.code.extend_from_slice(&[obj, index as u8, value]);
        self.end(s);
    }

    pub fn set_prop8(&mut self, obj: u8, name_const: u32, value: u8) {
        let s = self.begin(Opcode::SetProp8);
        self.code.push(obj);
        store_uimm(&mut self.code, name_const as u64);
        self.code.push(value);
        self.end(s);
    }

    pub fn del(&mut self, obj: u8, key: u8) {
        self.emit_rr(Opcode::Del, obj, key);
    }

    pub fn push(&mut self, array: u8, value: u8) {
        self.emit_rr(Opcode::Push, array, value);
    }

    pub fn push_ex(&mut self, array: u8, value: u8) {
        self.emit_rr(Opcode::PushEx, array, value);
    }

    // === Module-scoped access ===

    pub fn get_mod(&mut self, dst: u8, module: u32) {
        self.emit_r_uimm(Opcode::GetMod, dst, module as u64);
    }

    pub fn get_mod_elem(&mut self, dst: u8, module: u32, slot: u32) {
        let s = self.begin(Opcode::GetModElem);
        self.code.push(dst);
        store_uimm(&mut self.code, module as u64);
        store_uimm(&mut self.code, slot as u64);
        self.end(s);
    }

    pub fn get_mod_global(&mut self, dst: u8, module: u32, key: u8) {
        let s = self.begin(Opcode::GetModGlobal);
        self.code.push(dst);
        store_uimm(&mut self.code, module as u64);
        self.code.push(key);
        self.end(s);
    }

    pub fn get_mod_global_opt(&mut self, dst: u8, module: u32, key: u8) {
        let s = self.begin(Opcode::GetModGlobalOpt);
        self.code.push(dst);
        store_uimm(&mut self.code, module as u64);
        self.code.push(key);
        self.end(s);
    }

    pub fn get_global(&mut self, dst: u8, slot: u32) {
        self.emit_r_uimm(Opcode::GetGlobal, dst, slot as u64);
    }

    // === Type queries ===

    pub fn type_of(&mut self, dst: u8, src: u8) {
        self.emit_rr(Opcode::Type, dst, src);
    }

    pub fn has_dp(&mut self, dst: u8, src: u8, key: u8) {
        self.emit_rrr(Opcode::HasDp, dst, src, key);
    }

    pub fn has_sh(&mut self, dst: u8, src: u8, key: u8) {
        self.emit_rrr(Opcode::HasSh, dst, src, key);
    }

    pub fn has_dp_prop8(&mut self, dst: u8, src: u8, name_const: u32) {
        let s = self.begin(Opcode::HasDpProp8);
        self.code.extend_from_slice(&[dst, src]);
        store_uimm(&mut self.code, name_const as u64);
        self.end(s);
    }

    pub fn has_sh_prop8(&mut self, dst: u8, src: u8, name_const: u32) {
        let s = self.begin(Opcode::HasShProp8);
        self.code.extend_from_slice(&[dst, src]);
        store_uimm(&mut self.code, name_const as u64);
        self.end(s);
    }

    // === Arithmetic, bitwise, comparison ===

    pub fn add(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Add, dst, a, b);
    }

    pub fn sub(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Sub, dst, a, b);
    }

    pub fn mul(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Mul, dst, a, b);
    }

    pub fn div(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Div, dst, a, b);
    }

    pub fn modulo(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Mod, dst, a, b);
    }

    pub fn and(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::And, dst, a, b);
    }

    pub fn or(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Or, dst, a, b);
    }

    pub fn xor(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Xor, dst, a, b);
    }

    pub fn shl(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Shl, dst, a, b);
    }

    pub fn shr(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Shr, dst, a, b);
    }

    pub fn shru(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::Shru, dst, a, b);
    }

    pub fn not(&mut self, dst: u8, src: u8) {
        self.emit_rr(Opcode::Not, dst, src);
    }

    pub fn cmp_eq(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::CmpEq, dst, a, b);
    }

    pub fn cmp_ne(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::CmpNe, dst, a, b);
    }

    pub fn cmp_le(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::CmpLe, dst, a, b);
    }

    pub fn cmp_lt(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_rrr(Opcode::CmpLt, dst, a, b);
    }

    // === Control flow ===

    pub fn jump(&mut self, target: Label) {
        let s = self.begin(Opcode::Jump);
        self.put_jump(s, target);
        self.end(s);
    }

    pub fn jump_cond(&mut self, target: Label, src: u8) {
        let s = self.begin(Opcode::JumpCond);
        self.put_jump(s, target);
        self.code.push(src);
        self.end(s);
    }

    pub fn jump_not_cond(&mut self, target: Label, src: u8) {
        let s = self.begin(Opcode::JumpNotCond);
        self.put_jump(s, target);
        self.code.push(src);
        self.end(s);
    }

    pub fn call(&mut self, dst: u8, func: u8, this: u8, args: u8) {
        let s = self.begin(Opcode::Call);
        self.code.extend_from_slice(&[dst, func, this, args]);
        self.end(s);
    }

    pub fn tail_call(&mut self, func: u8, this: u8, args: u8) {
        self.emit_rrr(Opcode::TailCall, func, this, args);
    }

    pub fn ret(&mut self, src: u8) {
        self.emit_r(Opcode::Return, src);
    }

    pub fn yield_(&mut self, reg: u8) {
        self.emit_r(Opcode::Yield, reg);
    }

    pub fn throw(&mut self, src: u8) {
        self.emit_r(Opcode::Throw, src);
    }

    pub fn catch(&mut self, dst: u8, handler: Label) {
        let s = self.begin(Opcode::Catch);
        self.code.push(dst);
        self.put_jump(s, handler);
        self.end(s);
    }

    /// Disarm the current frame's exception handler.
    pub fn cancel_catch(&mut self) {
        let s = self.begin(Opcode::Catch);
        self.code.push(NO_REG);
        self.code.extend_from_slice(&[0, 0]);
        self.end(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, validate};

    #[test]
    fn test_emitted_instructions_are_even() {
        let mut asm = Assembler::new();
        asm.load_int8(0, 7);
        asm.new_array8(1, 3);
        asm.get_range(2, 1, 0, NO_REG);
        asm.call(3, 2, NO_REG, 1);
        asm.ret(3);
        let code = asm.finish().unwrap();
        let starts = validate(&code).unwrap();
        assert!(starts.iter().all(|s| s % 2 == 0));
    }

    #[test]
    fn test_backward_jump_patching() {
        let mut asm = Assembler::new();
        let top = asm.label();
        asm.bind(top);
        asm.load_true(0);
        asm.jump(top);
        let code = asm.finish().unwrap();

        let first = decode(&code, 0).unwrap();
        let jump = decode(&code, first.len).unwrap();
        assert_eq!(jump.jump_target(first.len), 0);
        validate(&code).unwrap();
    }

    #[test]
    fn test_forward_jump_patching() {
        let mut asm = Assembler::new();
        let end = asm.label();
        asm.jump_cond(end, 2);
        asm.load_void(0);
        asm.bind(end);
        asm.ret(0);
        let code = asm.finish().unwrap();
        validate(&code).unwrap();

        let jump = decode(&code, 0).unwrap();
        let target = jump.jump_target(0) as usize;
        let landed = decode(&code, target).unwrap();
        assert_eq!(landed.op, Opcode::Return);
    }

    #[test]
    fn test_unbound_label_fails() {
        let mut asm = Assembler::new();
        let nowhere = asm.label();
        asm.jump(nowhere);
        assert!(matches!(asm.finish(), Err(AsmError::UnboundLabel(_))));
    }
}
