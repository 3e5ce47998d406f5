//! Buffers
//!
//! Resizable byte sequences with the same mutability discipline as
//! arrays. Reads produce integers in 0..=255; writes accept the same.

use parking_lot::RwLock;

use crate::error::{ExcKind, Raised};
use crate::object::ObjBody;
use crate::runtime::Context;
use crate::value::Value;

pub const MAX_BUFFER_SIZE: u32 = i32::MAX as u32;

#[derive(Debug)]
pub struct BufferObj {
    data: RwLock<Vec<u8>>,
}

impl BufferObj {
    pub fn new(size: u32) -> BufferObj {
        BufferObj { data: RwLock::new(vec![0; size as usize]) }
    }

    pub fn from_bytes(bytes: &[u8]) -> BufferObj {
        BufferObj { data: RwLock::new(bytes.to_vec()) }
    }

    pub fn len(&self) -> u32 {
        self.data.read().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload_size(&self) -> u32 {
        self.data.read().capacity() as u32
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

fn fix_index(index: i64, len: usize) -> Option<usize> {
    let fixed = if index < 0 { index + len as i64 } else { index };
    if fixed < 0 || fixed >= len as i64 {
        None
    } else {
        Some(fixed as usize)
    }
}

// === Context-level operations ===

pub fn new_buffer(ctx: &Context, size: i64) -> Result<Value, Raised> {
    if size < 0 || size > MAX_BUFFER_SIZE as i64 {
        return Err(ctx.raise_kind(ExcKind::InvalidSize, "invalid buffer size"));
    }
    ctx.alloc(ObjBody::Buffer(BufferObj::new(size as u32)))
}

pub fn new_buffer_from(ctx: &Context, bytes: &[u8]) -> Result<Value, Raised> {
    ctx.alloc(ObjBody::Buffer(BufferObj::from_bytes(bytes)))
}

fn with_buffer<T>(
    ctx: &Context,
    buffer: Value,
    f: impl FnOnce(&BufferObj) -> T,
) -> Result<T, Raised> {
    let obj = ctx.obj(buffer)?;
    match &obj.body {
        ObjBody::Buffer(b) => Ok(f(b)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not a buffer")),
    }
}

fn with_mutable_buffer<T>(
    ctx: &Context,
    buffer: Value,
    f: impl FnOnce(&BufferObj) -> T,
) -> Result<T, Raised> {
    let obj = ctx.obj(buffer)?;
    if obj.header.is_read_only() {
        return Err(ctx.raise_kind(ExcKind::ReadOnly, "buffer is read-only"));
    }
    match &obj.body {
        ObjBody::Buffer(b) => Ok(f(b)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not a buffer")),
    }
}

pub fn len(ctx: &Context, buffer: Value) -> Result<u32, Raised> {
    with_buffer(ctx, buffer, |b| b.len())
}

/// Read one byte as a small integer. Negative indices count from the
/// end.
pub fn read(ctx: &Context, buffer: Value, index: i64) -> Result<Value, Raised> {
    with_buffer(ctx, buffer, |b| {
        let guard = b.data.read();
        fix_index(index, guard.len()).map(|i| Value::from_small_int(guard[i] as i64))
    })?
    .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "buffer index out of range"))
}

/// Write one byte; values outside 0..=255 raise `InvalidValue`.
pub fn write(ctx: &Context, buffer: Value, index: i64, value: i64) -> Result<(), Raised> {
    if !(0..=255).contains(&value) {
        return Err(ctx.raise_kind(ExcKind::InvalidValue, "buffer element out of byte range"));
    }
    with_mutable_buffer(ctx, buffer, |b| {
        let mut guard = b.data.write();
        let len = guard.len();
        match fix_index(index, len) {
            Some(i) => {
                guard[i] = value as u8;
                true
            }
            None => false,
        }
    })?
    .then_some(())
    .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "buffer index out of range"))
}

/// Grow (zero-filled) or shrink.
pub fn resize(ctx: &Context, buffer: Value, new_size: i64) -> Result<(), Raised> {
    if new_size < 0 || new_size > MAX_BUFFER_SIZE as i64 {
        return Err(ctx.raise_kind(ExcKind::InvalidSize, "invalid buffer size"));
    }
    let grown = with_mutable_buffer(ctx, buffer, |b| {
        let mut guard = b.data.write();
        let old_cap = guard.capacity();
        guard.resize(new_size as usize, 0);
        guard.capacity().saturating_sub(old_cap)
    })?;
    super::array::account_growth(ctx, buffer, grown)
}

/// Append one byte; returns its index.
pub fn push(ctx: &Context, buffer: Value, value: i64) -> Result<u32, Raised> {
    if !(0..=255).contains(&value) {
        return Err(ctx.raise_kind(ExcKind::InvalidValue, "buffer element out of byte range"));
    }
    let (index, grown) = with_mutable_buffer(ctx, buffer, |b| {
        let mut guard = b.data.write();
        let old_cap = guard.capacity();
        guard.push(value as u8);
        (guard.len() as u32 - 1, guard.capacity().saturating_sub(old_cap))
    })?;
    super::array::account_growth(ctx, buffer, grown)?;
    Ok(index)
}

/// Fill `[begin, end)`, clamping the range.
pub fn fill(ctx: &Context, buffer: Value, begin: i64, end: i64, value: i64) -> Result<(), Raised> {
    if !(0..=255).contains(&value) {
        return Err(ctx.raise_kind(ExcKind::InvalidValue, "buffer element out of byte range"));
    }
    with_mutable_buffer(ctx, buffer, |b| {
        let mut guard = b.data.write();
        let len = guard.len() as i64;
        let (from, to) = crate::object::string::clamp_range(begin, end, len);
        for i in from..to {
            guard[i as usize] = value as u8;
        }
    })
}

/// Copy `[begin, end)` into a new buffer, clamping.
pub fn slice(ctx: &Context, buffer: Value, begin: i64, end: i64) -> Result<Value, Raised> {
    let bytes = with_buffer(ctx, buffer, |b| {
        let guard = b.data.read();
        let (from, to) = crate::object::string::clamp_range(begin, end, guard.len() as i64);
        guard[from as usize..to as usize].to_vec()
    })?;
    new_buffer_from(ctx, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_index_from_end() {
        assert_eq!(fix_index(-1, 3), Some(2));
        assert_eq!(fix_index(-3, 3), Some(0));
        assert_eq!(fix_index(-4, 3), None);
        assert_eq!(fix_index(3, 3), None);
    }

    #[test]
    fn test_new_zero_filled() {
        let b = BufferObj::new(4);
        assert_eq!(b.to_vec(), vec![0, 0, 0, 0]);
    }
}
