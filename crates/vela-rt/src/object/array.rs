//! Arrays
//!
//! Resizable ordered sequences of values. Indexed reads, writes and
//! compare-and-swap contend only on the element cell; operations that
//! change the size or the storage take the per-array lock.

use parking_lot::RwLock;

use crate::error::{ExcKind, Raised};
use crate::object::ObjBody;
use crate::runtime::Context;
use crate::value::{Value, ValueCell};

/// Sizes past this raise `InvalidSize`.
pub const MAX_ARRAY_SIZE: u32 = i32::MAX as u32;

#[derive(Debug)]
struct ArrayStorage {
    /// Element cells; length is the capacity. Cells at `size..` hold
    /// `void`.
    elems: Vec<ValueCell>,
    size: u32,
}

#[derive(Debug)]
pub struct ArrayObj {
    storage: RwLock<ArrayStorage>,
}

impl ArrayObj {
    /// Build with `size` elements, all set to `fill` (the caller
    /// passes the void singleton).
    pub fn new(size: u32, fill: Value) -> ArrayObj {
        let elems = (0..size).map(|_| ValueCell::new(fill)).collect();
        ArrayObj {
            storage: RwLock::new(ArrayStorage { elems, size }),
        }
    }

    pub fn from_values(values: &[Value]) -> ArrayObj {
        let elems: Vec<ValueCell> = values.iter().map(|&v| ValueCell::new(v)).collect();
        let size = elems.len() as u32;
        ArrayObj {
            storage: RwLock::new(ArrayStorage { elems, size }),
        }
    }

    pub fn len(&self) -> u32 {
        self.storage.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload_size(&self) -> u32 {
        self.storage.read().elems.len() as u32 * 8
    }

    /// Snapshot the live elements.
    pub fn to_vec(&self) -> Vec<Value> {
        let guard = self.storage.read();
        (0..guard.size as usize).map(|i| guard.elems[i].get()).collect()
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        let guard = self.storage.read();
        for cell in &guard.elems[..guard.size as usize] {
            visit(cell.get());
        }
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        let guard = self.storage.read();
        for cell in &guard.elems[..guard.size as usize] {
            cell.set(remap(cell.get()));
        }
    }
}

/// Normalize a possibly-negative index against `len`.
fn fix_index(index: i64, len: u32) -> Option<u32> {
    let fixed = if index < 0 { index + len as i64 } else { index };
    if fixed < 0 || fixed >= len as i64 {
        None
    } else {
        Some(fixed as u32)
    }
}

// === Context-level operations ===

/// Charge storage growth to the off-heap counter and remember it on
/// the object's header so collection can release it when the object
/// is reclaimed. Also used by buffers.
pub(crate) fn account_growth(ctx: &Context, value: Value, grown: usize) -> Result<(), Raised> {
    if grown == 0 {
        return Ok(());
    }
    ctx.adjust_malloc(grown as isize)?;
    ctx.obj(value)?.header.add_malloc_bytes(grown as u32);
    Ok(())
}

/// Allocate an array of `size` elements initialized to `void`.
pub fn new_array(ctx: &Context, size: i64) -> Result<Value, Raised> {
    if size < 0 || size > MAX_ARRAY_SIZE as i64 {
        return Err(ctx.raise_kind(ExcKind::InvalidSize, "invalid array size"));
    }
    ctx.alloc(ObjBody::Array(ArrayObj::new(size as u32, ctx.void_val())))
}

/// Allocate an array from a value slice.
pub fn new_array_from(ctx: &Context, values: &[Value]) -> Result<Value, Raised> {
    ctx.alloc(ObjBody::Array(ArrayObj::from_values(values)))
}

fn with_array<T>(
    ctx: &Context,
    array: Value,
    f: impl FnOnce(&ArrayObj) -> T,
) -> Result<T, Raised> {
    let obj = ctx.obj(array)?;
    match &obj.body {
        ObjBody::Array(a) => Ok(f(a)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not an array")),
    }
}

fn with_mutable_array<T>(
    ctx: &Context,
    array: Value,
    f: impl FnOnce(&ArrayObj) -> T,
) -> Result<T, Raised> {
    let obj = ctx.obj(array)?;
    if obj.header.is_read_only() {
        return Err(ctx.raise_kind(ExcKind::ReadOnly, "array is read-only"));
    }
    match &obj.body {
        ObjBody::Array(a) => Ok(f(a)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not an array")),
    }
}

pub fn len(ctx: &Context, array: Value) -> Result<u32, Raised> {
    with_array(ctx, array, |a| a.len())
}

/// Read an element. Negative indices count from the end.
pub fn read(ctx: &Context, array: Value, index: i64) -> Result<Value, Raised> {
    with_array(ctx, array, |a| {
        let guard = a.storage.read();
        fix_index(index, guard.size).map(|i| guard.elems[i as usize].get())
    })?
    .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "array index out of range"))
}

/// Write an element. Negative indices count from the end.
pub fn write(ctx: &Context, array: Value, index: i64, value: Value) -> Result<(), Raised> {
    with_mutable_array(ctx, array, |a| {
        let guard = a.storage.read();
        match fix_index(index, guard.size) {
            Some(i) => {
                guard.elems[i as usize].set(value);
                true
            }
            None => false,
        }
    })?
    .then_some(())
    .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "array index out of range"))
}

/// Atomic compare-and-swap on one slot. Returns the previous value.
pub fn cas(
    ctx: &Context,
    array: Value,
    index: i64,
    expected: Value,
    new: Value,
) -> Result<Value, Raised> {
    with_mutable_array(ctx, array, |a| {
        let guard = a.storage.read();
        fix_index(index, guard.size).map(|i| guard.elems[i as usize].compare_and_swap(expected, new))
    })?
    .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "array index out of range"))
}

/// Grow or shrink. Growth fills with `void`.
pub fn resize(ctx: &Context, array: Value, new_size: i64) -> Result<(), Raised> {
    if new_size < 0 || new_size > MAX_ARRAY_SIZE as i64 {
        return Err(ctx.raise_kind(ExcKind::InvalidSize, "invalid array size"));
    }
    let new_size = new_size as u32;
    let void = ctx.void_val();
    let grown = with_mutable_array(ctx, array, |a| {
        let mut guard = a.storage.write();
        let old_cap = guard.elems.len();
        while guard.elems.len() < new_size as usize {
            guard.elems.push(ValueCell::new(void));
        }
        for i in new_size as usize..guard.size as usize {
            guard.elems[i].set(void);
        }
        for i in guard.size as usize..new_size as usize {
            guard.elems[i].set(void);
        }
        guard.size = new_size;
        (guard.elems.len() - old_cap) * 8
    })?;
    account_growth(ctx, array, grown)
}

/// Reserve capacity without changing the size.
pub fn reserve(ctx: &Context, array: Value, capacity: i64) -> Result<(), Raised> {
    if capacity < 0 || capacity > MAX_ARRAY_SIZE as i64 {
        return Err(ctx.raise_kind(ExcKind::InvalidSize, "invalid array capacity"));
    }
    let void = ctx.void_val();
    let grown = with_mutable_array(ctx, array, |a| {
        let mut guard = a.storage.write();
        let old_cap = guard.elems.len();
        while guard.elems.len() < capacity as usize {
            guard.elems.push(ValueCell::new(void));
        }
        (guard.elems.len() - old_cap) * 8
    })?;
    account_growth(ctx, array, grown)
}

/// Append; returns the new element's index.
pub fn push(ctx: &Context, array: Value, value: Value) -> Result<u32, Raised> {
    let (index, grown) = with_mutable_array(ctx, array, |a| {
        let mut guard = a.storage.write();
        let old_cap = guard.elems.len();
        let index = guard.size;
        if (index as usize) < guard.elems.len() {
            guard.elems[index as usize].set(value);
        } else {
            guard.elems.push(ValueCell::new(value));
        }
        guard.size = index + 1;
        (index, (guard.elems.len() - old_cap) * 8)
    })?;
    account_growth(ctx, array, grown)?;
    Ok(index)
}

/// Remove and return the last element; `OutOfRange` when empty.
pub fn pop(ctx: &Context, array: Value) -> Result<Value, Raised> {
    let void = ctx.void_val();
    with_mutable_array(ctx, array, |a| {
        let mut guard = a.storage.write();
        if guard.size == 0 {
            return None;
        }
        guard.size -= 1;
        let index = guard.size as usize;
        let value = guard.elems[index].get();
        guard.elems[index].set(void);
        Some(value)
    })?
    .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "pop from empty array"))
}

/// Fill `[begin, end)` with `value`, clamping the range.
pub fn fill(ctx: &Context, array: Value, begin: i64, end: i64, value: Value) -> Result<(), Raised> {
    with_mutable_array(ctx, array, |a| {
        let guard = a.storage.read();
        let (from, to) = crate::object::string::clamp_range(begin, end, guard.size as i64);
        for i in from..to {
            guard.elems[i as usize].set(value);
        }
    })
}

/// Copy `[begin, end)` into a new independent array, clamping.
pub fn slice(ctx: &Context, array: Value, begin: i64, end: i64) -> Result<Value, Raised> {
    let values = with_array(ctx, array, |a| {
        let guard = a.storage.read();
        let (from, to) = crate::object::string::clamp_range(begin, end, guard.size as i64);
        (from..to).map(|i| guard.elems[i as usize].get()).collect::<Vec<_>>()
    })?;
    new_array_from(ctx, &values)
}

/// Replace `dest[dest_begin, dest_end)` with `src[src_begin, src_end)`.
///
/// Handles `dest == src` by snapshotting the source range before
/// touching the destination.
pub fn insert(
    ctx: &Context,
    dest: Value,
    dest_begin: i64,
    dest_end: i64,
    src: Value,
    src_begin: i64,
    src_end: i64,
) -> Result<(), Raised> {
    // Snapshot makes self-splice safe.
    let incoming = with_array(ctx, src, |a| {
        let guard = a.storage.read();
        let (from, to) = crate::object::string::clamp_range(src_begin, src_end, guard.size as i64);
        (from..to).map(|i| guard.elems[i as usize].get()).collect::<Vec<_>>()
    })?;

    let void = ctx.void_val();
    let grown = with_mutable_array(ctx, dest, |a| {
        let mut guard = a.storage.write();
        let (from, to) = crate::object::string::clamp_range(dest_begin, dest_end, guard.size as i64);
        let old_cap = guard.elems.len();

        let mut result: Vec<Value> = Vec::with_capacity(
            guard.size as usize - (to - from) as usize + incoming.len(),
        );
        result.extend((0..from).map(|i| guard.elems[i as usize].get()));
        result.extend(incoming.iter().copied());
        result.extend((to..guard.size).map(|i| guard.elems[i as usize].get()));

        while guard.elems.len() < result.len() {
            guard.elems.push(ValueCell::new(void));
        }
        for (i, v) in result.iter().enumerate() {
            guard.elems[i].set(*v);
        }
        for i in result.len()..guard.size as usize {
            guard.elems[i].set(void);
        }
        guard.size = result.len() as u32;
        (guard.elems.len() - old_cap) * 8
    })?;
    account_growth(ctx, dest, grown)
}

/// Freeze the array; all further mutation raises `ReadOnly`.
pub fn freeze(ctx: &Context, array: Value) -> Result<(), Raised> {
    let obj = ctx.obj(array)?;
    match &obj.body {
        ObjBody::Array(_) | ObjBody::Buffer(_) | ObjBody::Object(_) => {
            obj.header.set_read_only();
            Ok(())
        }
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value cannot be frozen")),
    }
}
