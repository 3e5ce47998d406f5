//! Operator Semantics
//!
//! Value-level behavior of the instruction set: numeric extraction and
//! promotion, wrapping integer arithmetic, the comparison rules,
//! truthiness, and the generic GET/SET/DEL dispatch over receiver and
//! key types.

use std::cmp::Ordering;

use crate::error::{ExcKind, Raised};
use crate::object::{ObjBody, TypeTag};
use crate::runtime::Context;
use crate::value::{small_int_fits, Numeric, Value};

/// Nesting bound for recursive array comparison.
const MAX_COMPARE_DEPTH: u32 = 100;

/// Extract a numeric operand: small integer, boxed integer or float.
/// Strings are rejected; explicit conversion goes through
/// [`Numeric::parse`].
pub fn to_numeric(ctx: &Context, value: Value) -> Result<Numeric, Raised> {
    if value.is_small_int() {
        return Ok(Numeric::Integer(value.as_small_int()));
    }
    match ctx.resolve(value).as_ref().map(|obj| &obj.body) {
        Some(ObjBody::Integer(i)) => Ok(Numeric::Integer(*i)),
        Some(ObjBody::Float(f)) => Ok(Numeric::Float(*f)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "operand is not numeric")),
    }
}

fn is_numeric(ctx: &Context, value: Value) -> bool {
    value.is_small_int()
        || matches!(
            ctx.resolve(value).as_ref().map(|obj| &obj.body),
            Some(ObjBody::Integer(_)) | Some(ObjBody::Float(_))
        )
}

/// Box or tag an integer result.
pub fn make_int(ctx: &Context, value: i64) -> Result<Value, Raised> {
    if small_int_fits(value) {
        Ok(Value::from_small_int(value))
    } else {
        ctx.alloc(ObjBody::Integer(value))
    }
}

pub fn make_float(ctx: &Context, value: f64) -> Result<Value, Raised> {
    ctx.alloc(ObjBody::Float(value))
}

/// Arithmetic instruction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Integer + integer stays integer (wrapping); any float promotes the
/// result to float. Division and modulo by zero raise.
pub fn arith(ctx: &Context, op: ArithOp, a: Value, b: Value) -> Result<Value, Raised> {
    let lhs = to_numeric(ctx, a)?;
    let rhs = to_numeric(ctx, b)?;

    if let (Numeric::Integer(x), Numeric::Integer(y)) = (lhs, rhs) {
        let result = match op {
            ArithOp::Add => x.wrapping_add(y),
            ArithOp::Sub => x.wrapping_sub(y),
            ArithOp::Mul => x.wrapping_mul(y),
            ArithOp::Div => {
                if y == 0 {
                    return Err(ctx.raise_kind(ExcKind::DivisionByZero, "integer division by zero"));
                }
                x.wrapping_div(y)
            }
            ArithOp::Mod => {
                if y == 0 {
                    return Err(ctx.raise_kind(ExcKind::DivisionByZero, "integer modulo by zero"));
                }
                x.wrapping_rem(y)
            }
        };
        return make_int(ctx, result);
    }

    let x = lhs.as_f64();
    let y = rhs.as_f64();
    let result = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => {
            if y == 0.0 {
                return Err(ctx.raise_kind(ExcKind::DivisionByZero, "float division by zero"));
            }
            x / y
        }
        ArithOp::Mod => {
            if y == 0.0 {
                return Err(ctx.raise_kind(ExcKind::DivisionByZero, "float modulo by zero"));
            }
            x % y
        }
    };
    make_float(ctx, result)
}

/// Bitwise instruction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Shru,
}

/// Bitwise operands are numeric; floats are floored to integers.
pub fn bitwise(ctx: &Context, op: BitOp, a: Value, b: Value) -> Result<Value, Raised> {
    let x = to_int64(ctx, a)?;
    let y = to_int64(ctx, b)?;

    let result = match op {
        BitOp::And => x & y,
        BitOp::Or => x | y,
        BitOp::Xor => x ^ y,
        BitOp::Shl => shift_left(x, y),
        BitOp::Shr => shift_right_signed(x, y),
        BitOp::Shru => shift_right_unsigned(x, y),
    };
    make_int(ctx, result)
}

pub fn bit_not(ctx: &Context, a: Value) -> Result<Value, Raised> {
    let x = to_int64(ctx, a)?;
    make_int(ctx, !x)
}

fn to_int64(ctx: &Context, value: Value) -> Result<i64, Raised> {
    match to_numeric(ctx, value)? {
        Numeric::Integer(i) => Ok(i),
        Numeric::Float(f) => Ok(f.floor() as i64),
    }
}

/// Negative counts shift the other way; counts of 64 or more drain
/// the value.
fn shift_left(value: i64, count: i64) -> i64 {
    if count < 0 {
        return shift_right_signed(value, -count);
    }
    if count >= 64 {
        0
    } else {
        ((value as u64) << count) as i64
    }
}

fn shift_right_signed(value: i64, count: i64) -> i64 {
    if count < 0 {
        return shift_left(value, -count);
    }
    if count >= 64 {
        if value < 0 {
            -1
        } else {
            0
        }
    } else {
        value >> count
    }
}

fn shift_right_unsigned(value: i64, count: i64) -> i64 {
    if count < 0 {
        return shift_left(value, -count);
    }
    if count >= 64 {
        0
    } else {
        ((value as u64) >> count) as i64
    }
}

/// Truthiness: `void`, `false` and numeric zero of any tag are falsy;
/// everything else, including NaN, the empty string and the empty
/// array, is truthy.
pub fn is_truthy(ctx: &Context, value: Value) -> bool {
    if value.is_small_int() {
        return value.as_small_int() != 0;
    }
    match ctx.resolve(value).as_ref().map(|obj| &obj.body) {
        Some(ObjBody::Void) => false,
        Some(ObjBody::Boolean(b)) => *b,
        Some(ObjBody::Integer(i)) => *i != 0,
        Some(ObjBody::Float(f)) => *f != 0.0,
        _ => true,
    }
}

/// Equality: numerics by mathematical value (`NaN != NaN`), strings
/// structurally, other heap types by identity, unlike kinds unequal.
pub fn equal(ctx: &Context, a: Value, b: Value) -> Result<bool, Raised> {
    let a_num = is_numeric(ctx, a);
    let b_num = is_numeric(ctx, b);
    if a_num != b_num {
        return Ok(false);
    }
    if a_num {
        let x = to_numeric(ctx, a)?;
        let y = to_numeric(ctx, b)?;
        return Ok(match (x, y) {
            (Numeric::Integer(i), Numeric::Integer(j)) => i == j,
            (x, y) => x.as_f64() == y.as_f64(),
        });
    }
    if ctx.type_of(a) == TypeTag::String && ctx.type_of(b) == TypeTag::String {
        return crate::object::string::eq(ctx, a, b);
    }
    Ok(a == b)
}

/// Rank in the fixed kind ordering
/// `void < boolean < numeric < string < array < object`.
fn kind_rank(ctx: &Context, value: Value) -> u32 {
    match ctx.type_of(value) {
        TypeTag::Void => 0,
        TypeTag::Boolean => 1,
        TypeTag::Integer | TypeTag::Float => 2,
        TypeTag::String => 3,
        TypeTag::Array => 4,
        _ => 5,
    }
}

/// Total order used by CMP.LE / CMP.LT.
pub fn compare(ctx: &Context, a: Value, b: Value) -> Result<Ordering, Raised> {
    compare_depth(ctx, a, b, 0)
}

fn compare_depth(ctx: &Context, a: Value, b: Value, depth: u32) -> Result<Ordering, Raised> {
    if depth > MAX_COMPARE_DEPTH {
        return Err(ctx.raise_kind(ExcKind::TypeError, "comparison nests too deeply"));
    }

    let rank = kind_rank(ctx, a).cmp(&kind_rank(ctx, b));
    if rank != Ordering::Equal {
        return Ok(rank);
    }

    match ctx.type_of(a) {
        TypeTag::Void => Ok(Ordering::Equal),
        TypeTag::Boolean => {
            let x = is_truthy(ctx, a);
            let y = is_truthy(ctx, b);
            Ok(x.cmp(&y))
        }
        TypeTag::Integer | TypeTag::Float => {
            let x = to_numeric(ctx, a)?;
            let y = to_numeric(ctx, b)?;
            if let (Numeric::Integer(i), Numeric::Integer(j)) = (x, y) {
                return Ok(i.cmp(&j));
            }
            // NaN sorts after every other numeric so the order stays
            // total.
            let xf = x.as_f64();
            let yf = y.as_f64();
            Ok(match xf.partial_cmp(&yf) {
                Some(order) => order,
                None => xf.is_nan().cmp(&yf.is_nan()),
            })
        }
        TypeTag::String => crate::object::string::compare(ctx, a, b),
        TypeTag::Array => {
            let xs = snapshot_array(ctx, a)?;
            let ys = snapshot_array(ctx, b)?;
            for (x, y) in xs.iter().zip(ys.iter()) {
                let order = compare_depth(ctx, *x, *y, depth + 1)?;
                if order != Ordering::Equal {
                    return Ok(order);
                }
            }
            Ok(xs.len().cmp(&ys.len()))
        }
        // Remaining heap kinds order by identity, which is stable
        // between collections.
        _ => Ok(a.bits().cmp(&b.bits())),
    }
}

fn snapshot_array(ctx: &Context, array: Value) -> Result<Vec<Value>, Raised> {
    match &ctx.obj(array)?.body {
        ObjBody::Array(a) => Ok(a.to_vec()),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not an array")),
    }
}

// === Generic data access ===

fn key_as_index(ctx: &Context, key: Value) -> Option<i64> {
    match to_numeric(ctx, key) {
        Ok(Numeric::Integer(i)) => Some(i),
        Ok(Numeric::Float(f)) => Some(f.floor() as i64),
        Err(_) => {
            ctx.clear_exception();
            None
        }
    }
}

fn key_as_string(ctx: &Context, key: Value) -> Result<Option<String>, Raised> {
    if ctx.type_of(key) != TypeTag::String {
        return Ok(None);
    }
    crate::object::string::rust_string(ctx, key).map(Some)
}

/// GET / GET.OPT dispatch: integer keys index strings, arrays and
/// buffers; string keys read properties.
pub fn get_generic(ctx: &Context, recv: Value, key: Value, opt: bool) -> Result<Value, Raised> {
    if let Some(name) = key_as_string(ctx, key)? {
        return if opt {
            crate::object::props::get_prop_opt(ctx, recv, &name)
        } else {
            crate::object::props::get_prop(ctx, recv, &name)
        };
    }
    match key_as_index(ctx, key) {
        Some(index) => get_elem(ctx, recv, index, opt),
        None => tolerate(ctx, opt, "property key must be a string or index"),
    }
}

/// Indexed element access on strings, arrays and buffers.
pub fn get_elem(ctx: &Context, recv: Value, index: i64, opt: bool) -> Result<Value, Raised> {
    let result = match ctx.type_of(recv) {
        TypeTag::String => crate::object::string::get(ctx, recv, index),
        TypeTag::Array => crate::object::array::read(ctx, recv, index),
        TypeTag::Buffer => crate::object::buffer::read(ctx, recv, index),
        _ => return tolerate(ctx, opt, "value is not indexable"),
    };
    match result {
        Err(Raised) if opt => {
            ctx.clear_exception();
            Ok(ctx.void_val())
        }
        other => other,
    }
}

fn tolerate(ctx: &Context, opt: bool, message: &str) -> Result<Value, Raised> {
    if opt {
        Ok(ctx.void_val())
    } else {
        Err(ctx.raise_kind(ExcKind::TypeError, message))
    }
}

/// GET.RANGE: slices strings, arrays and buffers. `void` endpoints
/// mean the natural limit; floats are floored; everything clamps.
pub fn get_range(
    ctx: &Context,
    recv: Value,
    begin: Value,
    end: Value,
) -> Result<Value, Raised> {
    let begin = range_endpoint(ctx, begin, 0)?;
    let end = range_endpoint(ctx, end, i64::MAX)?;

    match ctx.type_of(recv) {
        TypeTag::String => crate::object::string::slice(ctx, recv, begin, end),
        TypeTag::Array => crate::object::array::slice(ctx, recv, begin, end),
        TypeTag::Buffer => crate::object::buffer::slice(ctx, recv, begin, end),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value cannot be sliced")),
    }
}

fn range_endpoint(ctx: &Context, value: Value, natural: i64) -> Result<i64, Raised> {
    if value == ctx.void_val() || value.is_bad() {
        return Ok(natural);
    }
    match to_numeric(ctx, value)? {
        Numeric::Integer(i) => Ok(i),
        Numeric::Float(f) => Ok(f.floor() as i64),
    }
}

/// SET dispatch: integer keys write elements, string keys write
/// properties.
pub fn set_generic(ctx: &Context, recv: Value, key: Value, value: Value) -> Result<(), Raised> {
    if let Some(name) = key_as_string(ctx, key)? {
        return crate::object::props::set_prop(ctx, recv, &name, value);
    }
    match key_as_index(ctx, key) {
        Some(index) => set_elem(ctx, recv, index, value),
        None => Err(ctx.raise_kind(ExcKind::TypeError, "property key must be a string or index")),
    }
}

pub fn set_elem(ctx: &Context, recv: Value, index: i64, value: Value) -> Result<(), Raised> {
    match ctx.type_of(recv) {
        TypeTag::Array => crate::object::array::write(ctx, recv, index, value),
        TypeTag::Buffer => {
            let byte = match to_numeric(ctx, value)? {
                Numeric::Integer(i) => i,
                Numeric::Float(f) => f.floor() as i64,
            };
            crate::object::buffer::write(ctx, recv, index, byte)
        }
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not writable by index")),
    }
}

/// DEL: a no-op on receivers outside the object family; object-family
/// receivers require a string key.
pub fn del_generic(ctx: &Context, recv: Value, key: Value) -> Result<(), Raised> {
    let object_family = matches!(
        ctx.type_of(recv),
        TypeTag::Object | TypeTag::Class | TypeTag::Module | TypeTag::Function | TypeTag::Iterator
    );
    if !object_family {
        return Ok(());
    }
    match key_as_string(ctx, key)? {
        Some(name) => crate::object::props::delete_prop(ctx, recv, &name),
        None => Err(ctx.raise_kind(ExcKind::TypeError, "delete key must be a string")),
    }
}

/// PUSH.EX: expand an iterable into individual array elements.
pub fn push_expanded(ctx: &Context, array: Value, value: Value) -> Result<(), Raised> {
    match ctx.type_of(value) {
        TypeTag::Array => {
            let elems = snapshot_array(ctx, value)?;
            for elem in elems {
                crate::object::array::push(ctx, array, elem)?;
            }
            Ok(())
        }
        TypeTag::String => {
            let count = crate::object::string::len(ctx, value)?;
            for i in 0..count {
                let one = crate::object::string::get(ctx, value, i as i64)?;
                crate::object::array::push(ctx, array, one)?;
            }
            Ok(())
        }
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not expandable")),
    }
}

/// Name string for the TYPE instruction, from the instance constant
/// table.
pub fn type_name(ctx: &Context, value: Value) -> Value {
    let tag = ctx.type_of(value);
    let index = crate::runtime::type_name_index(tag);
    ctx.instance().consts.type_names[index].get()
}

/// Human-readable rendering used by exception formatting.
pub fn display(ctx: &Context, value: Value) -> String {
    if value.is_small_int() {
        return value.as_small_int().to_string();
    }
    if value.is_bad() {
        return "<bad>".into();
    }
    match ctx.resolve(value).as_ref().map(|obj| &obj.body) {
        Some(ObjBody::Void) => "void".into(),
        Some(ObjBody::Boolean(b)) => b.to_string(),
        Some(ObjBody::Integer(i)) => i.to_string(),
        Some(ObjBody::Float(f)) => f.to_string(),
        Some(ObjBody::String(_)) => {
            crate::object::string::rust_string_quiet(ctx, value).unwrap_or_else(|| "<string>".into())
        }
        Some(other) => format!("<{}>", other.tag().name()),
        None => "<stale>".into(),
    }
}
