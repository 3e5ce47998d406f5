//! Strings
//!
//! Immutable codepoint sequences. The element width (8, 16 or 32 bits)
//! is chosen at construction from the maximum codepoint observed, and
//! the external API is codepoint-indexed regardless of width. A slice
//! borrows its parent through a reference representation instead of
//! copying.
//!
//! Strings are always effectively read-only; every string allocation
//! sets the read-only header flag.

use crate::error::{ExcKind, Raised};
use crate::object::ObjBody;
use crate::runtime::Context;
use crate::value::{Value, ValueCell};

/// Highest codepoint encodable in UTF-8.
const MAX_CODEPOINT: u32 = 0x10FFFF;

/// String payload.
#[derive(Debug)]
pub enum StrData {
    Latin1(Box<[u8]>),
    Wide16(Box<[u16]>),
    Wide32(Box<[u32]>),
    /// Borrowed view into another string. `parent` always points at a
    /// non-reference string.
    Ref { parent: ValueCell, begin: u32, len: u32 },
}

#[derive(Debug)]
pub struct StringObj {
    data: StrData,
}

impl StringObj {
    /// Build from UTF-8 text, choosing the narrowest element width.
    pub fn from_str(text: &str) -> StringObj {
        let max = text.chars().map(|c| c as u32).max().unwrap_or(0);
        let data = if max <= 0xFF {
            StrData::Latin1(text.chars().map(|c| c as u8).collect())
        } else if max <= 0xFFFF {
            StrData::Wide16(text.chars().map(|c| c as u16).collect())
        } else {
            StrData::Wide32(text.chars().map(|c| c as u32).collect())
        };
        StringObj { data }
    }

    /// Build from raw codepoints. Values outside the UTF-8 range are
    /// accepted and later reported by `to_utf8` as an invalid encoding.
    pub fn from_codepoints(codes: &[u32]) -> StringObj {
        let max = codes.iter().copied().max().unwrap_or(0);
        let data = if max <= 0xFF {
            StrData::Latin1(codes.iter().map(|&c| c as u8).collect())
        } else if max <= 0xFFFF {
            StrData::Wide16(codes.iter().map(|&c| c as u16).collect())
        } else {
            StrData::Wide32(codes.iter().copied().collect())
        };
        StringObj { data }
    }

    /// Parse UTF-8 bytes, optionally expanding escape sequences.
    ///
    /// Recognized escapes: `\t \n \v \f \r \0 \\ \" \'`, `\x##` and
    /// `\u####`.
    pub fn from_utf8(bytes: &[u8], expand_escapes: bool) -> Result<StringObj, ()> {
        let text = std::str::from_utf8(bytes).map_err(|_| ())?;
        if !expand_escapes {
            return Ok(StringObj::from_str(text));
        }
        let codes = expand(text)?;
        Ok(StringObj::from_codepoints(&codes))
    }

    pub fn make_ref(parent: Value, begin: u32, len: u32) -> StringObj {
        StringObj {
            data: StrData::Ref { parent: ValueCell::new(parent), begin, len },
        }
    }

    pub fn len(&self) -> u32 {
        match &self.data {
            StrData::Latin1(b) => b.len() as u32,
            StrData::Wide16(b) => b.len() as u32,
            StrData::Wide32(b) => b.len() as u32,
            StrData::Ref { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.data, StrData::Ref { .. })
    }

    /// Element width in bytes (1 for references; their storage lives in
    /// the parent).
    pub fn elem_width(&self) -> u32 {
        match &self.data {
            StrData::Latin1(_) => 1,
            StrData::Wide16(_) => 2,
            StrData::Wide32(_) => 4,
            StrData::Ref { .. } => 1,
        }
    }

    pub fn payload_size(&self) -> u32 {
        match &self.data {
            StrData::Latin1(b) => b.len() as u32,
            StrData::Wide16(b) => b.len() as u32 * 2,
            StrData::Wide32(b) => b.len() as u32 * 4,
            StrData::Ref { .. } => 16,
        }
    }

    /// Codepoint at `index` for non-reference data.
    fn code_local(&self, index: u32) -> u32 {
        match &self.data {
            StrData::Latin1(b) => b[index as usize] as u32,
            StrData::Wide16(b) => b[index as usize] as u32,
            StrData::Wide32(b) => b[index as usize],
            StrData::Ref { .. } => unreachable!("reference strings have no local storage"),
        }
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        if let StrData::Ref { parent, .. } = &self.data {
            visit(parent.get());
        }
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        if let StrData::Ref { parent, .. } = &self.data {
            parent.set(remap(parent.get()));
        }
    }
}

fn expand(text: &str) -> Result<Vec<u32>, ()> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c as u32);
            continue;
        }
        match chars.next().ok_or(())? {
            't' => out.push('\t' as u32),
            'n' => out.push('\n' as u32),
            'v' => out.push(0x0B),
            'f' => out.push(0x0C),
            'r' => out.push('\r' as u32),
            '0' => out.push(0),
            '\\' => out.push('\\' as u32),
            '"' => out.push('"' as u32),
            '\'' => out.push('\'' as u32),
            'x' => out.push(hex_digits(&mut chars, 2)?),
            'u' => out.push(hex_digits(&mut chars, 4)?),
            _ => return Err(()),
        }
    }
    Ok(out)
}

fn hex_digits(chars: &mut std::str::Chars<'_>, count: u32) -> Result<u32, ()> {
    let mut value = 0u32;
    for _ in 0..count {
        let digit = chars.next().and_then(|c| c.to_digit(16)).ok_or(())?;
        value = value * 16 + digit;
    }
    Ok(value)
}

// === Context-level operations ===

/// Allocate a new read-only string from UTF-8 text.
pub fn new_string(ctx: &Context, text: &str) -> Result<Value, Raised> {
    ctx.alloc_read_only(ObjBody::String(StringObj::from_str(text)))
}

/// Allocate a string from raw codepoints.
pub fn new_string_from_codepoints(ctx: &Context, codes: &[u32]) -> Result<Value, Raised> {
    ctx.alloc_read_only(ObjBody::String(StringObj::from_codepoints(codes)))
}

/// Parse UTF-8 bytes into a string, optionally expanding escapes.
pub fn new_string_from_utf8(
    ctx: &Context,
    bytes: &[u8],
    expand_escapes: bool,
) -> Result<Value, Raised> {
    match StringObj::from_utf8(bytes, expand_escapes) {
        Ok(s) => ctx.alloc_read_only(ObjBody::String(s)),
        Err(()) => Err(ctx.raise_kind(ExcKind::InvalidValue, "invalid UTF-8 sequence")),
    }
}

fn with_string<T>(
    ctx: &Context,
    string: Value,
    f: impl FnOnce(&StringObj) -> T,
) -> Result<T, Raised> {
    let obj = ctx.obj(string)?;
    match &obj.body {
        ObjBody::String(s) => Ok(f(s)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not a string")),
    }
}

/// Codepoint count.
pub fn len(ctx: &Context, string: Value) -> Result<u32, Raised> {
    with_string(ctx, string, |s| s.len())
}

/// Resolve a reference string to (parent value, begin, len); identity
/// for plain strings.
fn resolve_span(ctx: &Context, string: Value) -> Result<(Value, u32, u32), Raised> {
    let obj = ctx.obj(string)?;
    match &obj.body {
        ObjBody::String(StringObj { data: StrData::Ref { parent, begin, len } }) => {
            Ok((parent.get(), *begin, *len))
        }
        ObjBody::String(s) => Ok((string, 0, s.len())),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not a string")),
    }
}

/// Codepoint at `index` (already bounds-checked, non-negative).
fn code_at(ctx: &Context, string: Value, index: u32) -> Result<u32, Raised> {
    let (parent, begin, _) = resolve_span(ctx, string)?;
    let obj = ctx.obj(parent)?;
    match &obj.body {
        ObjBody::String(s) => Ok(s.code_local(begin + index)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not a string")),
    }
}

/// All codepoints, resolving references.
pub fn codepoints(ctx: &Context, string: Value) -> Result<Vec<u32>, Raised> {
    let (parent, begin, count) = resolve_span(ctx, string)?;
    let obj = ctx.obj(parent)?;
    match &obj.body {
        ObjBody::String(s) => {
            Ok((begin..begin + count).map(|i| s.code_local(i)).collect())
        }
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not a string")),
    }
}

/// `get(i)`: one-codepoint string; negative indices count from the
/// end; out of range raises `OutOfRange`.
pub fn get(ctx: &Context, string: Value, index: i64) -> Result<Value, Raised> {
    let count = len(ctx, string)? as i64;
    let fixed = if index < 0 { index + count } else { index };
    if fixed < 0 || fixed >= count {
        return Err(ctx.raise_kind(ExcKind::OutOfRange, "string index out of range"));
    }
    let code = code_at(ctx, string, fixed as u32)?;
    new_string_from_codepoints(ctx, &[code])
}

/// `slice(begin, end)`: clamps to the valid range; negative endpoints
/// count from the end; an inverted range yields the empty string. The
/// result borrows the parent's storage.
pub fn slice(ctx: &Context, string: Value, begin: i64, end: i64) -> Result<Value, Raised> {
    let (parent, parent_begin, count) = resolve_span(ctx, string)?;
    let (from, to) = clamp_range(begin, end, count as i64);
    let obj = StringObj::make_ref(parent, parent_begin + from, to - from);
    ctx.alloc_read_only(ObjBody::String(obj))
}

pub(crate) fn clamp_range(begin: i64, end: i64, len: i64) -> (u32, u32) {
    let mut from = if begin < 0 { begin + len } else { begin };
    let mut to = if end < 0 { end + len } else { end };
    from = from.clamp(0, len);
    to = to.clamp(0, len);
    if to < from {
        to = from;
    }
    (from as u32, to as u32)
}

/// Encode to UTF-8. Returns `None` when the string holds codepoints
/// with no UTF-8 encoding (the "~0" contract at the native boundary).
pub fn to_utf8(ctx: &Context, string: Value) -> Result<Option<Vec<u8>>, Raised> {
    let codes = codepoints(ctx, string)?;
    let mut out = Vec::with_capacity(codes.len());
    for code in codes {
        if code > MAX_CODEPOINT || (0xD800..=0xDFFF).contains(&code) {
            return Ok(None);
        }
        let c = char::from_u32(code).expect("validated codepoint");
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
    Ok(Some(out))
}

/// Extract content as a Rust string; raises `InvalidValue` for
/// unencodable content and `TypeError` for non-strings.
pub fn rust_string(ctx: &Context, string: Value) -> Result<String, Raised> {
    match to_utf8(ctx, string)? {
        Some(bytes) => Ok(String::from_utf8(bytes).expect("valid encoding")),
        None => Err(ctx.raise_kind(ExcKind::InvalidValue, "string holds an invalid encoding")),
    }
}

/// Like [`rust_string`] but never raises; used while inspecting a
/// pending exception, which must not be disturbed.
pub fn rust_string_quiet(ctx: &Context, string: Value) -> Option<String> {
    let obj = ctx.resolve(string)?;
    let (parent, begin, count) = match &obj.body {
        ObjBody::String(StringObj { data: StrData::Ref { parent, begin, len } }) => {
            (parent.get(), *begin, *len)
        }
        ObjBody::String(s) => (string, 0, s.len()),
        _ => return None,
    };
    let parent_obj = ctx.resolve(parent)?;
    let codes: Vec<u32> = match &parent_obj.body {
        ObjBody::String(s) => (begin..begin + count).map(|i| s.code_local(i)).collect(),
        _ => return None,
    };
    let mut out = String::new();
    for code in codes {
        out.push(char::from_u32(code)?);
    }
    Some(out)
}

/// Structural equality of two strings.
pub fn eq(ctx: &Context, a: Value, b: Value) -> Result<bool, Raised> {
    if a == b {
        return Ok(true);
    }
    Ok(codepoints(ctx, a)? == codepoints(ctx, b)?)
}

/// Lexicographic comparison by codepoint.
pub fn compare(ctx: &Context, a: Value, b: Value) -> Result<std::cmp::Ordering, Raised> {
    Ok(codepoints(ctx, a)?.cmp(&codepoints(ctx, b)?))
}
