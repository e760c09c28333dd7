//! Runtime values.
//!
//! A [`Value`] is a small `Copy` datum. Numbers and strings of up to five
//! bytes live inline; everything else is a [`GcRef`] handle into the
//! [`Heap`](crate::gc::Heap), whose lifetime the collector alone governs.

pub mod hashing;
mod ops;
mod string;

use std::fmt;

pub use crate::gc::GcRef;
pub use string::StringStorage;

// ── Inline strings ──────────────────────────────────────────────────

/// A string of at most [`TinyStr::MAX_LEN`] UTF-8 bytes stored inside the value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TinyStr {
    len: u8,
    bytes: [u8; 5],
}

impl TinyStr {
    pub const MAX_LEN: usize = 5;

    pub const EMPTY: TinyStr = TinyStr { len: 0, bytes: [0; 5] };

    pub fn new(s: &str) -> Option<TinyStr> {
        if s.len() > Self::MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; 5];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Some(TinyStr { len: s.len() as u8, bytes })
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from a `&str`, so the prefix is valid UTF-8.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for TinyStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

// ── Value ───────────────────────────────────────────────────────────

/// A dynamically typed runtime value.
///
/// `PartialEq` is *identity*: two heap values compare equal only when they
/// are the same object. Content equality lives on the heap
/// ([`Heap::values_equal`](crate::gc::Heap::values_equal)).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Int(i32),
    Double(f64),
    Tiny(TinyStr),
    Str(GcRef),
    List(GcRef),
    Map(GcRef),
    FuncRef(GcRef),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Int,
    Double,
    String,
    List,
    Map,
    FuncRef,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Int | ValueKind::Double => "number",
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::FuncRef => "funcRef",
        }
    }
}

impl Value {
    pub const TRUE: Value = Value::Int(1);
    pub const FALSE: Value = Value::Int(0);

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Int(_) => ValueKind::Int,
            Value::Double(_) => ValueKind::Double,
            Value::Tiny(_) | Value::Str(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::FuncRef(_) => ValueKind::FuncRef,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    #[inline]
    pub fn is_double(&self) -> bool {
        matches!(self, Value::Double(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Value::Tiny(_) | Value::Str(_))
    }

    #[inline]
    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    #[inline]
    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    #[inline]
    pub fn is_funcref(&self) -> bool {
        matches!(self, Value::FuncRef(_))
    }

    /// The heap handle behind this value, if it has one.
    #[inline]
    pub fn heap_ref(&self) -> Option<GcRef> {
        match *self {
            Value::Str(r) | Value::List(r) | Value::Map(r) | Value::FuncRef(r) => Some(r),
            _ => None,
        }
    }

    /// Integer view. Doubles truncate toward zero; non-numbers read as 0.
    pub fn as_int(&self) -> i32 {
        match *self {
            Value::Int(i) => i,
            Value::Double(d) => d as i32,
            _ => 0,
        }
    }

    /// Floating-point view. Non-numbers read as 0.0.
    pub fn as_double(&self) -> f64 {
        match *self {
            Value::Int(i) => i as f64,
            Value::Double(d) => d,
            _ => 0.0,
        }
    }

    /// Reference identity; doubles compare by bit pattern.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    /// A number value: integral doubles in `i32` range become `Int`.
    pub fn number(d: f64) -> Value {
        if d.fract() == 0.0 && d >= i32::MIN as f64 && d <= i32::MAX as f64 {
            Value::Int(d as i32)
        } else {
            Value::Double(d)
        }
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        if b { Value::TRUE } else { Value::FALSE }
    }
}

// ── Function references ─────────────────────────────────────────────

/// Heap payload of a function reference: a function-table index plus the
/// captured closure environment (a map, usually a VarMap, or null).
#[derive(Clone, Copy, Debug)]
pub struct FuncRefData {
    pub func_index: usize,
    pub outer_vars: Value,
}

// ── Number formatting ───────────────────────────────────────────────

pub fn format_number(d: f64) -> String {
    if d.is_nan() {
        return "NaN".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "INF".to_string() } else { "-INF".to_string() };
    }
    let mag = d.abs();
    if mag > 1e10 || (mag < 1e-6 && mag != 0.0) {
        return format_exponent(d);
    }
    if d.fract() == 0.0 {
        return format!("{d:.0}");
    }
    let s = format!("{d:.6}");
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.').to_string()
}

// d.ddddddE+XX
fn format_exponent(d: f64) -> String {
    let s = format!("{d:.6E}");
    match s.split_once('E') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(rest) => ('-', rest),
                None => ('+', exp),
            };
            format!("{mantissa}E{sign}{digits:0>2}")
        }
        None => s,
    }
}
