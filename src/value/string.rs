//! String storage and the string operations of the value layer.
//!
//! Strings are immutable. Every operation returns either a fresh value or
//! the input itself when the content would not change.

use std::cell::Cell;
use std::cmp::Ordering;

use super::hashing::fnv1a;
use super::{TinyStr, Value};
use crate::error::{VmError, VmResult};
use crate::gc::Heap;

/// Largest string a single operation may build.
pub const MAX_STRING_BYTES: usize = i32::MAX as usize;

/// Heap payload of a string: the UTF-8 text plus lazily cached char length
/// (`-1` until computed) and content hash (`0` until computed).
pub struct StringStorage {
    text: Box<str>,
    char_len: Cell<i32>,
    hash: Cell<u32>,
}

impl StringStorage {
    pub fn new(text: impl Into<Box<str>>) -> Self {
        StringStorage { text: text.into(), char_len: Cell::new(-1), hash: Cell::new(0) }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    pub fn char_len(&self) -> usize {
        let cached = self.char_len.get();
        if cached >= 0 {
            return cached as usize;
        }
        let n = self.text.chars().count();
        self.char_len.set(n as i32);
        n
    }

    pub fn hash(&self) -> u32 {
        let cached = self.hash.get();
        if cached != 0 {
            return cached;
        }
        let h = fnv1a(self.text.as_bytes());
        self.hash.set(h);
        h
    }
}

impl std::fmt::Debug for StringStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &*self.text)
    }
}

/// Byte offset of char index `idx`, or the string length past the end.
fn byte_offset(s: &str, idx: usize) -> usize {
    s.char_indices().nth(idx).map(|(b, _)| b).unwrap_or(s.len())
}

/// Resolve a possibly-negative char index against `len` and clamp to `0..=len`.
fn clamp_index(idx: i32, len: usize) -> usize {
    let len = len as i64;
    let mut i = idx as i64;
    if i < 0 {
        i += len;
    }
    i.clamp(0, len) as usize
}

impl Heap {
    /// Borrow the text of a string value.
    pub fn str_of<'a>(&'a self, v: &'a Value) -> Option<&'a str> {
        match v {
            Value::Tiny(t) => Some(t.as_str()),
            Value::Str(r) => self.string_storage(*r).map(StringStorage::as_str),
            _ => None,
        }
    }

    fn expect_str<'a>(&'a self, v: &'a Value) -> VmResult<&'a str> {
        self.str_of(v).ok_or_else(|| VmError::TypeMismatch { expected: "string", found: v.kind().name() })
    }

    /// Length in chars.
    pub fn string_len(&self, v: Value) -> usize {
        match v {
            Value::Tiny(t) => t.as_str().chars().count(),
            Value::Str(r) => self.string_storage(r).map_or(0, StringStorage::char_len),
            _ => 0,
        }
    }

    pub(crate) fn string_hash(&self, v: Value) -> u32 {
        match v {
            Value::Tiny(t) => fnv1a(t.as_str().as_bytes()),
            Value::Str(r) => self.string_storage(r).map_or(0, StringStorage::hash),
            _ => 0,
        }
    }

    pub fn string_concat(&mut self, a: Value, b: Value) -> VmResult<Value> {
        let left = self.expect_str(&a)?;
        let right = self.expect_str(&b)?;
        if right.is_empty() {
            return Ok(a);
        }
        if left.is_empty() {
            return Ok(b);
        }
        let joined = format!("{left}{right}");
        self.string_from(joined)
    }

    /// Chars `start..start+len`; `start` may count from the end. Clamped.
    pub fn string_substring(&mut self, v: Value, start: i32, len: i32) -> VmResult<Value> {
        let s = self.expect_str(&v)?;
        let n = self.string_len(v);
        let from = clamp_index(start, n);
        let to = (from + len.max(0) as usize).min(n);
        if from == 0 && to == n {
            return Ok(v);
        }
        let out = s.chars().skip(from).take(to - from).collect::<String>();
        self.string_from(out)
    }

    /// Chars `from..to` with negative indices counting from the end. Clamped.
    pub fn string_slice(&mut self, v: Value, from: i32, to: i32) -> VmResult<Value> {
        let n = self.string_len(v);
        let start = clamp_index(from, n);
        let end = clamp_index(to, n);
        if end <= start {
            return self.new_string("");
        }
        self.string_substring(v, start as i32, (end - start) as i32)
    }

    /// The single char at `index` (negative counts from the end).
    pub fn string_char_at(&mut self, v: Value, index: i32) -> VmResult<Value> {
        let n = self.string_len(v) as i64;
        let i = if index < 0 { index as i64 + n } else { index as i64 };
        if i < 0 || i >= n {
            return Err(VmError::IndexOutOfRange { index, len: n as usize });
        }
        let c = self
            .expect_str(&v)?
            .chars()
            .nth(i as usize)
            .ok_or(VmError::IndexOutOfRange { index, len: n as usize })?;
        let mut buf = [0u8; 4];
        Ok(Value::Tiny(TinyStr::new(c.encode_utf8(&mut buf)).unwrap_or(TinyStr::EMPTY)))
    }

    /// Char index of `needle` at or after char `start`.
    pub fn string_index_of(&self, v: Value, needle: Value, start: usize) -> Option<usize> {
        let s = self.str_of(&v)?;
        let pat = self.str_of(&needle)?;
        let from = byte_offset(s, start);
        let found = s[from..].find(pat)? + from;
        Some(s[..found].chars().count())
    }

    pub fn string_replace(&mut self, v: Value, old: Value, new: Value) -> VmResult<Value> {
        let s = self.expect_str(&v)?;
        let from = self.expect_str(&old)?;
        let to = self.expect_str(&new)?;
        if from.is_empty() || !s.contains(from) {
            return Ok(v);
        }
        let out = s.replace(from, to);
        self.string_from(out)
    }

    /// Split on `delim`; an empty delimiter splits into chars.
    pub fn string_split(&mut self, v: Value, delim: Value) -> VmResult<Value> {
        let s = self.expect_str(&v)?;
        let d = self.expect_str(&delim)?;
        let parts: Vec<String> = if d.is_empty() {
            s.chars().map(String::from).collect()
        } else {
            s.split(d).map(String::from).collect()
        };
        let list = self.new_list(parts.len())?;
        let mut scope = self.scope();
        scope.protect(list);
        for part in parts {
            let item = scope.string_from(part)?;
            scope.list_push(list, item)?;
        }
        Ok(list)
    }

    pub fn string_upper(&mut self, v: Value) -> VmResult<Value> {
        self.map_text(v, |s| s.to_uppercase())
    }

    pub fn string_lower(&mut self, v: Value) -> VmResult<Value> {
        self.map_text(v, |s| s.to_lowercase())
    }

    pub fn string_trim(&mut self, v: Value) -> VmResult<Value> {
        self.map_text(v, |s| s.trim().to_string())
    }

    pub fn string_trim_start(&mut self, v: Value) -> VmResult<Value> {
        self.map_text(v, |s| s.trim_start().to_string())
    }

    pub fn string_trim_end(&mut self, v: Value) -> VmResult<Value> {
        self.map_text(v, |s| s.trim_end().to_string())
    }

    fn map_text(&mut self, v: Value, f: impl FnOnce(&str) -> String) -> VmResult<Value> {
        let s = self.expect_str(&v)?;
        let out = f(s);
        if out == s {
            return Ok(v);
        }
        self.string_from(out)
    }

    /// Bytewise UTF-8 comparison, which orders by code point.
    pub fn string_compare(&self, a: Value, b: Value) -> Ordering {
        match (self.str_of(&a), self.str_of(&b)) {
            (Some(x), Some(y)) => x.as_bytes().cmp(y.as_bytes()),
            _ => Ordering::Equal,
        }
    }

    /// `s * times`: whole repetitions plus a char prefix for the fraction.
    pub fn string_repeat(&mut self, v: Value, times: f64) -> VmResult<Value> {
        let s = self.expect_str(&v)?;
        if !(times > 0.0) || s.is_empty() {
            return self.new_string("");
        }
        if times == 1.0 {
            return Ok(v);
        }
        let limit = self.config().max_bytes.unwrap_or(MAX_STRING_BYTES).min(MAX_STRING_BYTES);
        let whole = times.trunc();
        let fits = whole < limit as f64 && s.len().checked_mul(whole as usize + 1).is_some_and(|n| n <= limit);
        if !fits {
            return Err(VmError::OutOfMemory { requested: (s.len() as f64 * times).min(usize::MAX as f64) as usize });
        }
        let whole = whole as usize;
        let extra = (times.fract() * s.chars().count() as f64) as usize;
        let mut out = s.repeat(whole);
        out.extend(s.chars().take(extra));
        self.string_from(out)
    }
}
