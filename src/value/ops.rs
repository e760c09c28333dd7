//! Arithmetic, comparison, equality, hashing and formatting of values.
//!
//! These need the heap to see inside strings and containers, so they are
//! methods on [`Heap`].

use std::cmp::Ordering;

use super::hashing::{combine, fnv1a, mix64, nonzero};
use super::{format_number, Value};
use crate::error::VmResult;
use crate::gc::Heap;

/// Deepest container nesting that equality, hashing and formatting descend.
pub const MAX_DEPTH: usize = 16;

const NULL_HASH: u32 = 0x2f6e_756c;

fn abs_clamp01(d: f64) -> f64 {
    let d = d.abs();
    if d > 1.0 { 1.0 } else { d }
}

fn fuzzy(d: f64) -> Value {
    if d == 0.0 {
        Value::Int(0)
    } else if d == 1.0 {
        Value::Int(1)
    } else {
        Value::Double(d)
    }
}

fn int_or_double(r: i64) -> Value {
    match i32::try_from(r) {
        Ok(i) => Value::Int(i),
        Err(_) => Value::Double(r as f64),
    }
}

fn number_hash(d: f64) -> u32 {
    // 1 and 1.0 are equal keys, and so are 0.0 and -0.0.
    let d = if d == 0.0 { 0.0 } else { d };
    mix64(d.to_bits())
}

impl Heap {
    // ── Arithmetic ──────────────────────────────────────────────────

    pub fn value_add(&mut self, a: Value, b: Value) -> VmResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(int_or_double(x as i64 + y as i64)),
            _ if a.is_number() && b.is_number() => Ok(Value::Double(a.as_double() + b.as_double())),
            _ if a.is_string() && b.is_string() => self.string_concat(a, b),
            _ if a.is_string() && b.is_number() => {
                let rhs = self.new_string(&format_number(b.as_double()))?;
                self.string_concat(a, rhs)
            }
            _ if a.is_number() && b.is_string() => {
                let lhs = self.new_string(&format_number(a.as_double()))?;
                self.string_concat(lhs, b)
            }
            _ if a.is_string() && b.is_null() => Ok(a),
            (Value::List(_), Value::List(_)) => self.list_concat(a, b),
            (Value::Map(_), Value::Map(_)) => {
                let out = self.map_copy(a)?;
                let mut scope = self.scope();
                scope.protect(out);
                for (k, v) in scope.map_entries(b) {
                    scope.map_set(out, k, v)?;
                }
                Ok(out)
            }
            _ => Ok(Value::Null),
        }
    }

    pub fn value_sub(&mut self, a: Value, b: Value) -> VmResult<Value> {
        Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) => int_or_double(x as i64 - y as i64),
            _ if a.is_number() && b.is_number() => Value::Double(a.as_double() - b.as_double()),
            _ => Value::Null,
        })
    }

    pub fn value_mult(&mut self, a: Value, b: Value) -> VmResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(int_or_double(x as i64 * y as i64)),
            _ if a.is_number() && b.is_number() => Ok(Value::Double(a.as_double() * b.as_double())),
            _ if a.is_string() && b.is_number() => {
                let factor = b.as_double();
                if factor.is_nan() || factor.is_infinite() {
                    return Ok(Value::Null);
                }
                self.string_repeat(a, factor)
            }
            _ => Ok(Value::Null),
        }
    }

    /// Numeric division always yields a double. `string / n` is `string * (1/n)`.
    pub fn value_div(&mut self, a: Value, b: Value) -> VmResult<Value> {
        if a.is_number() && b.is_number() {
            return Ok(Value::Double(a.as_double() / b.as_double()));
        }
        if a.is_string() && b.is_number() {
            return self.value_mult(a, Value::Double(1.0 / b.as_double()));
        }
        Ok(Value::Null)
    }

    pub fn value_mod(&mut self, a: Value, b: Value) -> VmResult<Value> {
        Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) if y != 0 => int_or_double(x as i64 % y as i64),
            _ if a.is_number() && b.is_number() => Value::Double(a.as_double() % b.as_double()),
            _ => Value::Null,
        })
    }

    // ── Fuzzy logic ─────────────────────────────────────────────────

    fn truth_degree(&self, v: Value) -> f64 {
        if v.is_number() {
            v.as_double()
        } else if self.is_truthy(v) {
            1.0
        } else {
            0.0
        }
    }

    pub fn value_and(&self, a: Value, b: Value) -> Value {
        let (x, y) = (self.truth_degree(a), self.truth_degree(b));
        fuzzy(abs_clamp01(x * y))
    }

    pub fn value_or(&self, a: Value, b: Value) -> Value {
        let (x, y) = (self.truth_degree(a), self.truth_degree(b));
        fuzzy(abs_clamp01(x + y - x * y))
    }

    pub fn value_not(&self, a: Value) -> Value {
        fuzzy(1.0 - abs_clamp01(self.truth_degree(a)))
    }

    // ── Comparison ──────────────────────────────────────────────────

    pub fn value_lt(&self, a: Value, b: Value) -> bool {
        if a.is_number() && b.is_number() {
            return a.as_double() < b.as_double();
        }
        if a.is_string() && b.is_string() {
            return self.string_compare(a, b) == Ordering::Less;
        }
        false
    }

    pub fn value_le(&self, a: Value, b: Value) -> bool {
        if a.is_number() && b.is_number() {
            return a.as_double() <= b.as_double();
        }
        if a.is_string() && b.is_string() {
            return self.string_compare(a, b) != Ordering::Greater;
        }
        false
    }

    /// Total order used by sorting: null, then numbers, then strings, then
    /// everything else (mutually unordered).
    pub fn compare_natural(&self, a: Value, b: Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Int(_) | Value::Double(_) => 1,
                Value::Tiny(_) | Value::Str(_) => 2,
                _ => 3,
            }
        }
        match rank(&a).cmp(&rank(&b)) {
            Ordering::Equal => {}
            other => return other,
        }
        if a.is_number() {
            return a.as_double().partial_cmp(&b.as_double()).unwrap_or(Ordering::Equal);
        }
        if a.is_string() {
            return self.string_compare(a, b);
        }
        Ordering::Equal
    }

    // ── Equality & hashing ──────────────────────────────────────────

    /// Content equality: numbers compare numerically, strings by content,
    /// lists and maps structurally, function references by identity.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        self.equal_at(a, b, 0)
    }

    fn equal_at(&self, a: Value, b: Value, depth: usize) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Int(x), Value::Int(y)) => x == y,
            _ if a.is_number() && b.is_number() => a.as_double() == b.as_double(),
            (Value::Tiny(x), Value::Tiny(y)) => x == y,
            (Value::Str(x), Value::Str(y)) if x == y => true,
            _ if a.is_string() && b.is_string() => self.str_of(&a) == self.str_of(&b),
            (Value::List(x), Value::List(y)) => {
                if x == y {
                    return true;
                }
                if depth >= MAX_DEPTH {
                    return false;
                }
                let (Some(xs), Some(ys)) = (self.list_items(a), self.list_items(b)) else {
                    return false;
                };
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(p, q)| self.equal_at(*p, *q, depth + 1))
            }
            (Value::Map(x), Value::Map(y)) => {
                if x == y {
                    return true;
                }
                if depth >= MAX_DEPTH || self.map_count(a) != self.map_count(b) {
                    return false;
                }
                self.map_entries(a).into_iter().all(|(k, v)| match self.map_try_get(b, k) {
                    Some(w) => self.equal_at(v, w, depth + 1),
                    None => false,
                })
            }
            (Value::FuncRef(x), Value::FuncRef(y)) => x == y,
            _ => false,
        }
    }

    /// Hash consistent with [`values_equal`](Heap::values_equal). Never 0.
    pub fn hash_value(&self, v: Value) -> u32 {
        self.hash_at(v, 0)
    }

    fn hash_at(&self, v: Value, depth: usize) -> u32 {
        match v {
            Value::Null => NULL_HASH,
            Value::Int(i) => number_hash(i as f64),
            Value::Double(d) => number_hash(d),
            Value::Tiny(_) | Value::Str(_) => self.string_hash(v),
            Value::List(_) => {
                let items = self.list_items(v).unwrap_or(&[]);
                let mut h = combine(fnv1a(b"list"), items.len() as u32);
                if depth < MAX_DEPTH {
                    for item in items {
                        h = combine(h, self.hash_at(*item, depth + 1));
                    }
                }
                nonzero(h)
            }
            Value::Map(_) => {
                let entries = self.map_entries(v);
                let mut h = combine(fnv1a(b"map"), entries.len() as u32);
                if depth < MAX_DEPTH {
                    // Order-independent so equal maps hash alike.
                    let mut sum = 0u32;
                    for (k, val) in entries {
                        sum = sum.wrapping_add(combine(self.hash_at(k, depth + 1), self.hash_at(val, depth + 1)));
                    }
                    h = combine(h, sum);
                }
                nonzero(h)
            }
            Value::FuncRef(r) => mix64(r.index() as u64 | 0xf00d_0000_0000),
        }
    }

    // ── Truthiness ──────────────────────────────────────────────────

    pub fn is_truthy(&self, v: Value) -> bool {
        match v {
            Value::Null => false,
            Value::Int(i) => i != 0,
            Value::Double(d) => d != 0.0,
            Value::Tiny(t) => !t.is_empty(),
            Value::Str(_) => self.str_of(&v).is_some_and(|s| !s.is_empty()),
            Value::List(_) => self.list_count(v) > 0,
            Value::Map(_) => self.map_count(v) > 0,
            Value::FuncRef(_) => true,
        }
    }

    // ── Conversion & formatting ─────────────────────────────────────

    /// Display form: strings raw, containers with element reprs.
    pub fn to_display(&self, v: Value) -> String {
        let mut out = String::new();
        self.format_into(v, &mut out, 0, false);
        out
    }

    /// Literal form: strings quoted with embedded quotes doubled.
    pub fn repr(&self, v: Value) -> String {
        let mut out = String::new();
        self.format_into(v, &mut out, 0, true);
        out
    }

    fn format_into(&self, v: Value, out: &mut String, depth: usize, quoted: bool) {
        match v {
            Value::Null => out.push_str("null"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Double(d) => out.push_str(&format_number(d)),
            Value::Tiny(_) | Value::Str(_) => {
                let s = self.str_of(&v).unwrap_or("");
                if quoted {
                    out.push('"');
                    out.push_str(&s.replace('"', "\"\""));
                    out.push('"');
                } else {
                    out.push_str(s);
                }
            }
            Value::List(_) => {
                if depth >= MAX_DEPTH {
                    out.push_str("[…]");
                    return;
                }
                out.push('[');
                for (i, item) in self.list_items(v).unwrap_or(&[]).iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.format_into(*item, out, depth + 1, true);
                }
                out.push(']');
            }
            Value::Map(_) => {
                if depth >= MAX_DEPTH {
                    out.push_str("{…}");
                    return;
                }
                out.push('{');
                for (i, (k, val)) in self.map_entries(v).into_iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.format_into(k, out, depth + 1, true);
                    out.push_str(": ");
                    self.format_into(val, out, depth + 1, true);
                }
                out.push('}');
            }
            Value::FuncRef(_) => match self.funcref(v) {
                Some(f) if !f.outer_vars.is_null() => out.push_str(&format!("FuncRef({}, closure)", f.func_index)),
                Some(f) => out.push_str(&format!("FuncRef({})", f.func_index)),
                None => out.push_str("FuncRef(?)"),
            },
        }
    }

    /// The display form as a string value.
    pub fn to_string_value(&mut self, v: Value) -> VmResult<Value> {
        if v.is_string() {
            return Ok(v);
        }
        let s = self.to_display(v);
        self.string_from(s)
    }

    /// Numeric value of `v`: numbers pass through, strings are parsed
    /// (0 when unparseable), everything else is 0.
    pub fn to_number(&self, v: Value) -> Value {
        match v {
            Value::Int(_) | Value::Double(_) => v,
            Value::Tiny(_) | Value::Str(_) => match self.str_of(&v).map(str::trim).map(str::parse::<f64>) {
                Some(Ok(d)) => Value::number(d),
                _ => Value::Int(0),
            },
            _ => Value::Int(0),
        }
    }
}
