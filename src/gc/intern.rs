use rustc_hash::FxHashMap;

use super::{GcRef, Heap, HeapObject};
use crate::value::hashing::fnv1a;
use crate::value::{StringStorage, TinyStr, Value};

/// Strings shorter than this are interned when created through
/// [`Heap::new_string`].
pub const INTERN_THRESHOLD: usize = 128;

/// Content-hash buckets of immortal string slots.
#[derive(Default)]
pub(super) struct Interner {
    buckets: FxHashMap<u32, Vec<GcRef>>,
    count: usize,
}

impl Interner {
    pub(super) fn len(&self) -> usize {
        self.count
    }
}

impl Heap {
    /// The canonical immortal value for `s`, creating it on first use.
    /// Strings of up to five bytes stay inline.
    pub fn intern(&mut self, s: &str) -> Value {
        if let Some(t) = TinyStr::new(s) {
            return Value::Tiny(t);
        }
        let hash = fnv1a(s.as_bytes());
        if let Some(bucket) = self.interner.buckets.get(&hash) {
            for &r in bucket {
                if self.string_storage(r).is_some_and(|st| st.as_str() == s) {
                    return Value::Str(r);
                }
            }
        }
        let r = self.alloc_immortal(HeapObject::Str(StringStorage::new(s)));
        self.interner.buckets.entry(hash).or_default().push(r);
        self.interner.count += 1;
        Value::Str(r)
    }

    pub fn is_interned(&self, v: Value) -> bool {
        match v {
            Value::Str(r) => self.is_immortal(r),
            _ => false,
        }
    }
}
