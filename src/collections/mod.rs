//! Lists, maps and register-aliasing VarMaps on the GC heap.

mod list;
mod map;
mod varmap;

use rustc_hash::{FxHashMap, FxHashSet};

pub use list::ValueList;
pub use map::{isa_key, ValueMap, DEFAULT_CAPACITY, MAX_ISA_DEPTH};
pub use varmap::RegisterFile;

use crate::error::VmResult;
use crate::gc::{GcRef, Heap, HeapObject};
use crate::value::Value;

impl Heap {
    /// Freeze `v` and every container reachable from it.
    pub fn freeze(&mut self, v: Value) {
        let mut seen = FxHashSet::default();
        let mut pending = vec![v];
        while let Some(v) = pending.pop() {
            let Some(r) = v.heap_ref() else { continue };
            if !seen.insert(r) {
                continue;
            }
            match v {
                Value::List(_) => {
                    if let Some(HeapObject::List(l)) = self.object_mut(r) {
                        l.frozen = true;
                        pending.extend_from_slice(&l.items);
                    }
                }
                Value::Map(_) => {
                    let entries = self.map_entries(v);
                    if let Some(HeapObject::Map(m)) = self.object_mut(r) {
                        m.frozen = true;
                    }
                    pending.extend(entries.into_iter().flat_map(|(k, x)| [k, x]));
                }
                _ => {}
            }
        }
    }

    pub fn is_frozen(&self, v: Value) -> bool {
        match v {
            Value::List(_) => self.list_ref(v).is_some_and(|l| l.frozen),
            Value::Map(_) => self.map_ref(v).is_some_and(|m| m.frozen),
            _ => false,
        }
    }

    /// Deep copy of `v` with every container frozen. Shared and cyclic
    /// structure is preserved.
    pub fn frozen_copy(&mut self, v: Value) -> VmResult<Value> {
        let mut copies = FxHashMap::default();
        let mut scope = self.scope();
        let out = scope.copy_frozen(v, &mut copies)?;
        drop(scope);
        self.freeze(out);
        Ok(out)
    }

    fn copy_frozen(&mut self, v: Value, copies: &mut FxHashMap<GcRef, Value>) -> VmResult<Value> {
        let Some(r) = v.heap_ref() else { return Ok(v) };
        if let Some(done) = copies.get(&r) {
            return Ok(*done);
        }
        match v {
            Value::List(_) => {
                let items = self.list_items(v).unwrap_or(&[]).to_vec();
                let out = self.new_list(items.len())?;
                self.protect(out);
                copies.insert(r, out);
                for item in items {
                    let copy = self.copy_frozen(item, copies)?;
                    self.list_push(out, copy)?;
                }
                Ok(out)
            }
            Value::Map(_) => {
                let entries = self.map_entries(v);
                let out = self.new_map(entries.len() * 2)?;
                self.protect(out);
                copies.insert(r, out);
                for (k, x) in entries {
                    let key = self.copy_frozen(k, copies)?;
                    self.protect(key);
                    let value = self.copy_frozen(x, copies)?;
                    self.map_set(out, key, value)?;
                }
                Ok(out)
            }
            _ => Ok(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_reaches_nested_containers() {
        let mut heap = Heap::new();
        let inner = heap.list_from(vec![Value::Int(1)]).unwrap();
        let outer = heap.new_map(0).unwrap();
        heap.map_set(outer, Value::Int(0), inner).unwrap();
        heap.freeze(outer);
        assert!(heap.is_frozen(outer));
        assert!(heap.is_frozen(inner));
        assert!(!heap.is_frozen(Value::Int(3)));
    }

    #[test]
    fn freeze_handles_cycles() {
        let mut heap = Heap::new();
        let l = heap.new_list(0).unwrap();
        heap.list_push(l, l).unwrap();
        heap.freeze(l);
        assert!(heap.is_frozen(l));
    }

    #[test]
    fn frozen_copy_leaves_original_mutable() {
        let mut heap = Heap::new();
        let inner = heap.list_from(vec![Value::Int(1)]).unwrap();
        let outer = heap.list_from(vec![inner, inner]).unwrap();
        let copy = heap.frozen_copy(outer).unwrap();
        assert!(heap.is_frozen(copy));
        assert!(!heap.is_frozen(outer));
        assert!(heap.values_equal(copy, outer));
        let items = heap.list_items(copy).unwrap().to_vec();
        assert_eq!(items[0], items[1]);
        assert_ne!(items[0], inner);
        heap.list_push(outer, Value::Null).unwrap();
    }
}
