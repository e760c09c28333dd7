use std::mem::size_of;

use crate::error::{VmError, VmResult};
use crate::gc::{GcRef, Heap, HeapObject, Tracer};
use crate::value::Value;

/// Heap payload of a list.
#[derive(Debug, Default)]
pub struct ValueList {
    pub(crate) items: Vec<Value>,
    pub(crate) frozen: bool,
}

impl ValueList {
    pub(crate) fn heap_bytes(&self) -> usize {
        self.items.capacity() * size_of::<Value>()
    }

    pub(crate) fn trace(&self, tracer: &mut Tracer<'_>) {
        for &v in &self.items {
            tracer.mark_value(v);
        }
    }
}

/// Resolve a possibly-negative index against `len`.
fn resolve(index: i32, len: usize) -> Option<usize> {
    let i = if index < 0 { index as i64 + len as i64 } else { index as i64 };
    (i >= 0 && (i as usize) < len).then_some(i as usize)
}

fn clamp(index: i32, len: usize) -> usize {
    let i = if index < 0 { index as i64 + len as i64 } else { index as i64 };
    i.clamp(0, len as i64) as usize
}

impl Heap {
    pub fn new_list(&mut self, capacity: usize) -> VmResult<Value> {
        self.list_from(Vec::with_capacity(capacity))
    }

    pub fn list_from(&mut self, items: Vec<Value>) -> VmResult<Value> {
        let r = self.alloc(HeapObject::List(ValueList { items, frozen: false }))?;
        Ok(Value::List(r))
    }

    pub(crate) fn list_ref(&self, v: Value) -> Option<&ValueList> {
        match v {
            Value::List(r) => match self.object(r)? {
                HeapObject::List(l) => Some(l),
                _ => None,
            },
            _ => None,
        }
    }

    fn list_handle(&self, v: Value) -> VmResult<GcRef> {
        match v {
            Value::List(r) if self.is_live(r) => Ok(r),
            Value::List(_) => Err(VmError::StaleReference),
            _ => Err(VmError::TypeMismatch { expected: "list", found: v.kind().name() }),
        }
    }

    /// Mutable access for a mutation; refuses frozen lists.
    fn list_mut(&mut self, v: Value) -> VmResult<&mut ValueList> {
        let r = self.list_handle(v)?;
        match self.object_mut(r) {
            Some(HeapObject::List(l)) if l.frozen => Err(VmError::FrozenMutation { kind: "list" }),
            Some(HeapObject::List(l)) => Ok(l),
            _ => Err(VmError::StaleReference),
        }
    }

    /// Run a mutation and recharge the slot if the backing store moved.
    fn list_update<T>(&mut self, v: Value, f: impl FnOnce(&mut Vec<Value>) -> T) -> VmResult<T> {
        let r = self.list_handle(v)?;
        let list = self.list_mut(v)?;
        let cap = list.items.capacity();
        let out = f(&mut list.items);
        if list.items.capacity() != cap {
            self.reaccount(r);
        }
        Ok(out)
    }

    pub fn list_items(&self, v: Value) -> Option<&[Value]> {
        self.list_ref(v).map(|l| l.items.as_slice())
    }

    pub fn list_count(&self, v: Value) -> usize {
        self.list_ref(v).map_or(0, |l| l.items.len())
    }

    pub fn list_get(&self, v: Value, index: i32) -> VmResult<Value> {
        let items = self
            .list_items(v)
            .ok_or(VmError::TypeMismatch { expected: "list", found: v.kind().name() })?;
        resolve(index, items.len())
            .map(|i| items[i])
            .ok_or(VmError::IndexOutOfRange { index, len: items.len() })
    }

    pub fn list_set(&mut self, v: Value, index: i32, item: Value) -> VmResult<()> {
        let list = self.list_mut(v)?;
        let len = list.items.len();
        let i = resolve(index, len).ok_or(VmError::IndexOutOfRange { index, len })?;
        list.items[i] = item;
        Ok(())
    }

    pub fn list_push(&mut self, v: Value, item: Value) -> VmResult<()> {
        self.list_update(v, |items| items.push(item))
    }

    /// Remove and return the last element (null when empty).
    pub fn list_pop(&mut self, v: Value) -> VmResult<Value> {
        Ok(self.list_mut(v)?.items.pop().unwrap_or_default())
    }

    /// Remove and return the first element (null when empty).
    pub fn list_pull(&mut self, v: Value) -> VmResult<Value> {
        let list = self.list_mut(v)?;
        if list.items.is_empty() {
            return Ok(Value::Null);
        }
        Ok(list.items.remove(0))
    }

    /// Insert before `index`; a negative index counts from one past the end.
    pub fn list_insert(&mut self, v: Value, index: i32, item: Value) -> VmResult<()> {
        let len = self.list_count(v);
        let at = if index < 0 { index as i64 + len as i64 + 1 } else { index as i64 };
        if at < 0 || at as usize > len {
            self.list_handle(v)?;
            return Err(VmError::IndexOutOfRange { index, len });
        }
        self.list_update(v, |items| items.insert(at as usize, item))
    }

    /// Remove the element at `index`; `false` when out of range.
    pub fn list_remove(&mut self, v: Value, index: i32) -> VmResult<bool> {
        let list = self.list_mut(v)?;
        match resolve(index, list.items.len()) {
            Some(i) => {
                list.items.remove(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list_clear(&mut self, v: Value) -> VmResult<()> {
        self.list_update(v, Vec::clear)
    }

    /// Elements `from..to`, negative indices counting from the end. Never fails on range.
    pub fn list_slice(&mut self, v: Value, from: i32, to: i32) -> VmResult<Value> {
        let items = self
            .list_items(v)
            .ok_or(VmError::TypeMismatch { expected: "list", found: v.kind().name() })?;
        let start = clamp(from, items.len());
        let end = clamp(to, items.len());
        let part = if end > start { items[start..end].to_vec() } else { Vec::new() };
        self.list_from(part)
    }

    pub fn list_concat(&mut self, a: Value, b: Value) -> VmResult<Value> {
        let mut items = self
            .list_items(a)
            .ok_or(VmError::TypeMismatch { expected: "list", found: a.kind().name() })?
            .to_vec();
        items.extend_from_slice(self.list_items(b).unwrap_or(&[]));
        self.list_from(items)
    }

    pub fn list_copy(&mut self, v: Value) -> VmResult<Value> {
        let items = self
            .list_items(v)
            .ok_or(VmError::TypeMismatch { expected: "list", found: v.kind().name() })?
            .to_vec();
        self.list_from(items)
    }

    pub fn list_index_of(&self, v: Value, item: Value, start: usize) -> Option<usize> {
        let items = self.list_items(v)?;
        items
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, x)| self.values_equal(**x, item))
            .map(|(i, _)| i)
    }

    pub fn list_contains(&self, v: Value, item: Value) -> bool {
        self.list_index_of(v, item, 0).is_some()
    }

    /// Sort in place by natural order, or by each element's `by_key`
    /// projection when it is non-null. Ties have no guaranteed order.
    pub fn list_sort(&mut self, v: Value, by_key: Value) -> VmResult<()> {
        let mut items = std::mem::take(&mut self.list_mut(v)?.items);
        if by_key.is_null() {
            items.sort_unstable_by(|a, b| self.compare_natural(*a, *b));
        } else {
            let mut keyed: Vec<(Value, Value)> = items.iter().map(|x| (self.project_key(*x, by_key), *x)).collect();
            keyed.sort_unstable_by(|a, b| self.compare_natural(a.0, b.0));
            items = keyed.into_iter().map(|(_, x)| x).collect();
        }
        self.list_mut(v)?.items = items;
        Ok(())
    }

    fn project_key(&self, element: Value, key: Value) -> Value {
        match element {
            Value::Map(_) => self.map_try_get(element, key).unwrap_or_default(),
            Value::List(_) if key.is_number() => self.list_get(element, key.as_int()).unwrap_or_default(),
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(heap: &Heap, v: Value) -> Vec<i32> {
        heap.list_items(v).unwrap().iter().map(Value::as_int).collect()
    }

    #[test]
    fn push_pop_is_lifo_and_pull_is_fifo() {
        let mut heap = Heap::new();
        let l = heap.new_list(0).unwrap();
        for i in 1..=3 {
            heap.list_push(l, Value::Int(i)).unwrap();
        }
        assert_eq!(heap.list_pop(l).unwrap(), Value::Int(3));
        assert_eq!(heap.list_pull(l).unwrap(), Value::Int(1));
        assert_eq!(ints(&heap, l), vec![2]);
        heap.list_pop(l).unwrap();
        assert_eq!(heap.list_pop(l).unwrap(), Value::Null);
        assert_eq!(heap.list_pull(l).unwrap(), Value::Null);
    }

    #[test]
    fn negative_indices_count_from_end() {
        let mut heap = Heap::new();
        let l = heap.list_from(vec![Value::Int(10), Value::Int(20), Value::Int(30)]).unwrap();
        assert_eq!(heap.list_get(l, -1).unwrap(), Value::Int(30));
        heap.list_set(l, -3, Value::Int(5)).unwrap();
        assert_eq!(heap.list_get(l, 0).unwrap(), Value::Int(5));
        assert!(matches!(heap.list_get(l, 3), Err(VmError::IndexOutOfRange { index: 3, len: 3 })));
        assert!(matches!(heap.list_get(l, -4), Err(VmError::IndexOutOfRange { .. })));
    }

    #[test]
    fn frozen_list_rejects_mutation_unchanged() {
        let mut heap = Heap::new();
        let l = heap.list_from(vec![Value::Int(1)]).unwrap();
        heap.freeze(l);
        let err = heap.list_push(l, Value::Int(2)).unwrap_err();
        assert_eq!(err.to_string(), "Attempt to modify a frozen list");
        assert!(heap.list_set(l, 0, Value::Int(9)).is_err());
        assert!(heap.list_sort(l, Value::Null).is_err());
        assert_eq!(ints(&heap, l), vec![1]);
    }

    #[test]
    fn insert_and_remove() {
        let mut heap = Heap::new();
        let l = heap.list_from(vec![Value::Int(1), Value::Int(3)]).unwrap();
        heap.list_insert(l, 1, Value::Int(2)).unwrap();
        heap.list_insert(l, -1, Value::Int(4)).unwrap();
        assert_eq!(ints(&heap, l), vec![1, 2, 3, 4]);
        assert!(heap.list_insert(l, 9, Value::Int(0)).is_err());
        assert!(heap.list_remove(l, 0).unwrap());
        assert!(heap.list_remove(l, -1).unwrap());
        assert!(!heap.list_remove(l, 7).unwrap());
        assert_eq!(ints(&heap, l), vec![2, 3]);
    }

    #[test]
    fn slice_is_clamped_and_never_fails() {
        let mut heap = Heap::new();
        let l = heap.list_from((0..5).map(Value::Int).collect()).unwrap();
        let s = heap.list_slice(l, 1, 3).unwrap();
        assert_eq!(ints(&heap, s), vec![1, 2]);
        let s = heap.list_slice(l, -2, 100).unwrap();
        assert_eq!(ints(&heap, s), vec![3, 4]);
        let s = heap.list_slice(l, 4, 1).unwrap();
        assert_eq!(heap.list_count(s), 0);
    }

    #[test]
    fn concat_copy_and_search() {
        let mut heap = Heap::new();
        let a = heap.list_from(vec![Value::Int(1), Value::Int(2)]).unwrap();
        let b = heap.list_from(vec![Value::Double(2.0)]).unwrap();
        let ab = heap.list_concat(a, b).unwrap();
        assert_eq!(heap.list_count(ab), 3);
        let c = heap.list_copy(a).unwrap();
        heap.list_push(c, Value::Int(9)).unwrap();
        assert_eq!(heap.list_count(a), 2);
        assert_eq!(heap.list_index_of(ab, Value::Int(2), 0), Some(1));
        assert_eq!(heap.list_index_of(ab, Value::Int(2), 2), Some(2));
        assert!(!heap.list_contains(a, Value::Int(7)));
    }

    #[test]
    fn sort_natural_and_by_key() {
        let mut heap = Heap::new();
        let b = heap.new_string("b").unwrap();
        let a = heap.new_string("a").unwrap();
        let l = heap.list_from(vec![b, Value::Int(3), Value::Null, a, Value::Double(1.5)]).unwrap();
        heap.list_sort(l, Value::Null).unwrap();
        let items = heap.list_items(l).unwrap().to_vec();
        assert_eq!(items[0], Value::Null);
        assert_eq!(items[1], Value::Double(1.5));
        assert_eq!(items[2], Value::Int(3));
        assert_eq!(items[3], a);
        assert_eq!(items[4], b);

        let key = heap.new_string("age").unwrap();
        let people = heap.new_list(0).unwrap();
        for age in [30, 10, 20] {
            let m = heap.new_map(0).unwrap();
            heap.map_set(m, key, Value::Int(age)).unwrap();
            heap.list_push(people, m).unwrap();
        }
        heap.list_sort(people, key).unwrap();
        let ages: Vec<i32> = heap
            .list_items(people)
            .unwrap()
            .to_vec()
            .into_iter()
            .map(|m| heap.map_get(m, key).as_int())
            .collect();
        assert_eq!(ages, vec![10, 20, 30]);
    }

    #[test]
    fn randomized_push_pop_matches_vec() {
        let mut heap = Heap::new();
        let l = heap.new_list(0).unwrap();
        let mut model = Vec::new();
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..500 {
            if rng.bool() || model.is_empty() {
                let x = rng.i32(-1000..1000);
                heap.list_push(l, Value::Int(x)).unwrap();
                model.push(x);
            } else {
                assert_eq!(heap.list_pop(l).unwrap(), Value::Int(model.pop().unwrap()));
            }
        }
        assert_eq!(ints(&heap, l), model);
    }
}
