//! Open-addressed hash map with linear probing.
//!
//! The table doubles before an insert would push it past 75% load. Removal
//! re-inserts the rest of the probe run so no lookup chain is broken.

use std::mem::size_of;

use super::varmap::VarMapData;
use crate::error::{VmError, VmResult};
use crate::gc::{GcRef, Heap, HeapObject, Tracer};
use crate::value::{TinyStr, Value};

pub const DEFAULT_CAPACITY: usize = 8;

/// Bound on `__isa` chain walks.
pub const MAX_ISA_DEPTH: usize = 256;

/// The key linking an object map to its prototype.
pub fn isa_key() -> Value {
    Value::Tiny(TinyStr::new("__isa").unwrap_or(TinyStr::EMPTY))
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MapEntry {
    key: Value,
    value: Value,
    hash: u32,
    occupied: bool,
}

/// Heap payload of a map.
#[derive(Debug)]
pub struct ValueMap {
    entries: Vec<MapEntry>,
    count: usize,
    resizes: u32,
    pub(crate) frozen: bool,
    pub(crate) vars: Option<VarMapData>,
}

impl ValueMap {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(DEFAULT_CAPACITY).next_power_of_two();
        ValueMap { entries: vec![MapEntry::default(); cap], count: 0, resizes: 0, frozen: false, vars: None }
    }

    pub(crate) fn heap_bytes(&self) -> usize {
        self.entries.len() * size_of::<MapEntry>()
            + self.vars.as_ref().map_or(0, |v| v.keys.capacity() * (size_of::<Value>() + size_of::<usize>()))
    }

    pub(crate) fn trace(&self, tracer: &mut Tracer<'_>) {
        for e in self.entries.iter().filter(|e| e.occupied) {
            tracer.mark_value(e.key);
            tracer.mark_value(e.value);
        }
        if let Some(vars) = &self.vars {
            for &k in &vars.keys {
                tracer.mark_value(k);
            }
        }
    }

    fn mask(&self) -> usize {
        self.entries.len() - 1
    }

    /// Place an entry in the first free slot of its probe run. Keys must be
    /// unique and the table must have room.
    fn raw_insert(&mut self, entry: MapEntry) {
        let mask = self.mask();
        let mut i = entry.hash as usize & mask;
        while self.entries[i].occupied {
            i = (i + 1) & mask;
        }
        self.entries[i] = entry;
    }

    fn needs_growth(&self) -> bool {
        (self.count + 1) * 4 > self.entries.len() * 3
    }

    fn grow(&mut self) {
        let doubled = self.entries.len() * 2;
        let old = std::mem::replace(&mut self.entries, vec![MapEntry::default(); doubled]);
        for e in old.into_iter().filter(|e| e.occupied) {
            self.raw_insert(e);
        }
        self.resizes += 1;
    }

    fn remove_at(&mut self, index: usize) {
        let mask = self.mask();
        self.entries[index] = MapEntry::default();
        self.count -= 1;
        let mut j = (index + 1) & mask;
        while self.entries[j].occupied {
            let displaced = std::mem::take(&mut self.entries[j]);
            self.raw_insert(displaced);
            j = (j + 1) & mask;
        }
    }

    fn slot_entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries.iter().filter(|e| e.occupied)
    }
}

impl Heap {
    pub fn new_map(&mut self, capacity: usize) -> VmResult<Value> {
        let r = self.alloc(HeapObject::Map(ValueMap::with_capacity(capacity)))?;
        Ok(Value::Map(r))
    }

    pub(crate) fn map_ref(&self, v: Value) -> Option<&ValueMap> {
        match v {
            Value::Map(r) => match self.object(r)? {
                HeapObject::Map(m) => Some(m),
                _ => None,
            },
            _ => None,
        }
    }

    pub(crate) fn map_handle(&self, v: Value) -> VmResult<GcRef> {
        match v {
            Value::Map(r) if self.is_live(r) => Ok(r),
            Value::Map(_) => Err(VmError::StaleReference),
            _ => Err(VmError::TypeMismatch { expected: "map", found: v.kind().name() }),
        }
    }

    pub(crate) fn map_obj_mut(&mut self, r: GcRef) -> VmResult<&mut ValueMap> {
        match self.object_mut(r) {
            Some(HeapObject::Map(m)) => Ok(m),
            _ => Err(VmError::StaleReference),
        }
    }

    fn map_writable(&mut self, v: Value) -> VmResult<GcRef> {
        let r = self.map_handle(v)?;
        if self.map_obj_mut(r)?.frozen {
            return Err(VmError::FrozenMutation { kind: "map" });
        }
        Ok(r)
    }

    fn find_slot(&self, m: &ValueMap, key: Value, hash: u32) -> Option<usize> {
        let mask = m.mask();
        let mut i = hash as usize & mask;
        for _ in 0..m.entries.len() {
            let e = &m.entries[i];
            if !e.occupied {
                return None;
            }
            if e.hash == hash && (e.key.identical(&key) || self.values_equal(e.key, key)) {
                return Some(i);
            }
            i = (i + 1) & mask;
        }
        None
    }

    pub fn map_count(&self, v: Value) -> usize {
        let Some(m) = self.map_ref(v) else { return 0 };
        m.count + m.vars.as_ref().map_or(0, |vars| self.assigned_aliases(vars).count())
    }

    pub fn map_capacity(&self, v: Value) -> usize {
        self.map_ref(v).map_or(0, |m| m.entries.len())
    }

    /// Number of times the table has been doubled.
    pub fn map_resize_count(&self, v: Value) -> u32 {
        self.map_ref(v).map_or(0, |m| m.resizes)
    }

    pub fn map_try_get(&self, v: Value, key: Value) -> Option<Value> {
        let m = self.map_ref(v)?;
        if let Some(vars) = &m.vars {
            if let Some(reg) = self.alias_register(vars, key) {
                return self.registers.assigned(reg);
            }
        }
        if m.count == 0 {
            return None;
        }
        let hash = self.hash_value(key);
        self.find_slot(m, key, hash).map(|i| m.entries[i].value)
    }

    /// Value for `key`, or null when absent.
    pub fn map_get(&self, v: Value, key: Value) -> Value {
        self.map_try_get(v, key).unwrap_or_default()
    }

    pub fn map_has_key(&self, v: Value, key: Value) -> bool {
        self.map_try_get(v, key).is_some()
    }

    pub fn map_set(&mut self, v: Value, key: Value, value: Value) -> VmResult<()> {
        let r = self.map_writable(v)?;
        if let Some(reg) = self.map_ref(v).and_then(|m| m.vars.as_ref()).and_then(|vars| self.alias_register(vars, key)) {
            self.registers.assign(reg, key, value);
            return Ok(());
        }
        self.map_store(r, key, value)
    }

    /// Set in the ordinary slots, bypassing register aliases.
    pub(crate) fn map_store(&mut self, r: GcRef, key: Value, value: Value) -> VmResult<()> {
        let hash = self.hash_value(key);
        let existing = match self.object(r) {
            Some(HeapObject::Map(m)) => self.find_slot(m, key, hash),
            _ => return Err(VmError::StaleReference),
        };
        let m = self.map_obj_mut(r)?;
        if let Some(i) = existing {
            m.entries[i].value = value;
            return Ok(());
        }
        let grew = m.needs_growth();
        if grew {
            m.grow();
        }
        m.raw_insert(MapEntry { key, value, hash, occupied: true });
        m.count += 1;
        if grew {
            self.reaccount(r);
        }
        Ok(())
    }

    /// Remove `key`; `false` when it was absent.
    pub fn map_remove(&mut self, v: Value, key: Value) -> VmResult<bool> {
        let r = self.map_writable(v)?;
        if let Some(reg) = self.map_ref(v).and_then(|m| m.vars.as_ref()).and_then(|vars| self.alias_register(vars, key)) {
            return Ok(self.registers.unassign(reg));
        }
        let hash = self.hash_value(key);
        let found = match self.object(r) {
            Some(HeapObject::Map(m)) if m.count > 0 => self.find_slot(m, key, hash),
            _ => None,
        };
        match found {
            Some(i) => {
                self.map_obj_mut(r)?.remove_at(i);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn map_clear(&mut self, v: Value) -> VmResult<()> {
        let r = self.map_writable(v)?;
        if let Some(vars) = self.map_ref(v).and_then(|m| m.vars.as_ref()) {
            let regs = vars.regs.clone();
            for reg in regs {
                self.registers.unassign(reg);
            }
        }
        let m = self.map_obj_mut(r)?;
        m.entries.iter_mut().for_each(|e| *e = MapEntry::default());
        m.count = 0;
        Ok(())
    }

    /// All entries in iteration order: assigned register aliases first,
    /// then ordinary slots in table order.
    pub fn map_entries(&self, v: Value) -> Vec<(Value, Value)> {
        let Some(m) = self.map_ref(v) else { return Vec::new() };
        let mut out = Vec::with_capacity(m.count);
        if let Some(vars) = &m.vars {
            out.extend(self.assigned_aliases(vars));
        }
        out.extend(m.slot_entries().map(|e| (e.key, e.value)));
        out
    }

    /// The `n`th entry in iteration order.
    pub fn map_nth_entry(&self, v: Value, n: usize) -> Option<(Value, Value)> {
        let m = self.map_ref(v)?;
        let aliased = m.vars.as_ref().map(|vars| self.assigned_aliases(vars).collect::<Vec<_>>()).unwrap_or_default();
        if n < aliased.len() {
            return Some(aliased[n]);
        }
        m.slot_entries().nth(n - aliased.len()).map(|e| (e.key, e.value))
    }

    pub fn map_keys(&mut self, v: Value) -> VmResult<Value> {
        let keys = self.map_entries(v).into_iter().map(|(k, _)| k).collect();
        self.list_from(keys)
    }

    pub fn map_values(&mut self, v: Value) -> VmResult<Value> {
        let values = self.map_entries(v).into_iter().map(|(_, x)| x).collect();
        self.list_from(values)
    }

    /// Shallow copy as an ordinary (non-aliased, unfrozen) map.
    pub fn map_copy(&mut self, v: Value) -> VmResult<Value> {
        let entries = self.map_entries(v);
        let capacity = (entries.len() * 4).div_ceil(3) + 1;
        let out = self.new_map(capacity)?;
        let r = self.map_handle(out)?;
        for (k, x) in entries {
            self.map_store(r, k, x)?;
        }
        Ok(out)
    }

    /// Look `key` up along the `__isa` chain. Returns the value and the
    /// `__isa` of the map that held it (the `super` of a method call).
    pub fn map_lookup_with_origin(&self, v: Value, key: Value) -> Option<(Value, Value)> {
        let isa = isa_key();
        let mut current = v;
        for _ in 0..MAX_ISA_DEPTH {
            if let Some(found) = self.map_try_get(current, key) {
                return Some((found, self.map_get(current, isa)));
            }
            match self.map_try_get(current, isa) {
                Some(next) if next.is_map() => current = next,
                _ => return None,
            }
        }
        None
    }

    /// Value for `key` on `v` or anything it inherits from.
    pub fn map_lookup(&self, v: Value, key: Value) -> Option<Value> {
        self.map_lookup_with_origin(v, key).map(|(found, _)| found)
    }
}
