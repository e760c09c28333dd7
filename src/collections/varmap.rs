//! VarMaps: maps whose entries for some keys live in the VM register file.
//!
//! A VarMap is an ordinary [`ValueMap`](super::ValueMap) plus a side table
//! of `key -> register index`. While the frame that owns those registers is
//! live, reads and writes of an aliased key go straight to the register; a
//! register whose name is null counts as "not assigned". Before the frame
//! is torn down the VM calls [`Heap::varmap_gather`], which copies every
//! assigned alias into ordinary slots and drops the side table.

use super::map::ValueMap;
use crate::error::VmResult;
use crate::gc::{Heap, HeapObject, Tracer};
use crate::value::Value;

/// The VM value stack and its parallel array of variable names.
#[derive(Debug, Default)]
pub struct RegisterFile {
    pub(crate) values: Vec<Value>,
    pub(crate) names: Vec<Value>,
}

impl RegisterFile {
    pub fn resize(&mut self, slots: usize) {
        self.values.resize(slots, Value::Null);
        self.names.resize(slots, Value::Null);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Value {
        self.values.get(index).copied().unwrap_or_default()
    }

    pub fn name(&self, index: usize) -> Value {
        self.names.get(index).copied().unwrap_or_default()
    }

    pub fn set_value(&mut self, index: usize, v: Value) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = v;
        }
    }

    pub fn set_name(&mut self, index: usize, name: Value) {
        if let Some(slot) = self.names.get_mut(index) {
            *slot = name;
        }
    }

    /// Value of a register if its name marks it assigned.
    pub(crate) fn assigned(&self, index: usize) -> Option<Value> {
        match self.names.get(index) {
            Some(n) if !n.is_null() => Some(self.value(index)),
            _ => None,
        }
    }

    pub(crate) fn assign(&mut self, index: usize, name: Value, v: Value) {
        self.set_value(index, v);
        self.set_name(index, name);
    }

    /// Clear the assigned flag; `true` when it was set.
    pub(crate) fn unassign(&mut self, index: usize) -> bool {
        let was = self.assigned(index).is_some();
        self.set_name(index, Value::Null);
        was
    }

    pub(crate) fn trace(&self, tracer: &mut Tracer<'_>) {
        for (&v, &n) in self.values.iter().zip(&self.names) {
            tracer.mark_value(v);
            tracer.mark_value(n);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct VarMapData {
    pub(crate) keys: Vec<Value>,
    pub(crate) regs: Vec<usize>,
}

impl Heap {
    /// Create a VarMap over registers `base..base+count`, aliasing every
    /// register that currently has a name.
    pub fn new_varmap(&mut self, base: usize, count: usize) -> VmResult<Value> {
        let mut vars = VarMapData::default();
        for reg in base..(base + count).min(self.registers.len()) {
            let name = self.registers.name(reg);
            if !name.is_null() {
                vars.keys.push(name);
                vars.regs.push(reg);
            }
        }
        let mut map = ValueMap::with_capacity(0);
        map.vars = Some(vars);
        let r = self.alloc(HeapObject::Map(map))?;
        Ok(Value::Map(r))
    }

    pub fn is_varmap(&self, v: Value) -> bool {
        self.map_ref(v).is_some_and(|m| m.vars.is_some())
    }

    /// Alias `name` to register `reg` unless the name is already aliased.
    pub fn varmap_map_to_register(&mut self, map: Value, name: Value, reg: usize) -> VmResult<()> {
        let r = self.map_handle(map)?;
        let already = match self.map_ref(map).and_then(|m| m.vars.as_ref()) {
            Some(vars) => self.alias_register(vars, name).is_some(),
            None => return Ok(()),
        };
        if already {
            return Ok(());
        }
        if let Some(vars) = self.map_obj_mut(r)?.vars.as_mut() {
            vars.keys.push(name);
            vars.regs.push(reg);
        }
        self.reaccount(r);
        Ok(())
    }

    /// Copy every assigned alias into ordinary storage and stop aliasing.
    /// Afterwards the map is independent of the register file.
    pub fn varmap_gather(&mut self, map: Value) -> VmResult<()> {
        let r = self.map_handle(map)?;
        let Some(vars) = self.map_obj_mut(r)?.vars.take() else { return Ok(()) };
        for (&key, &reg) in vars.keys.iter().zip(&vars.regs) {
            if let Some(v) = self.registers.assigned(reg) {
                self.map_store(r, key, v)?;
            }
        }
        self.reaccount(r);
        Ok(())
    }

    pub(crate) fn alias_register(&self, vars: &VarMapData, key: Value) -> Option<usize> {
        vars.keys
            .iter()
            .position(|k| k.identical(&key) || (k.is_string() && key.is_string() && self.values_equal(*k, key)))
            .map(|i| vars.regs[i])
    }

    pub(crate) fn assigned_aliases<'a>(&'a self, vars: &'a VarMapData) -> impl Iterator<Item = (Value, Value)> + 'a {
        vars.keys
            .iter()
            .zip(&vars.regs)
            .filter_map(|(&k, &reg)| self.registers.assigned(reg).map(|v| (k, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(heap: &mut Heap) -> (Value, Value) {
        heap.registers_mut().resize(16);
        let x = heap.new_string("x").unwrap();
        let y = heap.new_string("y").unwrap();
        heap.registers_mut().assign(4, x, Value::Int(10));
        heap.registers_mut().assign(5, y, Value::Int(20));
        (x, y)
    }

    #[test]
    fn reads_and_writes_go_through_registers() {
        let mut heap = Heap::new();
        let (x, y) = setup(&mut heap);
        let vm = heap.new_varmap(3, 4).unwrap();
        assert!(heap.is_varmap(vm));
        assert_eq!(heap.map_count(vm), 2);
        assert_eq!(heap.map_get(vm, x), Value::Int(10));

        heap.map_set(vm, y, Value::Int(99)).unwrap();
        assert_eq!(heap.registers().value(5), Value::Int(99));

        heap.registers_mut().set_value(4, Value::Int(11));
        assert_eq!(heap.map_get(vm, x), Value::Int(11));
    }

    #[test]
    fn remove_clears_assigned_flag() {
        let mut heap = Heap::new();
        let (x, _) = setup(&mut heap);
        let vm = heap.new_varmap(0, 16).unwrap();
        assert!(heap.map_remove(vm, x).unwrap());
        assert!(!heap.map_has_key(vm, x));
        assert!(heap.registers().name(4).is_null());
        assert_eq!(heap.map_count(vm), 1);
        heap.map_set(vm, x, Value::Int(1)).unwrap();
        assert_eq!(heap.registers().name(4), x);
    }

    #[test]
    fn ordinary_keys_coexist_with_aliases() {
        let mut heap = Heap::new();
        let (x, _) = setup(&mut heap);
        let vm = heap.new_varmap(0, 16).unwrap();
        let z = heap.new_string("z").unwrap();
        heap.map_set(vm, z, Value::Int(3)).unwrap();
        assert_eq!(heap.map_count(vm), 3);
        let keys: Vec<Value> = heap.map_entries(vm).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys[0], x);
        assert_eq!(keys[2], z);
    }

    #[test]
    fn gather_detaches_from_registers() {
        let mut heap = Heap::new();
        let (x, y) = setup(&mut heap);
        let vm = heap.new_varmap(0, 16).unwrap();
        heap.map_remove(vm, y).unwrap();
        heap.varmap_gather(vm).unwrap();
        assert!(!heap.is_varmap(vm));

        heap.registers_mut().assign(4, x, Value::Int(-1));
        assert_eq!(heap.map_get(vm, x), Value::Int(10));
        assert!(!heap.map_has_key(vm, y));
        assert_eq!(heap.map_count(vm), 1);
    }

    #[test]
    fn late_alias_registration() {
        let mut heap = Heap::new();
        heap.registers_mut().resize(8);
        let vm = heap.new_varmap(0, 8).unwrap();
        let w = heap.new_string("w").unwrap();
        heap.varmap_map_to_register(vm, w, 2).unwrap();
        heap.varmap_map_to_register(vm, w, 3).unwrap();
        heap.registers_mut().assign(2, w, Value::Int(7));
        assert_eq!(heap.map_get(vm, w), Value::Int(7));
    }

    #[test]
    fn captured_values_survive_collection_after_gather() {
        let mut heap = Heap::new();
        heap.registers_mut().resize(4);
        let name = heap.new_string("data").unwrap();
        let list = heap.list_from(vec![Value::Int(1)]).unwrap();
        heap.registers_mut().assign(1, name, list);
        let vm = heap.new_varmap(0, 4).unwrap();
        let root = heap.add_root(vm);
        heap.varmap_gather(vm).unwrap();
        heap.registers_mut().assign(1, Value::Null, Value::Null);
        heap.collect();
        let kept = heap.map_get(vm, name);
        assert_eq!(heap.list_count(kept), 1);
        heap.remove_root(root);
    }
}
