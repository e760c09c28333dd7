//! Built-in type maps, `isa` and method dispatch.

use super::{core_intrinsics, Vm};
use crate::collections::{isa_key, MAX_ISA_DEPTH};
use crate::error::{VmError, VmResult};
use crate::value::{Value, ValueKind};

/// Root slot of the type map for `kind`. Ints and doubles share `number`.
pub(super) fn slot(kind: ValueKind) -> Option<usize> {
    match kind {
        ValueKind::Int | ValueKind::Double => Some(0),
        ValueKind::String => Some(1),
        ValueKind::List => Some(2),
        ValueKind::Map => Some(3),
        ValueKind::FuncRef => Some(4),
        ValueKind::Null => None,
    }
}

impl Vm {
    /// Append the intrinsics to the function table and rebuild the
    /// intrinsics map and the type maps.
    pub(super) fn install_intrinsics(&mut self) -> VmResult<()> {
        let mut scope = self.heap.scope();
        let table = scope.new_map(64)?;
        scope.protect(table);
        let mut type_maps = [Value::Null; 5];
        for t in type_maps.iter_mut() {
            *t = scope.new_map(16)?;
            scope.protect(*t);
        }

        for intrinsic in core_intrinsics() {
            let def = intrinsic.build_funcdef(&mut scope);
            let index = self.functions.len();
            self.functions.push(def);
            let name = scope.intern(intrinsic.name());
            let f = scope.new_funcref(index, Value::Null)?;
            scope.map_set(table, name, f)?;
            for &kind in intrinsic.methods() {
                if let Some(i) = slot(kind) {
                    scope.map_set(type_maps[i], name, f)?;
                }
            }
        }

        scope.set_root(self.intrinsics_root, table);
        for (&id, &map) in self.type_roots.iter().zip(&type_maps) {
            scope.set_root(id, map);
        }
        Ok(())
    }

    /// `a isa b`: identity, the built-in type map of `a`, or anywhere on
    /// `a`'s `__isa` chain.
    pub fn isa(&self, a: Value, b: Value) -> bool {
        if a.identical(&b) {
            return true;
        }
        let builtin = self.type_map(a.kind());
        if !builtin.is_null() && builtin.identical(&b) {
            return true;
        }
        let key = isa_key();
        let mut current = a;
        for _ in 0..MAX_ISA_DEPTH {
            match self.heap.map_try_get(current, key) {
                Some(next) if next.identical(&b) => return true,
                Some(next) => current = next,
                None => break,
            }
        }
        false
    }

    /// METHFIND: `key` on `container`'s `__isa` chain, then in the type
    /// map of its kind. A hit stages `container` as the pending self.
    /// Lists and strings fall back to plain indexing.
    pub(super) fn find_method(&mut self, container: Value, key: Value) -> VmResult<Value> {
        if container.is_map() {
            if let Some((found, origin_isa)) = self.heap.map_lookup_with_origin(container, key) {
                self.set_pending(Some((container, origin_isa)));
                return Ok(found);
            }
        }
        if let Some(found) = self.heap.map_try_get(self.type_map(container.kind()), key) {
            self.set_pending(Some((container, Value::Null)));
            return Ok(found);
        }
        match container {
            Value::Map(_) => Err(VmError::KeyNotFound { key: self.heap.to_display(key) }),
            Value::List(_) => self.heap.list_get(container, key.as_int()),
            Value::Tiny(_) | Value::Str(_) => self.heap.string_char_at(container, key.as_int()),
            _ => Err(VmError::NotIndexable { container: self.heap.repr(container) }),
        }
    }
}
