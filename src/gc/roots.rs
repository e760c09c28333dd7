use std::ops::{Deref, DerefMut};

use super::{GcRef, Heap, Slot};
use crate::value::Value;

/// Handle to a persistent root slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootId(pub(super) u32);

/// Handle to a registered mark callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(pub(super) u32);

pub type MarkCallback = Box<dyn Fn(&mut Tracer<'_>)>;

/// Marking state handed to root sources during a collection.
pub struct Tracer<'a> {
    pub(super) slots: &'a [Slot],
    pub(super) marks: &'a mut [bool],
    pub(super) worklist: &'a mut Vec<GcRef>,
}

impl Tracer<'_> {
    pub fn mark_value(&mut self, v: Value) {
        if let Some(r) = v.heap_ref() {
            self.mark_ref(r);
        }
    }

    pub fn mark_ref(&mut self, r: GcRef) {
        let i = r.index as usize;
        let Some(slot) = self.slots.get(i) else { return };
        if slot.generation != r.generation || slot.object.is_none() || self.marks[i] {
            return;
        }
        self.marks[i] = true;
        self.worklist.push(r);
    }
}

/// Guard for a protection scope: every value protected through it is
/// released when the guard drops.
pub struct RootScope<'h> {
    heap: &'h mut Heap,
}

impl<'h> RootScope<'h> {
    pub(super) fn new(heap: &'h mut Heap) -> Self {
        heap.push_scope();
        RootScope { heap }
    }
}

impl Deref for RootScope<'_> {
    type Target = Heap;

    fn deref(&self) -> &Heap {
        self.heap
    }
}

impl DerefMut for RootScope<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        self.heap
    }
}

impl Drop for RootScope<'_> {
    fn drop(&mut self) {
        self.heap.pop_scope();
    }
}

impl Heap {
    // ── Shadow stack ────────────────────────────────────────────────

    /// Root `v` until the matching [`unprotect`](Heap::unprotect) or the
    /// end of the enclosing scope.
    pub fn protect(&mut self, v: Value) {
        self.shadow.push(v);
    }

    pub fn unprotect(&mut self) -> Option<Value> {
        let floor = self.scopes.last().copied().unwrap_or(0);
        if self.shadow.len() > floor { self.shadow.pop() } else { None }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(self.shadow.len());
    }

    pub fn pop_scope(&mut self) {
        if let Some(start) = self.scopes.pop() {
            self.shadow.truncate(start);
        }
    }

    /// Open a protection scope that closes when the guard drops.
    pub fn scope(&mut self) -> RootScope<'_> {
        RootScope::new(self)
    }

    pub fn protected_count(&self) -> usize {
        self.shadow.len()
    }

    // ── Persistent roots ────────────────────────────────────────────

    pub fn add_root(&mut self, v: Value) -> RootId {
        if let Some(id) = self.root_free.pop() {
            self.roots[id as usize] = Some(v);
            return RootId(id);
        }
        self.roots.push(Some(v));
        RootId(self.roots.len() as u32 - 1)
    }

    pub fn set_root(&mut self, id: RootId, v: Value) {
        if let Some(slot) = self.roots.get_mut(id.0 as usize) {
            *slot = Some(v);
        }
    }

    pub fn root(&self, id: RootId) -> Value {
        self.roots.get(id.0 as usize).copied().flatten().unwrap_or_default()
    }

    pub fn remove_root(&mut self, id: RootId) {
        if let Some(slot) = self.roots.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.root_free.push(id.0);
            }
        }
    }

    // ── Mark callbacks ──────────────────────────────────────────────

    pub fn register_mark_callback(&mut self, callback: MarkCallback) -> CallbackId {
        self.callbacks.push(Some(callback));
        CallbackId(self.callbacks.len() as u32 - 1)
    }

    pub fn unregister_mark_callback(&mut self, id: CallbackId) -> bool {
        match self.callbacks.get_mut(id.0 as usize) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    pub(super) fn root_count(&self) -> usize {
        self.shadow.len()
            + self.roots.iter().filter(|r| r.is_some()).count()
            + self.callbacks.iter().filter(|c| c.is_some()).count()
    }
}
