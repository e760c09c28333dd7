//! Stop-the-world mark-sweep heap.
//!
//! Objects live in a slot table addressed by generation-checked [`GcRef`]
//! handles. A collection marks from four root sources:
//!
//! - the shadow stack of protected values ([`Heap::protect`], [`RootScope`])
//! - persistent roots ([`Heap::add_root`])
//! - the VM register file and its parallel names array, owned by the heap
//!   so that VarMaps can alias it
//! - registered mark callbacks
//!
//! and then frees every unmarked, non-immortal slot. Interned strings are
//! immortal and never counted against the collection threshold.

mod intern;
mod roots;

use std::mem::size_of;

use log::debug;

pub use intern::INTERN_THRESHOLD;
pub use roots::{CallbackId, MarkCallback, RootId, RootScope, Tracer};

use crate::collections::{RegisterFile, ValueList, ValueMap};
use crate::error::{VmError, VmResult};
use crate::value::{FuncRefData, StringStorage, TinyStr, Value};

/// Generation-checked handle to a heap slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcRef {
    index: u32,
    generation: u32,
}

impl GcRef {
    pub fn index(&self) -> u32 {
        self.index
    }
}

pub(crate) enum HeapObject {
    Str(StringStorage),
    List(ValueList),
    Map(ValueMap),
    FuncRef(FuncRefData),
}

impl HeapObject {
    fn estimated_bytes(&self) -> usize {
        size_of::<HeapObject>()
            + match self {
                HeapObject::Str(s) => s.byte_len(),
                HeapObject::List(l) => l.heap_bytes(),
                HeapObject::Map(m) => m.heap_bytes(),
                HeapObject::FuncRef(_) => 0,
            }
    }

    fn trace(&self, tracer: &mut Tracer<'_>) {
        match self {
            HeapObject::Str(_) => {}
            HeapObject::List(l) => l.trace(tracer),
            HeapObject::Map(m) => m.trace(tracer),
            HeapObject::FuncRef(f) => tracer.mark_value(f.outer_vars),
        }
    }
}

pub(crate) struct Slot {
    object: Option<HeapObject>,
    generation: u32,
    bytes: usize,
    immortal: bool,
}

// ── Configuration & stats ───────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Bytes allocated before the first automatic collection.
    pub initial_threshold: usize,
    /// Hard limit; exceeding it after a forced collection is out-of-memory.
    pub max_bytes: Option<usize>,
    /// Collect before every allocation.
    pub stress: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig { initial_threshold: 1024 * 1024, max_bytes: None, stress: false }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcStats {
    pub bytes_allocated: usize,
    pub threshold: usize,
    pub collections: u64,
    pub live_objects: usize,
    pub root_count: usize,
    pub interned_strings: usize,
    pub enabled: bool,
}

// ── Heap ────────────────────────────────────────────────────────────

pub struct Heap {
    config: GcConfig,
    slots: Vec<Slot>,
    marks: Vec<bool>,
    free_list: Vec<u32>,
    worklist: Vec<GcRef>,
    live: usize,
    bytes_allocated: usize,
    threshold: usize,
    disable_count: u32,
    collections: u64,
    shadow: Vec<Value>,
    scopes: Vec<usize>,
    roots: Vec<Option<Value>>,
    root_free: Vec<u32>,
    callbacks: Vec<Option<MarkCallback>>,
    interner: intern::Interner,
    pub(crate) registers: RegisterFile,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let threshold = config.initial_threshold;
        Heap {
            config,
            slots: Vec::new(),
            marks: Vec::new(),
            free_list: Vec::new(),
            worklist: Vec::new(),
            live: 0,
            bytes_allocated: 0,
            threshold,
            disable_count: 0,
            collections: 0,
            shadow: Vec::new(),
            scopes: Vec::new(),
            roots: Vec::new(),
            root_free: Vec::new(),
            callbacks: Vec::new(),
            interner: intern::Interner::default(),
            registers: RegisterFile::default(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn set_stress(&mut self, on: bool) {
        self.config.stress = on;
    }

    // ── Allocation ──────────────────────────────────────────────────

    pub(crate) fn alloc(&mut self, object: HeapObject) -> VmResult<GcRef> {
        let bytes = object.estimated_bytes();
        if self.disable_count == 0 && (self.config.stress || self.bytes_allocated > self.threshold) {
            self.collect();
        }
        if let Some(limit) = self.config.max_bytes {
            if self.bytes_allocated + bytes > limit {
                self.collect();
                if self.bytes_allocated + bytes > limit {
                    return Err(VmError::OutOfMemory { requested: bytes });
                }
            }
        }
        self.bytes_allocated += bytes;
        Ok(self.install(object, bytes, false))
    }

    /// Allocate outside collector accounting; the object is never freed.
    pub(crate) fn alloc_immortal(&mut self, object: HeapObject) -> GcRef {
        self.install(object, 0, true)
    }

    fn install(&mut self, object: HeapObject, bytes: usize, immortal: bool) -> GcRef {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.bytes = bytes;
            slot.immortal = immortal;
            return GcRef { index, generation: slot.generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { object: Some(object), generation: 0, bytes, immortal });
        self.marks.push(false);
        GcRef { index, generation: 0 }
    }

    /// Recompute the byte charge of `r` after it grew or shrank in place.
    pub(crate) fn reaccount(&mut self, r: GcRef) {
        let Some(slot) = self.slots.get_mut(r.index as usize) else { return };
        if slot.immortal || slot.generation != r.generation {
            return;
        }
        let Some(object) = slot.object.as_ref() else { return };
        let now = object.estimated_bytes();
        self.bytes_allocated = self.bytes_allocated - slot.bytes + now;
        slot.bytes = now;
    }

    pub fn new_string(&mut self, s: &str) -> VmResult<Value> {
        if let Some(t) = TinyStr::new(s) {
            return Ok(Value::Tiny(t));
        }
        if s.len() < INTERN_THRESHOLD {
            return Ok(self.intern(s));
        }
        let r = self.alloc(HeapObject::Str(StringStorage::new(s)))?;
        Ok(Value::Str(r))
    }

    pub(crate) fn string_from(&mut self, s: String) -> VmResult<Value> {
        if s.len() < INTERN_THRESHOLD {
            return self.new_string(&s);
        }
        let r = self.alloc(HeapObject::Str(StringStorage::new(s)))?;
        Ok(Value::Str(r))
    }

    pub fn new_funcref(&mut self, func_index: usize, outer_vars: Value) -> VmResult<Value> {
        let r = self.alloc(HeapObject::FuncRef(FuncRefData { func_index, outer_vars }))?;
        Ok(Value::FuncRef(r))
    }

    pub fn funcref(&self, v: Value) -> Option<FuncRefData> {
        match v {
            Value::FuncRef(r) => match self.object(r)? {
                HeapObject::FuncRef(f) => Some(*f),
                _ => None,
            },
            _ => None,
        }
    }

    // ── Slot access ─────────────────────────────────────────────────

    pub(crate) fn object(&self, r: GcRef) -> Option<&HeapObject> {
        let slot = self.slots.get(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub(crate) fn object_mut(&mut self, r: GcRef) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_mut()
    }

    pub fn is_live(&self, r: GcRef) -> bool {
        self.object(r).is_some()
    }

    fn is_immortal(&self, r: GcRef) -> bool {
        self.slots
            .get(r.index as usize)
            .is_some_and(|s| s.generation == r.generation && s.immortal)
    }

    pub(crate) fn string_storage(&self, r: GcRef) -> Option<&StringStorage> {
        match self.object(r)? {
            HeapObject::Str(s) => Some(s),
            _ => None,
        }
    }

    // ── Collection ──────────────────────────────────────────────────

    pub fn disable(&mut self) {
        self.disable_count += 1;
    }

    pub fn enable(&mut self) {
        self.disable_count = self.disable_count.saturating_sub(1);
    }

    pub fn is_enabled(&self) -> bool {
        self.disable_count == 0
    }

    /// Run a full collection. Returns the number of bytes freed; a no-op
    /// while collection is disabled.
    pub fn collect(&mut self) -> usize {
        if self.disable_count > 0 {
            return 0;
        }
        self.mark();
        let (freed, objects) = self.sweep();
        self.collections += 1;
        if freed < self.threshold / 4 {
            self.threshold = self.threshold.saturating_mul(2);
        }
        debug!(
            "gc: freed {} bytes ({} objects), {} bytes remaining, threshold now {}",
            freed, objects, self.bytes_allocated, self.threshold
        );
        freed
    }

    fn mark(&mut self) {
        let mut tracer = Tracer { slots: &self.slots, marks: &mut self.marks, worklist: &mut self.worklist };
        for &v in &self.shadow {
            tracer.mark_value(v);
        }
        for v in self.roots.iter().flatten() {
            tracer.mark_value(*v);
        }
        self.registers.trace(&mut tracer);
        for callback in self.callbacks.iter().flatten() {
            callback(&mut tracer);
        }
        let slots = tracer.slots;
        while let Some(r) = tracer.worklist.pop() {
            if let Some(object) = slots[r.index as usize].object.as_ref() {
                object.trace(&mut tracer);
            }
        }
    }

    fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0;
        let mut objects = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let marked = std::mem::replace(&mut self.marks[i], false);
            if marked || slot.immortal || slot.object.is_none() {
                continue;
            }
            slot.object = None;
            slot.generation = slot.generation.wrapping_add(1);
            freed += slot.bytes;
            slot.bytes = 0;
            objects += 1;
            self.free_list.push(i as u32);
        }
        self.bytes_allocated -= freed;
        self.live -= objects;
        (freed, objects)
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            bytes_allocated: self.bytes_allocated,
            threshold: self.threshold,
            collections: self.collections,
            live_objects: self.live,
            root_count: self.root_count(),
            interned_strings: self.interner.len(),
            enabled: self.is_enabled(),
        }
    }

    // ── Register file ───────────────────────────────────────────────

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }
}
