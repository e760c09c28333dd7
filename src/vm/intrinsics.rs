//! Built-in functions.
//!
//! Each intrinsic is an ordinary [`FuncDef`] whose body is a [`NativeFn`].
//! `reset` appends them after the program's own functions, publishes them
//! by name, and files the ones that act as methods under the matching
//! built-in type maps.

use super::Vm;
use crate::bytecode::{FuncDef, NativeFn};
use crate::error::{VmError, VmResult};
use crate::gc::Heap;
use crate::value::{TinyStr, Value, ValueKind};

/// What a native callback sees of the VM: its argument window plus the
/// heap and host I/O.
pub struct NativeContext<'a> {
    vm: &'a mut Vm,
    base: usize,
}

impl<'a> NativeContext<'a> {
    pub(super) fn new(vm: &'a mut Vm, base: usize) -> Self {
        NativeContext { vm, base }
    }

    /// Parameter `index` (0-based); register `index + 1` of the window.
    pub fn arg(&self, index: usize) -> Value {
        self.vm.heap.registers.value(self.base + 1 + index)
    }

    pub fn heap(&self) -> &Heap {
        &self.vm.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.vm.heap
    }

    pub fn vm(&mut self) -> &mut Vm {
        &mut *self.vm
    }

    pub fn print(&mut self, text: &str) {
        (self.vm.print)(text)
    }

    pub fn input(&mut self, prompt: &str) -> String {
        (self.vm.input)(prompt)
    }

    pub fn type_map(&self, kind: ValueKind) -> Value {
        self.vm.type_map(kind)
    }
}

/// Builder for a native function definition.
pub struct Intrinsic {
    name: &'static str,
    params: Vec<(&'static str, Value)>,
    methods: Vec<ValueKind>,
    code: NativeFn,
}

impl Intrinsic {
    pub fn create(name: &'static str, code: NativeFn) -> Self {
        Intrinsic { name, params: Vec::new(), methods: Vec::new(), code }
    }

    /// Add a parameter; a null default makes it required.
    pub fn param(mut self, name: &'static str, default: Value) -> Self {
        self.params.push((name, default));
        self
    }

    /// File this intrinsic under the type maps of `kinds`.
    pub fn method_of(mut self, kinds: &[ValueKind]) -> Self {
        self.methods.extend_from_slice(kinds);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn methods(&self) -> &[ValueKind] {
        &self.methods
    }

    pub fn build_funcdef(&self, heap: &mut Heap) -> FuncDef {
        let mut def = FuncDef::new(self.name);
        for &(name, default) in &self.params {
            def.param_names.push(heap.intern(name));
            def.param_defaults.push(default);
        }
        def.max_regs = self.params.len() as u16 + 1;
        def.native = Some(self.code);
        def
    }
}

fn tiny(s: &str) -> Value {
    TinyStr::new(s).map_or(Value::Null, Value::Tiny)
}

const SEQUENCES: &[ValueKind] = &[ValueKind::List, ValueKind::String, ValueKind::Map];
const LISTS: &[ValueKind] = &[ValueKind::List];
const STRINGS: &[ValueKind] = &[ValueKind::String];
const LISTS_AND_MAPS: &[ValueKind] = &[ValueKind::List, ValueKind::Map];

/// Every intrinsic, in function-table order.
pub fn core_intrinsics() -> Vec<Intrinsic> {
    vec![
        Intrinsic::create("print", print).param("s", tiny("")),
        Intrinsic::create("input", input).param("prompt", tiny("")),
        Intrinsic::create("val", val).param("x", Value::Int(0)),
        Intrinsic::create("str", to_str).param("x", tiny("")),
        Intrinsic::create("len", len).param("self", Value::Null).method_of(SEQUENCES),
        Intrinsic::create("remove", remove)
            .param("self", Value::Null)
            .param("k", Value::Null)
            .method_of(SEQUENCES),
        Intrinsic::create("freeze", freeze).param("x", Value::Null),
        Intrinsic::create("isFrozen", is_frozen).param("x", Value::Null),
        Intrinsic::create("frozenCopy", frozen_copy).param("x", Value::Null),
        Intrinsic::create("push", push)
            .param("self", Value::Null)
            .param("v", Value::Null)
            .method_of(LISTS_AND_MAPS),
        Intrinsic::create("pop", pop).param("self", Value::Null).method_of(LISTS_AND_MAPS),
        Intrinsic::create("pull", pull).param("self", Value::Null).method_of(LISTS_AND_MAPS),
        Intrinsic::create("insert", insert)
            .param("self", Value::Null)
            .param("i", Value::Null)
            .param("v", Value::Null)
            .method_of(&[ValueKind::List, ValueKind::String]),
        Intrinsic::create("indexOf", index_of)
            .param("self", Value::Null)
            .param("x", Value::Null)
            .method_of(SEQUENCES),
        Intrinsic::create("hasIndex", has_index)
            .param("self", Value::Null)
            .param("i", Value::Null)
            .method_of(SEQUENCES),
        Intrinsic::create("indexes", indexes).param("self", Value::Null).method_of(SEQUENCES),
        Intrinsic::create("values", values).param("self", Value::Null).method_of(SEQUENCES),
        Intrinsic::create("sort", sort)
            .param("self", Value::Null)
            .param("byKey", Value::Null)
            .method_of(LISTS),
        Intrinsic::create("join", join)
            .param("self", Value::Null)
            .param("delim", tiny(" "))
            .method_of(LISTS),
        Intrinsic::create("upper", upper).param("self", Value::Null).method_of(STRINGS),
        Intrinsic::create("lower", lower).param("self", Value::Null).method_of(STRINGS),
        Intrinsic::create("trim", trim).param("self", Value::Null).method_of(STRINGS),
        Intrinsic::create("split", split)
            .param("self", Value::Null)
            .param("delim", tiny(" "))
            .method_of(STRINGS),
        Intrinsic::create("replace", replace)
            .param("self", Value::Null)
            .param("old", Value::Null)
            .param("new", Value::Null)
            .method_of(SEQUENCES),
        Intrinsic::create("slice", slice)
            .param("self", Value::Null)
            .param("from", Value::Int(0))
            .param("to", Value::Null)
            .method_of(&[ValueKind::List, ValueKind::String]),
        Intrinsic::create("number", |ctx| Ok(ctx.type_map(ValueKind::Double))),
        Intrinsic::create("string", |ctx| Ok(ctx.type_map(ValueKind::String))),
        Intrinsic::create("list", |ctx| Ok(ctx.type_map(ValueKind::List))),
        Intrinsic::create("map", |ctx| Ok(ctx.type_map(ValueKind::Map))),
        Intrinsic::create("funcRef", |ctx| Ok(ctx.type_map(ValueKind::FuncRef))),
    ]
}

fn type_error(expected: &'static str, found: Value) -> VmError {
    VmError::TypeMismatch { expected, found: found.kind().name() }
}

fn flag(b: bool) -> Value {
    if b { Value::TRUE } else { Value::FALSE }
}

fn print(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let text = ctx.heap().to_display(ctx.arg(0));
    ctx.print(&text);
    Ok(Value::Null)
}

fn input(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let prompt = ctx.arg(0);
    let prompt = if prompt.is_null() { String::new() } else { ctx.heap().to_display(prompt) };
    let line = ctx.input(&prompt);
    ctx.heap_mut().new_string(&line)
}

fn val(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    Ok(ctx.heap().to_number(ctx.arg(0)))
}

fn to_str(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let x = ctx.arg(0);
    ctx.heap_mut().to_string_value(x)
}

fn len(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let x = ctx.arg(0);
    let heap = ctx.heap();
    let n = match x {
        Value::List(_) => heap.list_count(x),
        Value::Map(_) => heap.map_count(x),
        Value::Tiny(_) | Value::Str(_) => heap.string_len(x),
        _ => return Err(VmError::NoLength { container: heap.repr(x) }),
    };
    Ok(Value::Int(n as i32))
}

fn remove(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, k) = (ctx.arg(0), ctx.arg(1));
    let heap = ctx.heap_mut();
    match this {
        Value::List(_) => Ok(flag(heap.list_remove(this, k.as_int())?)),
        Value::Map(_) => Ok(flag(heap.map_remove(this, k)?)),
        Value::Tiny(_) | Value::Str(_) => {
            let Some(at) = heap.string_index_of(this, k, 0) else { return Ok(this) };
            let cut = heap.string_len(k) as i32;
            let mut scope = heap.scope();
            let head = scope.string_substring(this, 0, at as i32)?;
            scope.protect(head);
            let tail = scope.string_slice(this, at as i32 + cut, i32::MAX)?;
            scope.protect(tail);
            scope.string_concat(head, tail)
        }
        _ => Err(type_error("list, map or string", this)),
    }
}

fn freeze(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let x = ctx.arg(0);
    ctx.heap_mut().freeze(x);
    Ok(Value::Null)
}

fn is_frozen(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    Ok(flag(ctx.heap().is_frozen(ctx.arg(0))))
}

fn frozen_copy(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let x = ctx.arg(0);
    ctx.heap_mut().frozen_copy(x)
}

fn push(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, v) = (ctx.arg(0), ctx.arg(1));
    let heap = ctx.heap_mut();
    match this {
        Value::List(_) => heap.list_push(this, v)?,
        Value::Map(_) => heap.map_set(this, v, Value::TRUE)?,
        _ => return Err(type_error("list or map", this)),
    }
    Ok(this)
}

/// First key of a map, removed.
fn take_first_key(heap: &mut Heap, map: Value) -> VmResult<Value> {
    match heap.map_nth_entry(map, 0) {
        Some((key, _)) => {
            heap.protect(key);
            let removed = heap.map_remove(map, key);
            heap.unprotect();
            removed?;
            Ok(key)
        }
        None => Ok(Value::Null),
    }
}

fn pop(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let this = ctx.arg(0);
    let heap = ctx.heap_mut();
    match this {
        Value::List(_) => heap.list_pop(this),
        Value::Map(_) => take_first_key(heap, this),
        _ => Ok(Value::Null),
    }
}

fn pull(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let this = ctx.arg(0);
    let heap = ctx.heap_mut();
    match this {
        Value::List(_) => heap.list_pull(this),
        Value::Map(_) => take_first_key(heap, this),
        _ => Ok(Value::Null),
    }
}

fn insert(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, i, v) = (ctx.arg(0), ctx.arg(1), ctx.arg(2));
    let heap = ctx.heap_mut();
    match this {
        Value::List(_) => {
            heap.list_insert(this, i.as_int(), v)?;
            Ok(this)
        }
        Value::Tiny(_) | Value::Str(_) => {
            let len = heap.string_len(this) as i32;
            let mut at = i.as_int();
            if at < 0 {
                at += len + 1;
            }
            if at < 0 || at > len {
                return Err(VmError::IndexOutOfRange { index: i.as_int(), len: len as usize });
            }
            let text = heap.to_display(this);
            let split = text.char_indices().nth(at as usize).map_or(text.len(), |(b, _)| b);
            let joined = format!("{}{}{}", &text[..split], heap.to_display(v), &text[split..]);
            heap.new_string(&joined)
        }
        _ => Err(type_error("list or string", this)),
    }
}

fn index_of(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, x) = (ctx.arg(0), ctx.arg(1));
    let heap = ctx.heap();
    let found = match this {
        Value::List(_) => heap.list_index_of(this, x, 0).map(|i| Value::Int(i as i32)),
        Value::Tiny(_) | Value::Str(_) => heap.string_index_of(this, x, 0).map(|i| Value::Int(i as i32)),
        Value::Map(_) => heap.map_entries(this).into_iter().find(|&(_, v)| heap.values_equal(v, x)).map(|(k, _)| k),
        _ => return Err(type_error("list, map or string", this)),
    };
    Ok(found.unwrap_or(Value::Null))
}

fn has_index(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, i) = (ctx.arg(0), ctx.arg(1));
    let heap = ctx.heap();
    let in_range = |len: usize| {
        let n = i.as_int() as i64;
        i.is_number() && n >= -(len as i64) && n < len as i64
    };
    Ok(flag(match this {
        Value::List(_) => in_range(heap.list_count(this)),
        Value::Tiny(_) | Value::Str(_) => in_range(heap.string_len(this)),
        Value::Map(_) => heap.map_has_key(this, i),
        _ => false,
    }))
}

fn index_range(heap: &mut Heap, n: usize) -> VmResult<Value> {
    heap.list_from((0..n as i32).map(Value::Int).collect())
}

fn indexes(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let this = ctx.arg(0);
    let heap = ctx.heap_mut();
    match this {
        Value::List(_) => {
            let n = heap.list_count(this);
            index_range(heap, n)
        }
        Value::Tiny(_) | Value::Str(_) => {
            let n = heap.string_len(this);
            index_range(heap, n)
        }
        Value::Map(_) => heap.map_keys(this),
        _ => Err(type_error("list, map or string", this)),
    }
}

fn values(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let this = ctx.arg(0);
    let heap = ctx.heap_mut();
    match this {
        Value::Map(_) => heap.map_values(this),
        Value::Tiny(_) | Value::Str(_) => heap.string_split(this, Value::Tiny(TinyStr::EMPTY)),
        _ => Ok(this),
    }
}

fn sort(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, by_key) = (ctx.arg(0), ctx.arg(1));
    if this.is_list() {
        ctx.heap_mut().list_sort(this, by_key)?;
    }
    Ok(this)
}

fn join(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, delim) = (ctx.arg(0), ctx.arg(1));
    let heap = ctx.heap_mut();
    let Some(items) = heap.list_items(this) else { return Err(type_error("list", this)) };
    let parts: Vec<String> = items.iter().map(|&v| heap.to_display(v)).collect();
    let joined = parts.join(&heap.to_display(delim));
    heap.new_string(&joined)
}

fn upper(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let this = ctx.arg(0);
    if !this.is_string() {
        return Ok(this);
    }
    ctx.heap_mut().string_upper(this)
}

fn lower(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let this = ctx.arg(0);
    if !this.is_string() {
        return Ok(this);
    }
    ctx.heap_mut().string_lower(this)
}

fn trim(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let this = ctx.arg(0);
    if !this.is_string() {
        return Ok(this);
    }
    ctx.heap_mut().string_trim(this)
}

fn split(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, delim) = (ctx.arg(0), ctx.arg(1));
    if !this.is_string() {
        return Err(type_error("string", this));
    }
    let heap = ctx.heap_mut();
    let delim = heap.to_string_value(delim)?;
    heap.protect(delim);
    let parts = heap.string_split(this, delim);
    heap.unprotect();
    parts
}

fn replace(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, old, new) = (ctx.arg(0), ctx.arg(1), ctx.arg(2));
    let heap = ctx.heap_mut();
    match this {
        Value::Tiny(_) | Value::Str(_) => {
            let mut scope = heap.scope();
            let old = scope.to_string_value(old)?;
            scope.protect(old);
            let new = scope.to_string_value(new)?;
            scope.protect(new);
            scope.string_replace(this, old, new)
        }
        Value::List(_) => {
            let items = heap.list_items(this).unwrap_or(&[]).to_vec();
            for (i, item) in items.into_iter().enumerate() {
                if heap.values_equal(item, old) {
                    heap.list_set(this, i as i32, new)?;
                }
            }
            Ok(this)
        }
        Value::Map(_) => {
            for (k, v) in heap.map_entries(this) {
                if heap.values_equal(v, old) {
                    heap.map_set(this, k, new)?;
                }
            }
            Ok(this)
        }
        _ => Err(type_error("list, map or string", this)),
    }
}

fn slice(ctx: &mut NativeContext<'_>) -> VmResult<Value> {
    let (this, from, to) = (ctx.arg(0), ctx.arg(1), ctx.arg(2));
    let heap = ctx.heap_mut();
    match this {
        Value::List(_) => {
            let end = if to.is_null() { heap.list_count(this) as i32 } else { to.as_int() };
            heap.list_slice(this, from.as_int(), end)
        }
        Value::Tiny(_) | Value::Str(_) => {
            let end = if to.is_null() { heap.string_len(this) as i32 } else { to.as_int() };
            heap.string_slice(this, from.as_int(), end)
        }
        _ => Err(type_error("list or string", this)),
    }
}
