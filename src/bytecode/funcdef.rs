use crate::error::VmResult;
use crate::gc::Heap;
use crate::value::Value;
use crate::vm::NativeContext;

/// Host callback standing in for bytecode. It reads its parameters from
/// the context and returns the call's result.
pub type NativeFn = fn(&mut NativeContext<'_>) -> VmResult<Value>;

/// One compiled function: code, constant pool and parameter layout.
///
/// Register 0 holds the result; parameters occupy registers `1..=n`.
/// Constant values are expected to be immortal (interned or inline), so a
/// `FuncDef` never needs rooting.
#[derive(Clone, Default)]
pub struct FuncDef {
    pub name: String,
    pub code: Vec<u32>,
    pub constants: Vec<Value>,
    pub max_regs: u16,
    pub param_names: Vec<Value>,
    pub param_defaults: Vec<Value>,
    pub native: Option<NativeFn>,
}

impl FuncDef {
    pub fn new(name: impl Into<String>) -> Self {
        FuncDef { name: name.into(), ..FuncDef::default() }
    }

    pub fn param_count(&self) -> usize {
        self.param_names.len()
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// Grow the register count so that register `reg` exists.
    pub fn reserve_register(&mut self, reg: u8) {
        self.max_regs = self.max_regs.max(reg as u16 + 1);
    }

    /// `name(a, b=1)` style rendering.
    pub fn signature(&self, heap: &Heap) -> String {
        let params: Vec<String> = self
            .param_names
            .iter()
            .zip(&self.param_defaults)
            .map(|(&n, &d)| {
                let name = heap.to_display(n);
                if d.is_null() { name } else { format!("{name}={}", heap.repr(d)) }
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

impl std::fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncDef")
            .field("name", &self.name)
            .field("code", &self.code.len())
            .field("constants", &self.constants.len())
            .field("max_regs", &self.max_regs)
            .field("params", &self.param_names.len())
            .field("native", &self.native.is_some())
            .finish()
    }
}
