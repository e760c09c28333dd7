//! Register-machine interpreter.
//!
//! All frames share one value stack (the heap's register file). A frame is
//! a window `stack[base..base + max_regs]`; register 0 of a window is the
//! call's result and parameters follow from register 1.

mod call;
mod intrinsics;
mod types;

use std::io::{BufRead, Write};

use log::{debug, error, trace, warn};
use rustc_hash::FxHashMap;

pub use intrinsics::{core_intrinsics, Intrinsic, NativeContext};

use crate::bytecode::{
    a_s, a_u, ab_s, abc_s, b_s, b_u, bc_s, bc_u, c_s, c_u, format_instruction, op, FuncDef, Opcode,
};
use crate::error::{VmError, VmResult};
use crate::gc::{GcConfig, Heap, RootId};
use crate::value::{Value, ValueKind};

/// Name of the function `reset` starts executing.
pub const ENTRY_FUNCTION: &str = "@main";

#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Slots in the shared value stack.
    pub stack_slots: usize,
    /// Maximum call depth.
    pub call_slots: usize,
    /// Emit a `trace!` line per instruction.
    pub debug_trace: bool,
    pub entry: String,
    pub gc: GcConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_slots: 1024,
            call_slots: 256,
            debug_trace: false,
            entry: ENTRY_FUNCTION.to_string(),
            gc: GcConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    /// The cycle budget ran out; `run` resumes.
    Suspended,
    Returned,
    Faulted,
}

/// How to resume the caller when a frame returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallInfo {
    pub return_pc: usize,
    pub return_base: usize,
    pub return_func_index: usize,
    pub copy_result_to_reg: Option<u8>,
}

/// The error that stopped the program, with where it happened.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeFault {
    pub error: VmError,
    pub function: String,
    pub pc: usize,
}

#[derive(Clone, Copy)]
enum Ctx {
    Locals = 0,
    Outer = 1,
    SelfVal = 2,
    SuperVal = 3,
}

/// An active call. Context values are pinned as persistent roots while the
/// frame lives.
struct Frame {
    func_index: usize,
    base: usize,
    call: CallInfo,
    ctx: [Value; 4],
    pins: [Option<RootId>; 4],
}

impl Frame {
    fn new(func_index: usize, base: usize, call: CallInfo) -> Self {
        Frame { func_index, base, call, ctx: [Value::Null; 4], pins: [None; 4] }
    }

    fn get(&self, c: Ctx) -> Value {
        self.ctx[c as usize]
    }

    fn set(&mut self, heap: &mut Heap, c: Ctx, v: Value) {
        let i = c as usize;
        self.ctx[i] = v;
        match self.pins[i] {
            Some(id) => heap.set_root(id, v),
            None if v.heap_ref().is_some() => self.pins[i] = Some(heap.add_root(v)),
            None => {}
        }
    }

    fn release(&mut self, heap: &mut Heap) {
        for pin in self.pins.iter_mut() {
            if let Some(id) = pin.take() {
                heap.remove_root(id);
            }
        }
    }
}

pub type PrintFn = Box<dyn FnMut(&str)>;
pub type InputFn = Box<dyn FnMut(&str) -> String>;

pub struct Vm {
    heap: Heap,
    config: VmConfig,
    functions: Vec<FuncDef>,
    by_name: FxHashMap<String, usize>,
    intrinsic_base: usize,
    frames: Vec<Frame>,
    pc: usize,
    base: usize,
    func_index: usize,
    state: RunState,
    fault: Option<RuntimeFault>,
    errors: Vec<String>,
    pending: Option<(Value, Value)>,
    pending_pins: [RootId; 2],
    type_roots: [RootId; 5],
    intrinsics_root: RootId,
    result_root: RootId,
    self_name: Value,
    super_name: Value,
    print: PrintFn,
    input: InputFn,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new(VmConfig::default())
    }
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::with_config(config.gc.clone());
        heap.registers_mut().resize(config.stack_slots);
        let pending_pins = [heap.add_root(Value::Null), heap.add_root(Value::Null)];
        let type_roots = std::array::from_fn(|_| heap.add_root(Value::Null));
        let intrinsics_root = heap.add_root(Value::Null);
        let result_root = heap.add_root(Value::Null);
        let self_name = heap.intern("self");
        let super_name = heap.intern("super");
        Vm {
            heap,
            config,
            functions: Vec::new(),
            by_name: FxHashMap::default(),
            intrinsic_base: 0,
            frames: Vec::new(),
            pc: 0,
            base: 0,
            func_index: 0,
            state: RunState::Idle,
            fault: None,
            errors: Vec::new(),
            pending: None,
            pending_pins,
            type_roots,
            intrinsics_root,
            result_root,
            self_name,
            super_name,
            print: Box::new(|s| println!("{s}")),
            input: Box::new(read_stdin_line),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn set_print_callback(&mut self, print: impl FnMut(&str) + 'static) {
        self.print = Box::new(print);
    }

    pub fn set_input_callback(&mut self, input: impl FnMut(&str) -> String + 'static) {
        self.input = Box::new(input);
    }

    // ── Loading ─────────────────────────────────────────────────────

    /// Load `functions`, append the intrinsics, and prepare to run the
    /// entry function. On failure the VM stays idle and the error is
    /// recorded.
    pub fn reset(&mut self, functions: Vec<FuncDef>) -> VmResult<()> {
        for mut frame in self.frames.drain(..) {
            frame.release(&mut self.heap);
        }
        self.functions = functions;
        self.intrinsic_base = self.functions.len();
        self.state = RunState::Idle;
        self.fault = None;
        self.set_pending(None);
        self.heap.set_root(self.result_root, Value::Null);

        let entry = match self.functions.iter().position(|f| f.name == self.config.entry) {
            Some(i) => i,
            None => return Err(self.load_error(VmError::NoEntryFunction)),
        };
        if self.functions[entry].code.is_empty() && !self.functions[entry].is_native() {
            return Err(self.load_error(VmError::EmptyEntryFunction));
        }

        self.install_intrinsics()?;
        self.by_name.clear();
        for (i, f) in self.functions.iter().enumerate() {
            self.by_name.entry(f.name.clone()).or_insert(i);
        }

        let registers = self.heap.registers_mut();
        registers.resize(0);
        registers.resize(self.config.stack_slots);

        self.pc = 0;
        self.base = 0;
        self.func_index = entry;
        self.frames.push(Frame::new(entry, 0, CallInfo::default()));
        self.ensure_frame(0, self.functions[entry].max_regs as usize)?;
        self.state = RunState::Running;
        debug!(
            "VM reset: executing {} out of {} functions",
            self.functions[entry].name,
            self.functions.len()
        );
        Ok(())
    }

    /// Append a function for incremental loading; returns its index.
    pub fn register_function(&mut self, func: FuncDef) -> usize {
        let index = self.functions.len();
        self.by_name.entry(func.name.clone()).or_insert(index);
        self.functions.push(func);
        index
    }

    fn load_error(&mut self, e: VmError) -> VmError {
        error!("{e}");
        self.errors.push(format!("Runtime Error: {e}"));
        e
    }

    // ── Running ─────────────────────────────────────────────────────

    /// Run to completion. Returns the entry function's result, or null if
    /// the program faulted.
    pub fn run(&mut self) -> Value {
        self.run_budget(None)
    }

    /// Run at most `max_cycles` instructions. Returns null while the
    /// program is still running; check [`Vm::is_running`].
    pub fn run_cycles(&mut self, max_cycles: u64) -> Value {
        self.run_budget(Some(max_cycles))
    }

    fn run_budget(&mut self, budget: Option<u64>) -> Value {
        if !self.is_running() {
            return Value::Null;
        }
        self.state = RunState::Running;
        match self.execute(budget) {
            Ok(Some(result)) => {
                self.state = RunState::Returned;
                self.heap.set_root(self.result_root, result);
                result
            }
            Ok(None) => {
                // A native may have faulted the VM from inside a call.
                if self.state == RunState::Running {
                    self.state = RunState::Suspended;
                }
                Value::Null
            }
            Err(e) => {
                self.raise_runtime_error(e);
                Value::Null
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running | RunState::Suspended)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Result of the last completed run.
    pub fn result(&self) -> Value {
        self.heap.root(self.result_root)
    }

    // ── Errors ──────────────────────────────────────────────────────

    /// Record `error` against the current function and pc and stop.
    pub fn raise_runtime_error(&mut self, error: VmError) {
        let function = self.function_name(self.func_index).to_string();
        let pc = self.pc.saturating_sub(1);
        warn!("runtime error in {function} at {pc}: {error}");
        self.errors.push(format!("Runtime Error: {error} [{function} line {pc}]"));
        self.fault = Some(RuntimeFault { error, function, pc });
        self.state = RunState::Faulted;
    }

    /// Log the pending runtime error, if any.
    pub fn report_runtime_error(&self) -> bool {
        match &self.fault {
            Some(f) => {
                error!("Runtime Error: {} [{} line {}]", f.error, f.function, f.pc);
                true
            }
            None => false,
        }
    }

    pub fn fault(&self) -> Option<&RuntimeFault> {
        self.fault.as_ref()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn stack_size(&self) -> usize {
        self.heap.registers().len()
    }

    pub fn call_stack_depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    pub fn stack_value(&self, index: usize) -> Value {
        self.heap.registers().value(index)
    }

    pub fn stack_name(&self, index: usize) -> Value {
        self.heap.registers().name(index)
    }

    /// Return info of call `index`, outermost first.
    pub fn call_stack_frame(&self, index: usize) -> Option<CallInfo> {
        self.frames.get(index + 1).map(|f| f.call)
    }

    pub fn function_name(&self, index: usize) -> &str {
        self.functions.get(index).map_or("???", |f| f.name.as_str())
    }

    pub fn functions(&self) -> &[FuncDef] {
        &self.functions
    }

    /// The loaded program's functions, without the intrinsics.
    pub fn user_functions(&self) -> &[FuncDef] {
        &self.functions[..self.intrinsic_base.min(self.functions.len())]
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn base_index(&self) -> usize {
        self.base
    }

    pub fn current_function_index(&self) -> usize {
        self.func_index
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn execute(&mut self, budget: Option<u64>) -> VmResult<Option<Value>> {
        let mut cycles_left = budget.unwrap_or(u64::MAX);

        macro_rules! reg {
            ($r:expr) => {
                self.heap.registers.value(self.base + $r as usize)
            };
        }
        macro_rules! set {
            ($r:expr, $v:expr) => {{
                let v = $v;
                self.heap.registers.set_value(self.base + $r as usize, v);
            }};
        }
        macro_rules! flag {
            ($cond:expr) => {
                if $cond { Value::TRUE } else { Value::FALSE }
            };
        }

        while self.state == RunState::Running {
            if cycles_left == 0 {
                return Ok(None);
            }
            cycles_left -= 1;

            let func = self.functions.get(self.func_index).ok_or(VmError::InvalidFunction { index: self.func_index })?;
            let Some(&word) = func.code.get(self.pc) else {
                return Err(VmError::PcOutOfBounds { function: func.name.clone() });
            };
            self.pc += 1;
            if self.config.debug_trace {
                trace!(
                    "{} {:04}: {}     r0:{}, r1:{}, r2:{}",
                    func.name,
                    self.pc - 1,
                    format_instruction(word),
                    self.heap.repr(reg!(0)),
                    self.heap.repr(reg!(1)),
                    self.heap.repr(reg!(2)),
                );
            }
            let opcode = Opcode::from_u8(op(word)).ok_or(VmError::UnknownOpcode { op: op(word) })?;
            let a = a_u(word);

            match opcode {
                Opcode::NOOP => {}
                Opcode::LOAD_rA_rB => set!(a, reg!(b_u(word))),
                Opcode::LOAD_rA_iBC => set!(a, Value::Int(bc_s(word) as i32)),
                Opcode::LOAD_rA_kBC => set!(a, self.constant(bc_u(word) as usize)?),
                Opcode::LOADNULL_rA => set!(a, Value::Null),
                Opcode::LOADV_rA_rB_kC => {
                    let b = b_u(word);
                    let v = self.named_register(b, c_u(word))?;
                    set!(a, v);
                }
                Opcode::LOADC_rA_rB_kC => {
                    let v = self.named_register(b_u(word), c_u(word))?;
                    match self.heap.funcref(v) {
                        Some(f) => {
                            let callee_base = self.base + self.functions[self.func_index].max_regs as usize;
                            self.call_function(f.func_index, f.outer_vars, callee_base, Some(0), Some(a), self.pc)?;
                        }
                        None => set!(a, v),
                    }
                }
                Opcode::FUNCREF_iA_iBC => {
                    let locals = self.frame_locals(self.frames.len() - 1)?;
                    let f = self.heap.new_funcref(bc_u(word) as usize, locals)?;
                    set!(a, f);
                }
                Opcode::ASSIGN_rA_rB_kC => {
                    set!(a, reg!(b_u(word)));
                    let name = self.constant(c_u(word) as usize)?;
                    self.name_register(a, name)?;
                }
                Opcode::NAME_rA_kBC => {
                    let name = self.constant(bc_u(word) as usize)?;
                    self.name_register(a, name)?;
                }

                Opcode::ADD_rA_rB_rC => set!(a, self.heap.value_add(reg!(b_u(word)), reg!(c_u(word)))?),
                Opcode::SUB_rA_rB_rC => set!(a, self.heap.value_sub(reg!(b_u(word)), reg!(c_u(word)))?),
                Opcode::MULT_rA_rB_rC => set!(a, self.heap.value_mult(reg!(b_u(word)), reg!(c_u(word)))?),
                Opcode::DIV_rA_rB_rC => set!(a, self.heap.value_div(reg!(b_u(word)), reg!(c_u(word)))?),
                Opcode::MOD_rA_rB_rC => set!(a, self.heap.value_mod(reg!(b_u(word)), reg!(c_u(word)))?),
                Opcode::AND_rA_rB_rC => set!(a, self.heap.value_and(reg!(b_u(word)), reg!(c_u(word)))),
                Opcode::OR_rA_rB_rC => set!(a, self.heap.value_or(reg!(b_u(word)), reg!(c_u(word)))),
                Opcode::NOT_rA_rB => set!(a, self.heap.value_not(reg!(b_u(word)))),

                Opcode::LIST_rA_iBC => set!(a, self.heap.new_list(bc_s(word).max(0) as usize)?),
                Opcode::MAP_rA_iBC => set!(a, self.heap.new_map(bc_s(word).max(0) as usize)?),
                Opcode::PUSH_rA_rB => self.heap.list_push(reg!(a), reg!(b_u(word)))?,
                Opcode::INDEX_rA_rB_rC => set!(a, self.index_value(reg!(b_u(word)), reg!(c_u(word)))?),
                Opcode::IDXSET_rA_rB_rC => {
                    let (container, index, v) = (reg!(a), reg!(b_u(word)), reg!(c_u(word)));
                    match container {
                        Value::List(_) => self.heap.list_set(container, index.as_int(), v)?,
                        Value::Map(_) => self.heap.map_set(container, index, v)?,
                        _ => return Err(VmError::NotIndexAssignable { container: self.heap.repr(container) }),
                    }
                }
                Opcode::SLICE_rA_rB_rC => {
                    let c = c_u(word) as usize;
                    let (container, from, to) = (reg!(b_u(word)), reg!(c), reg!(c + 1));
                    let start = if from.is_null() { 0 } else { from.as_int() };
                    let v = match container {
                        Value::List(_) => {
                            let end = if to.is_null() { self.heap.list_count(container) as i32 } else { to.as_int() };
                            self.heap.list_slice(container, start, end)?
                        }
                        Value::Tiny(_) | Value::Str(_) => {
                            let end = if to.is_null() { self.heap.string_len(container) as i32 } else { to.as_int() };
                            self.heap.string_slice(container, start, end)?
                        }
                        _ => return Err(VmError::NotSliceable { container: self.heap.repr(container) }),
                    };
                    set!(a, v);
                }

                Opcode::LOCALS_rA => {
                    let locals = self.frame_locals(self.frames.len() - 1)?;
                    set!(a, locals);
                    self.heap.registers.set_name(self.base + a as usize, Value::Null);
                }
                Opcode::OUTER_rA => {
                    let outer = match self.frames.last().map(|f| f.get(Ctx::Outer)) {
                        Some(v) if !v.is_null() && self.frames.len() > 1 => v,
                        _ => self.frame_locals(0)?,
                    };
                    set!(a, outer);
                    self.heap.registers.set_name(self.base + a as usize, Value::Null);
                }
                Opcode::GLOBALS_rA => {
                    let globals = self.frame_locals(0)?;
                    set!(a, globals);
                    self.heap.registers.set_name(self.base + a as usize, Value::Null);
                }

                Opcode::JUMP_iABC => self.jump(abc_s(word))?,

                Opcode::LT_rA_rB_rC => set!(a, flag!(self.heap.value_lt(reg!(b_u(word)), reg!(c_u(word))))),
                Opcode::LT_rA_rB_iC => set!(a, flag!(self.heap.value_lt(reg!(b_u(word)), Value::Int(c_s(word) as i32)))),
                Opcode::LT_rA_iB_rC => set!(a, flag!(self.heap.value_lt(Value::Int(b_s(word) as i32), reg!(c_u(word))))),
                Opcode::LE_rA_rB_rC => set!(a, flag!(self.heap.value_le(reg!(b_u(word)), reg!(c_u(word))))),
                Opcode::LE_rA_rB_iC => set!(a, flag!(self.heap.value_le(reg!(b_u(word)), Value::Int(c_s(word) as i32)))),
                Opcode::LE_rA_iB_rC => set!(a, flag!(self.heap.value_le(Value::Int(b_s(word) as i32), reg!(c_u(word))))),
                Opcode::EQ_rA_rB_rC => set!(a, flag!(self.heap.values_equal(reg!(b_u(word)), reg!(c_u(word))))),
                Opcode::EQ_rA_rB_iC => set!(a, flag!(self.heap.values_equal(reg!(b_u(word)), Value::Int(c_s(word) as i32)))),
                Opcode::NE_rA_rB_rC => set!(a, flag!(!self.heap.values_equal(reg!(b_u(word)), reg!(c_u(word))))),
                Opcode::NE_rA_rB_iC => set!(a, flag!(!self.heap.values_equal(reg!(b_u(word)), Value::Int(c_s(word) as i32)))),

                Opcode::BRTRUE_rA_iBC => {
                    if self.heap.is_truthy(reg!(a)) {
                        self.jump(bc_s(word) as i32)?;
                    }
                }
                Opcode::BRFALSE_rA_iBC => {
                    if !self.heap.is_truthy(reg!(a)) {
                        self.jump(bc_s(word) as i32)?;
                    }
                }
                Opcode::BRLT_rA_rB_iC => {
                    if self.heap.value_lt(reg!(a), reg!(b_u(word))) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BRLT_rA_iB_iC => {
                    if self.heap.value_lt(reg!(a), Value::Int(b_s(word) as i32)) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BRLT_iA_rB_iC => {
                    if self.heap.value_lt(Value::Int(a_s(word) as i32), reg!(b_u(word))) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BRLE_rA_rB_iC => {
                    if self.heap.value_le(reg!(a), reg!(b_u(word))) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BRLE_rA_iB_iC => {
                    if self.heap.value_le(reg!(a), Value::Int(b_s(word) as i32)) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BRLE_iA_rB_iC => {
                    if self.heap.value_le(Value::Int(a_s(word) as i32), reg!(b_u(word))) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BREQ_rA_rB_iC => {
                    if self.heap.values_equal(reg!(a), reg!(b_u(word))) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BREQ_rA_iB_iC => {
                    if self.heap.values_equal(reg!(a), Value::Int(b_s(word) as i32)) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BRNE_rA_rB_iC => {
                    if !self.heap.values_equal(reg!(a), reg!(b_u(word))) {
                        self.jump(c_s(word) as i32)?;
                    }
                }
                Opcode::BRNE_rA_iB_iC => {
                    if !self.heap.values_equal(reg!(a), Value::Int(b_s(word) as i32)) {
                        self.jump(c_s(word) as i32)?;
                    }
                }

                Opcode::IFLT_rA_rB => self.skip_unless(self.heap.value_lt(reg!(a), reg!(b_u(word)))),
                Opcode::IFLT_rA_iBC => self.skip_unless(self.heap.value_lt(reg!(a), Value::Int(bc_s(word) as i32))),
                Opcode::IFLT_iAB_rC => self.skip_unless(self.heap.value_lt(Value::Int(ab_s(word) as i32), reg!(c_u(word)))),
                Opcode::IFLE_rA_rB => self.skip_unless(self.heap.value_le(reg!(a), reg!(b_u(word)))),
                Opcode::IFLE_rA_iBC => self.skip_unless(self.heap.value_le(reg!(a), Value::Int(bc_s(word) as i32))),
                Opcode::IFLE_iAB_rC => self.skip_unless(self.heap.value_le(Value::Int(ab_s(word) as i32), reg!(c_u(word)))),
                Opcode::IFEQ_rA_rB => self.skip_unless(self.heap.values_equal(reg!(a), reg!(b_u(word)))),
                Opcode::IFEQ_rA_iBC => self.skip_unless(self.heap.values_equal(reg!(a), Value::Int(bc_s(word) as i32))),
                Opcode::IFNE_rA_rB => self.skip_unless(!self.heap.values_equal(reg!(a), reg!(b_u(word)))),
                Opcode::IFNE_rA_iBC => self.skip_unless(!self.heap.values_equal(reg!(a), Value::Int(bc_s(word) as i32))),

                Opcode::NEXT_rA_rB => {
                    let index = reg!(a).as_int().saturating_add(1);
                    set!(a, Value::Int(index));
                    let container = reg!(b_u(word));
                    let len = match container {
                        Value::List(_) => self.heap.list_count(container),
                        Value::Map(_) => self.heap.map_count(container),
                        Value::Tiny(_) | Value::Str(_) => self.heap.string_len(container),
                        _ => 0,
                    };
                    if index >= 0 && (index as usize) < len {
                        self.pc += 1;
                    }
                }

                Opcode::ARGBLK_iABC => self.argument_block(abc_s(word))?,
                Opcode::ARG_rA | Opcode::ARG_iABC => {
                    return Err(VmError::Sequencing("Internal error: ARG without ARGBLK"));
                }
                Opcode::CALLF_iA_iBC => {
                    let callee_base = self.base + a as usize;
                    self.call_function(bc_u(word) as usize, Value::Null, callee_base, None, None, self.pc)?;
                }
                Opcode::CALLFN_iA_kBC => {
                    let name = self.constant(bc_u(word) as usize)?;
                    let display = self.heap.to_display(name);
                    let index = self.function_index(&display).ok_or(VmError::UnknownFunction { name: display })?;
                    let callee_base = self.base + a as usize;
                    self.call_function(index, Value::Null, callee_base, None, None, self.pc)?;
                }
                Opcode::CALL_rA_rB_rC => {
                    let target = reg!(c_u(word));
                    match self.heap.funcref(target) {
                        Some(f) => {
                            let callee_base = self.base + b_u(word) as usize;
                            self.call_function(f.func_index, f.outer_vars, callee_base, Some(0), Some(a), self.pc)?;
                        }
                        None => {
                            self.set_pending(None);
                            set!(a, target);
                        }
                    }
                }

                Opcode::NEW_rA_rB => {
                    let mut scope = self.heap.scope();
                    let m = scope.new_map(2)?;
                    scope.protect(m);
                    let parent = scope.registers.value(self.base + b_u(word) as usize);
                    scope.map_set(m, crate::collections::isa_key(), parent)?;
                    drop(scope);
                    set!(a, m);
                }
                Opcode::ISA_rA_rB_rC => set!(a, flag!(self.isa(reg!(b_u(word)), reg!(c_u(word))))),
                Opcode::METHFIND_rA_rB_rC => {
                    let (container, key) = (reg!(b_u(word)), reg!(c_u(word)));
                    let v = self.find_method(container, key)?;
                    set!(a, v);
                }
                Opcode::SETSELF_rA => {
                    let sup = self.pending.map_or(Value::Null, |(_, s)| s);
                    self.set_pending(Some((reg!(a), sup)));
                }
                Opcode::CALLIFREF_rA => {
                    let v = reg!(a);
                    match self.heap.funcref(v) {
                        Some(f) if self.pending.is_some() => {
                            let callee_base = self.base + self.functions[self.func_index].max_regs as usize;
                            self.call_function(f.func_index, f.outer_vars, callee_base, Some(0), Some(a), self.pc)?;
                        }
                        _ => self.set_pending(None),
                    }
                }
                Opcode::ITERGET_rA_rB_rC => {
                    let container = reg!(b_u(word));
                    let index = reg!(c_u(word)).as_int();
                    let v = match container {
                        Value::List(_) => self.heap.list_get(container, index)?,
                        Value::Tiny(_) | Value::Str(_) => self.heap.string_char_at(container, index)?,
                        Value::Map(_) => self.map_entry_pair(container, index)?,
                        _ => Value::Null,
                    };
                    set!(a, v);
                }
                Opcode::RETURN => {
                    if let Some(result) = self.return_from_frame()? {
                        return Ok(Some(result));
                    }
                }
            }
        }
        Ok(None)
    }

    // ── Instruction helpers ─────────────────────────────────────────

    fn constant(&self, index: usize) -> VmResult<Value> {
        self.functions
            .get(self.func_index)
            .and_then(|f| f.constants.get(index).copied())
            .ok_or(VmError::Sequencing("constant index out of range"))
    }

    fn jump(&mut self, offset: i32) -> VmResult<()> {
        let target = self.pc as i64 + offset as i64;
        if target < 0 {
            return Err(VmError::PcOutOfBounds { function: self.function_name(self.func_index).to_string() });
        }
        self.pc = target as usize;
        Ok(())
    }

    fn skip_unless(&mut self, cond: bool) {
        if !cond {
            self.pc += 1;
        }
    }

    fn names_match(&self, a: Value, b: Value) -> bool {
        a.identical(&b) || (a.is_string() && b.is_string() && self.heap.values_equal(a, b))
    }

    /// Register `reg` if it carries the name in constant `k`, otherwise the
    /// variable looked up by name.
    fn named_register(&self, reg: u8, k: u8) -> VmResult<Value> {
        let expected = self.constant(k as usize)?;
        let slot = self.base + reg as usize;
        if self.names_match(expected, self.heap.registers.name(slot)) {
            Ok(self.heap.registers.value(slot))
        } else {
            self.lookup_variable(expected)
        }
    }

    fn name_register(&mut self, reg: u8, name: Value) -> VmResult<()> {
        let slot = self.base + reg as usize;
        self.heap.registers.set_name(slot, name);
        if let Some(locals) = self.frames.last().map(|f| f.get(Ctx::Locals)) {
            if self.heap.is_varmap(locals) {
                self.heap.varmap_map_to_register(locals, name, slot)?;
            }
        }
        Ok(())
    }

    /// Resolve a name that is not in its expected register.
    fn lookup_variable(&self, name: Value) -> VmResult<Value> {
        let frame = self.frames.last();
        if let Some(outer) = frame.map(|f| f.get(Ctx::Outer)) {
            if let Some(v) = self.heap.map_try_get(outer, name) {
                return Ok(v);
            }
        }
        if let Some(globals) = self.frames.first() {
            let count = self.functions.get(globals.func_index).map_or(0, |f| f.max_regs as usize);
            for slot in globals.base..globals.base + count {
                if self.names_match(name, self.heap.registers.name(slot)) {
                    return Ok(self.heap.registers.value(slot));
                }
            }
            if let Some(v) = self.heap.map_try_get(globals.get(Ctx::Locals), name) {
                return Ok(v);
            }
        }
        if let Some(v) = self.heap.map_try_get(self.heap.root(self.intrinsics_root), name) {
            return Ok(v);
        }
        if self.names_match(name, self.self_name) {
            return Ok(frame.map_or(Value::Null, |f| f.get(Ctx::SelfVal)));
        }
        if self.names_match(name, self.super_name) {
            return Ok(frame.map_or(Value::Null, |f| f.get(Ctx::SuperVal)));
        }
        Err(VmError::UndefinedIdentifier { name: self.heap.to_display(name) })
    }

    /// The locals map of frame `index`, created on first use.
    fn frame_locals(&mut self, index: usize) -> VmResult<Value> {
        let Some(frame) = self.frames.get(index) else { return Ok(Value::Null) };
        let existing = frame.get(Ctx::Locals);
        if !existing.is_null() {
            return Ok(existing);
        }
        let regs = self.functions.get(frame.func_index).map_or(0, |f| f.max_regs as usize);
        let map = if regs == 0 { self.heap.new_map(4)? } else { self.heap.new_varmap(frame.base, regs)? };
        let Vm { frames, heap, .. } = self;
        frames[index].set(heap, Ctx::Locals, map);
        Ok(map)
    }

    fn index_value(&mut self, container: Value, index: Value) -> VmResult<Value> {
        match container {
            Value::List(_) => self.heap.list_get(container, index.as_int()),
            Value::Map(_) => self
                .heap
                .map_lookup(container, index)
                .ok_or_else(|| VmError::KeyNotFound { key: self.heap.to_display(index) }),
            Value::Tiny(_) | Value::Str(_) => self.heap.string_char_at(container, index.as_int()),
            _ => Err(VmError::NotIndexable { container: self.heap.repr(container) }),
        }
    }

    fn map_entry_pair(&mut self, map: Value, index: i32) -> VmResult<Value> {
        let Some((key, value)) = usize::try_from(index).ok().and_then(|n| self.heap.map_nth_entry(map, n)) else {
            return Ok(Value::Null);
        };
        let mut scope = self.heap.scope();
        let pair = scope.new_map(2)?;
        scope.protect(pair);
        let (k, v) = (scope.intern("key"), scope.intern("value"));
        scope.map_set(pair, k, key)?;
        scope.map_set(pair, v, value)?;
        Ok(pair)
    }

    fn set_pending(&mut self, pending: Option<(Value, Value)>) {
        self.pending = pending;
        let (s, p) = pending.unwrap_or((Value::Null, Value::Null));
        self.heap.set_root(self.pending_pins[0], s);
        self.heap.set_root(self.pending_pins[1], p);
    }

    fn function_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    fn ensure_frame(&self, base: usize, regs: usize) -> VmResult<()> {
        let available = self.heap.registers.len();
        if base + regs > available {
            return Err(VmError::StackOverflow { needed: base + regs, available });
        }
        Ok(())
    }

    /// Kind-indexed type map, or null before the first reset.
    pub fn type_map(&self, kind: ValueKind) -> Value {
        types::slot(kind).map_or(Value::Null, |i| self.heap.root(self.type_roots[i]))
    }
}

fn read_stdin_line(prompt: &str) -> String {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    line.trim_end_matches(['\r', '\n']).to_string()
}

#[cfg(test)]
mod tests;
