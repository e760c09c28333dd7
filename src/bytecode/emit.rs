use super::{encode, encode_unchecked, EmitError, FuncDef, Opcode, Role};
use crate::gc::Heap;
use crate::value::Value;

const MAX_CONSTANTS: usize = u16::MAX as usize + 1;

/// Incremental construction of a [`FuncDef`].
///
/// Operands are validated against the opcode's shape unless checking is
/// turned off with [`FuncDefBuilder::unchecked`]. Registers named by an
/// operand are reserved automatically.
pub struct FuncDefBuilder {
    func: FuncDef,
    checked: bool,
}

impl FuncDefBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        FuncDefBuilder { func: FuncDef::new(name), checked: true }
    }

    pub fn unchecked(mut self) -> Self {
        self.checked = false;
        self
    }

    /// Declare the next parameter. A null default makes it required.
    pub fn param(&mut self, heap: &mut Heap, name: &str, default: Value) -> &mut Self {
        self.func.param_names.push(heap.intern(name));
        self.func.param_defaults.push(default);
        self.func.reserve_register(self.func.param_names.len().min(255) as u8);
        self
    }

    /// Index of `v` in the constant pool, adding it if absent.
    pub fn constant(&mut self, v: Value) -> Result<u16, EmitError> {
        if let Some(i) = self.func.constants.iter().position(|c| c.identical(&v)) {
            return Ok(i as u16);
        }
        if self.func.constants.len() >= MAX_CONSTANTS {
            return Err(EmitError::ConstantPoolFull { limit: MAX_CONSTANTS });
        }
        self.func.constants.push(v);
        Ok((self.func.constants.len() - 1) as u16)
    }

    /// Intern `s` and add it to the pool.
    pub fn string_constant(&mut self, heap: &mut Heap, s: &str) -> Result<u16, EmitError> {
        let v = heap.intern(s);
        self.constant(v)
    }

    /// Append an instruction and return its pc.
    pub fn emit(&mut self, op: Opcode, operands: &[i32]) -> Result<usize, EmitError> {
        let word = if self.checked { encode(op, operands)? } else { encode_unchecked(op, operands) };
        self.reserve_operands(op, operands);
        self.func.code.push(word);
        Ok(self.func.code.len() - 1)
    }

    pub fn emit_word(&mut self, word: u32) -> usize {
        self.func.code.push(word);
        self.func.code.len() - 1
    }

    /// Replace the instruction at `at`, e.g. to fix up a forward jump.
    pub fn patch(&mut self, at: usize, op: Opcode, operands: &[i32]) -> Result<(), EmitError> {
        let word = if self.checked { encode(op, operands)? } else { encode_unchecked(op, operands) };
        if let Some(slot) = self.func.code.get_mut(at) {
            *slot = word;
        }
        Ok(())
    }

    pub fn pc(&self) -> usize {
        self.func.code.len()
    }

    pub fn reserve_registers(&mut self, count: u16) -> &mut Self {
        self.func.max_regs = self.func.max_regs.max(count);
        self
    }

    pub fn finish(self) -> FuncDef {
        self.func
    }

    fn reserve_operands(&mut self, op: Opcode, operands: &[i32]) {
        for (f, &v) in op.fields().iter().zip(operands) {
            if f.role == Role::Reg {
                self.func.reserve_register(v.clamp(0, 255) as u8);
            }
        }
        if op == Opcode::SLICE_rA_rB_rC {
            if let Some(&c) = operands.get(2) {
                self.func.reserve_register((c + 1).clamp(0, 255) as u8);
            }
        }
    }
}
