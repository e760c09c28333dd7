//! Call and return protocol.

use super::{CallInfo, Ctx, Frame, NativeContext, Vm};
use crate::bytecode::{a_u, abc_s, b_u, c_u, op, Opcode};
use crate::error::{VmError, VmResult};
use crate::value::Value;

impl Vm {
    /// ARGBLK: `count` ARG instructions follow, then a CALL.
    pub(super) fn argument_block(&mut self, count: i32) -> VmResult<()> {
        let count = usize::try_from(count).map_err(|_| VmError::Sequencing("ARGBLK: negative argument count"))?;
        let call_pc = self.pc + count;
        let word = self.functions[self.func_index]
            .code
            .get(call_pc)
            .copied()
            .ok_or(VmError::Sequencing("ARGBLK: CALL instruction out of range"))?;
        if Opcode::from_u8(op(word)) != Some(Opcode::CALL_rA_rB_rC) {
            return Err(VmError::Sequencing("ARGBLK must be followed by CALL"));
        }
        let target = self.heap.registers.value(self.base + c_u(word) as usize);
        let f = self
            .heap
            .funcref(target)
            .ok_or(VmError::TypeMismatch { expected: "funcRef", found: target.kind().name() })?;
        let callee_base = self.base + b_u(word) as usize;
        self.call_function(f.func_index, f.outer_vars, callee_base, Some(count), Some(a_u(word)), call_pc + 1)
    }

    /// Enter function `index` with its window at `callee_base`.
    ///
    /// `args` is the number of ARG instructions at the current pc, or `None`
    /// to skip parameter setup entirely (CALLF). A pending method context
    /// is consumed either way. Natives run immediately; their result goes
    /// to `dest` in the caller's window, or to the callee's r0 without one.
    pub(super) fn call_function(
        &mut self,
        index: usize,
        outer: Value,
        callee_base: usize,
        args: Option<usize>,
        dest: Option<u8>,
        return_pc: usize,
    ) -> VmResult<()> {
        let callee = self.functions.get(index).ok_or(VmError::InvalidFunction { index })?;
        let native = callee.native;
        let regs = callee.max_regs as usize;
        let binds_self = self.pending.is_some()
            && callee.param_names.first().is_some_and(|&n| self.names_match(n, self.self_name));

        if native.is_none() && self.frames.len() >= self.config.call_slots {
            return Err(VmError::CallStackOverflow);
        }
        self.ensure_frame(callee_base, regs)?;

        let offset = usize::from(binds_self);
        if let Some(count) = args {
            self.process_arguments(index, count, offset, callee_base)?;
            self.setup_call_frame(index, offset + count, callee_base);
        }

        let pending = self.pending;
        self.set_pending(None);
        if let (true, Some((self_val, _))) = (binds_self, pending) {
            self.heap.registers.assign(callee_base + 1, self.self_name, self_val);
        }

        if let Some(native) = native {
            let result = native(&mut NativeContext::new(self, callee_base))?;
            let slot = dest.map_or(callee_base, |d| self.base + d as usize);
            self.heap.registers.set_value(slot, result);
            self.pc = return_pc;
            return Ok(());
        }

        let call = CallInfo {
            return_pc,
            return_base: self.base,
            return_func_index: self.func_index,
            copy_result_to_reg: dest,
        };
        let mut frame = Frame::new(index, callee_base, call);
        frame.set(&mut self.heap, Ctx::Outer, outer);
        if let Some((self_val, super_val)) = pending {
            frame.set(&mut self.heap, Ctx::SelfVal, self_val);
            frame.set(&mut self.heap, Ctx::SuperVal, super_val);
        }
        self.frames.push(frame);
        self.base = callee_base;
        self.func_index = index;
        self.pc = 0;
        Ok(())
    }

    /// Copy `count` ARG operands into the callee's parameter registers,
    /// starting at parameter `offset`.
    fn process_arguments(&mut self, index: usize, count: usize, offset: usize, callee_base: usize) -> VmResult<()> {
        let callee = &self.functions[index];
        let expected = callee.param_count().saturating_sub(offset);
        if count > expected {
            return Err(VmError::TooManyArguments { got: count, expected });
        }
        let code = &self.functions[self.func_index].code;
        let mut values = Vec::with_capacity(count);
        for pc in self.pc..self.pc + count {
            let word = code.get(pc).copied().ok_or(VmError::Sequencing("ARGBLK: CALL instruction out of range"))?;
            let v = match Opcode::from_u8(op(word)) {
                Some(Opcode::ARG_rA) => self.heap.registers.value(self.base + a_u(word) as usize),
                Some(Opcode::ARG_iABC) => Value::Int(abc_s(word)),
                _ => return Err(VmError::Sequencing("Expected ARG opcode in ARGBLK")),
            };
            values.push(v);
        }
        // Sources may overlap the callee window, so all are read first.
        for (i, v) in values.into_iter().enumerate() {
            let p = offset + i;
            self.heap.registers.assign(callee_base + 1 + p, callee.param_names[p], v);
        }
        Ok(())
    }

    /// Default the parameters from `filled` on and clear r0 and every
    /// register past the parameters.
    fn setup_call_frame(&mut self, index: usize, filled: usize, callee_base: usize) {
        let callee = &self.functions[index];
        let registers = &mut self.heap.registers;
        let params = callee.param_count();
        for p in filled..params {
            registers.assign(callee_base + 1 + p, callee.param_names[p], callee.param_defaults[p]);
        }
        registers.assign(callee_base, Value::Null, Value::Null);
        for r in params + 1..callee.max_regs as usize {
            registers.assign(callee_base + r, Value::Null, Value::Null);
        }
    }

    /// Pop the current frame. Returns the result when the entry frame
    /// returns.
    pub(super) fn return_from_frame(&mut self) -> VmResult<Option<Value>> {
        let result = self.heap.registers.value(self.base);
        if self.frames.len() <= 1 {
            return Ok(Some(result));
        }
        let Some(mut frame) = self.frames.pop() else { return Ok(Some(result)) };
        let locals = frame.get(Ctx::Locals);
        if locals.is_map() {
            self.heap.varmap_gather(locals)?;
        }
        frame.release(&mut self.heap);

        let call = frame.call;
        self.pc = call.return_pc;
        self.base = call.return_base;
        self.func_index = call.return_func_index;
        if let Some(d) = call.copy_result_to_reg {
            self.heap.registers.set_value(self.base + d as usize, result);
        }
        Ok(None)
    }
}
