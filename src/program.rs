//! JSON program descriptions.
//!
//! The driver does not compile source text; it loads function tables that
//! an external front end (or a test) wrote out:
//!
//! ```json
//! { "functions": [
//!     { "name": "@main",
//!       "constants": ["hello", 2.5],
//!       "code": [ {"op": "LOAD_rA_kBC", "args": [0, 0]}, "RETURN" ] } ] }
//! ```
//!
//! An instruction is a raw 32-bit word, a bare mnemonic, or an
//! `{op, args}` object. Parameters are `{name, default}` objects; a
//! missing default is null.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::{EmitError, FuncDef, FuncDefBuilder, Opcode};
use crate::gc::Heap;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("malformed program: {0}")]
    Json(#[from] serde_json::Error),
    #[error("in function '{function}' at {pc}: unknown opcode '{mnemonic}'")]
    UnknownMnemonic { function: String, pc: usize, mnemonic: String },
    #[error("in function '{function}' at {pc}: {source}")]
    Emit { function: String, pc: usize, source: EmitError },
    #[error("in function '{function}': unsupported constant {value}")]
    UnsupportedConstant { function: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<FunctionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub max_regs: Option<u16>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub constants: Vec<serde_json::Value>,
    #[serde(default)]
    pub code: Vec<Instruction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub default: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instruction {
    Word(u32),
    Mnemonic(String),
    Op {
        op: String,
        #[serde(default)]
        args: Vec<i32>,
    },
}

impl Program {
    pub fn from_json(text: &str) -> Result<Program, ProgramError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Assemble every function. Strings become interned constants, so the
    /// results need no rooting. With `checked`, operands are validated
    /// against each opcode's shape.
    pub fn build(&self, heap: &mut Heap, checked: bool) -> Result<Vec<FuncDef>, ProgramError> {
        self.functions.iter().map(|f| f.build(heap, checked)).collect()
    }
}

impl FunctionSpec {
    fn build(&self, heap: &mut Heap, checked: bool) -> Result<FuncDef, ProgramError> {
        let mut b = FuncDefBuilder::new(self.name.clone());
        if !checked {
            b = b.unchecked();
        }
        for p in &self.params {
            let default = self.constant(heap, &p.default)?;
            b.param(heap, &p.name, default);
        }
        for (pc, instr) in self.code.iter().enumerate() {
            match instr {
                Instruction::Word(w) => {
                    b.emit_word(*w);
                }
                Instruction::Mnemonic(m) => self.emit(&mut b, pc, m, &[])?,
                Instruction::Op { op, args } => self.emit(&mut b, pc, op, args)?,
            }
        }
        if let Some(n) = self.max_regs {
            b.reserve_registers(n);
        }
        let mut func = b.finish();
        // Indices in the code refer to the pool exactly as written.
        func.constants = self.constants.iter().map(|c| self.constant(heap, c)).collect::<Result<_, _>>()?;
        Ok(func)
    }

    fn emit(&self, b: &mut FuncDefBuilder, pc: usize, mnemonic: &str, args: &[i32]) -> Result<(), ProgramError> {
        let op = Opcode::from_mnemonic(mnemonic).ok_or_else(|| ProgramError::UnknownMnemonic {
            function: self.name.clone(),
            pc,
            mnemonic: mnemonic.to_string(),
        })?;
        b.emit(op, args)
            .map(|_| ())
            .map_err(|source| ProgramError::Emit { function: self.name.clone(), pc, source })
    }

    fn constant(&self, heap: &mut Heap, v: &serde_json::Value) -> Result<Value, ProgramError> {
        use serde_json::Value as Json;
        match v {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(if *b { Value::TRUE } else { Value::FALSE }),
            Json::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) => Ok(Value::Int(i)),
                None => Ok(Value::number(n.as_f64().unwrap_or(f64::NAN))),
            },
            Json::String(s) => Ok(heap.intern(s)),
            other => Err(ProgramError::UnsupportedConstant { function: self.name.clone(), value: other.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ins, ins_abx};

    const HELLO: &str = r#"{
        "functions": [
            { "name": "@main",
              "constants": ["hello", 2.5, 7],
              "code": [ {"op": "LOAD_rA_kBC", "args": [0, 1]}, "RETURN" ] },
            { "name": "greet",
              "params": [ {"name": "who"}, {"name": "times", "default": 2} ],
              "code": [ 2147483648 ] }
        ]
    }"#;

    #[test]
    fn loads_functions_and_constants() {
        let mut heap = Heap::new();
        let funcs = Program::from_json(HELLO).unwrap().build(&mut heap, true).unwrap();
        assert_eq!(funcs.len(), 2);

        let main = &funcs[0];
        assert_eq!(main.code, vec![ins_abx(Opcode::LOAD_rA_kBC, 0, 1), ins(Opcode::RETURN)]);
        assert_eq!(heap.to_display(main.constants[0]), "hello");
        assert_eq!(main.constants[1], Value::Double(2.5));
        assert_eq!(main.constants[2], Value::Int(7));

        let greet = &funcs[1];
        assert_eq!(greet.signature(&heap), "greet(who, times=2)");
        assert_eq!(greet.max_regs, 3);
        assert_eq!(greet.code, vec![0x8000_0000]);
    }

    #[test]
    fn duplicate_constants_keep_their_indices() {
        let mut heap = Heap::new();
        let text = r#"{"functions": [{"name": "@main", "constants": [1, 1, "x"], "code": ["RETURN"]}]}"#;
        let funcs = Program::from_json(text).unwrap().build(&mut heap, true).unwrap();
        assert_eq!(funcs[0].constants.len(), 3);
    }

    #[test]
    fn unknown_mnemonic_names_function_and_pc() {
        let mut heap = Heap::new();
        let text = r#"{"functions": [{"name": "f", "code": ["NOOP", "FROB"]}]}"#;
        let err = Program::from_json(text).unwrap().build(&mut heap, true).unwrap_err();
        assert_eq!(err.to_string(), "in function 'f' at 1: unknown opcode 'FROB'");
    }

    #[test]
    fn shape_errors_only_when_checked() {
        let mut heap = Heap::new();
        let text = r#"{"functions": [{"name": "f", "code": [{"op": "LOAD_rA_iBC", "args": [1]}]}]}"#;
        let program = Program::from_json(text).unwrap();
        assert!(matches!(program.build(&mut heap, true), Err(ProgramError::Emit { .. })));
        assert!(program.build(&mut heap, false).is_ok());
    }

    #[test]
    fn container_constants_are_rejected() {
        let mut heap = Heap::new();
        let text = r#"{"functions": [{"name": "f", "constants": [[1, 2]]}]}"#;
        let err = Program::from_json(text).unwrap().build(&mut heap, true).unwrap_err();
        assert!(matches!(err, ProgramError::UnsupportedConstant { .. }));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(Program::from_json("{"), Err(ProgramError::Json(_))));
    }
}
