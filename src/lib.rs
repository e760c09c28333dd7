//! scriptvm: the runtime core of a small dynamic scripting language.
//!
//! A register-machine bytecode interpreter over a tagged [`Value`], a
//! tracing mark-and-sweep [`Heap`] with explicit rooting, and the list,
//! map and VarMap collections the interpreter is built on.

pub mod bytecode;
pub mod collections;
pub mod diagnostic;
pub mod error;
pub mod gc;
pub mod program;
pub mod value;
pub mod vm;

pub use bytecode::{FuncDef, FuncDefBuilder, Opcode};
pub use error::{VmError, VmResult};
pub use gc::{GcConfig, Heap};
pub use value::{Value, ValueKind};
pub use vm::{RunState, Vm, VmConfig};
