use thiserror::Error;

/// Every failure the runtime can raise. The `Display` text is the message
/// recorded by [`Vm::raise_runtime_error`](crate::vm::Vm::raise_runtime_error).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("Too many arguments: got {got}, expected {expected}")]
    TooManyArguments { got: usize, expected: usize },
    #[error("Call stack overflow")]
    CallStackOverflow,
    #[error("Stack overflow: frame needs {needed} slots, stack has {available}")]
    StackOverflow { needed: usize, available: usize },
    #[error("Undefined Identifier: '{name}' is unknown in this context")]
    UndefinedIdentifier { name: String },
    #[error("Index Error: index {index} out of range (size {len})")]
    IndexOutOfRange { index: i32, len: usize },
    #[error("Key Not Found: '{key}' not found in map")]
    KeyNotFound { key: String },
    #[error("Type Error: expected {expected}, got {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },
    #[error("Can't index into {container}")]
    NotIndexable { container: String },
    #[error("Can't set indexed value in {container}")]
    NotIndexAssignable { container: String },
    #[error("Can't slice {container}")]
    NotSliceable { container: String },
    #[error("Can't get len of {container}")]
    NoLength { container: String },
    #[error("Attempt to modify a frozen {kind}")]
    FrozenMutation { kind: &'static str },
    #[error("{0}")]
    Sequencing(&'static str),
    #[error("Unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("Invalid function index {index}")]
    InvalidFunction { index: usize },
    #[error("unknown opcode: {op}")]
    UnknownOpcode { op: u8 },
    #[error("PC out of bounds in {function}")]
    PcOutOfBounds { function: String },
    #[error("No @main function found")]
    NoEntryFunction,
    #[error("Entry function has no code")]
    EmptyEntryFunction,
    #[error("stale heap reference")]
    StaleReference,
    #[error("Out of memory: allocation of {requested} bytes exceeds the heap limit")]
    OutOfMemory { requested: usize },
    #[error("{0}")]
    Native(String),
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// Short machine-readable code used by the diagnostic renderers.
    pub fn code(&self) -> &'static str {
        match self {
            VmError::TooManyArguments { .. } => "R001",
            VmError::CallStackOverflow | VmError::StackOverflow { .. } => "R002",
            VmError::UndefinedIdentifier { .. } => "R003",
            VmError::IndexOutOfRange { .. } => "R004",
            VmError::KeyNotFound { .. } => "R005",
            VmError::TypeMismatch { .. }
            | VmError::NotIndexable { .. }
            | VmError::NotIndexAssignable { .. }
            | VmError::NotSliceable { .. }
            | VmError::NoLength { .. } => "R006",
            VmError::FrozenMutation { .. } => "R007",
            VmError::Sequencing(_)
            | VmError::UnknownOpcode { .. }
            | VmError::PcOutOfBounds { .. }
            | VmError::InvalidFunction { .. } => "R008",
            VmError::UnknownFunction { .. } | VmError::NoEntryFunction | VmError::EmptyEntryFunction => "R009",
            VmError::StaleReference => "R010",
            VmError::OutOfMemory { .. } => "R011",
            VmError::Native(_) => "R012",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_runtime_wording() {
        let e = VmError::TooManyArguments { got: 3, expected: 1 };
        assert_eq!(e.to_string(), "Too many arguments: got 3, expected 1");
        let e = VmError::UndefinedIdentifier { name: "foo".into() };
        assert_eq!(e.to_string(), "Undefined Identifier: 'foo' is unknown in this context");
        let e = VmError::FrozenMutation { kind: "list" };
        assert_eq!(e.to_string(), "Attempt to modify a frozen list");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(VmError::OutOfMemory { requested: 8 }.code(), "R011");
        assert_eq!(VmError::Sequencing("x").code(), "R008");
    }
}
