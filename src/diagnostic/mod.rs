pub mod ansi;
pub mod json;

use crate::error::VmError;
use crate::vm::RuntimeFault;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Where in the bytecode a diagnostic points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    pub pc: usize,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub location: Option<Location>,
    /// Disassembled instruction at the location, shown like a source line.
    pub instruction: Option<String>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            location: None,
            instruction: None,
            notes: Vec::new(),
            suggestion: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn at(mut self, function: impl Into<String>, pc: usize) -> Self {
        self.location = Some(Location { function: function.into(), pc });
        self
    }

    pub fn with_instruction(mut self, text: impl Into<String>) -> Self {
        self.instruction = Some(text.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

// ---- From impls for runtime error types ----

impl From<&VmError> for Diagnostic {
    fn from(e: &VmError) -> Self {
        let d = Diagnostic::error(e.to_string()).with_code(e.code());
        match e {
            VmError::TooManyArguments { expected, .. } => {
                d.with_note(format!("the callee accepts at most {expected} argument(s)"))
            }
            VmError::CallStackOverflow => {
                d.with_suggestion("check for unbounded recursion, or raise --call-slots")
            }
            VmError::StackOverflow { .. } => d.with_suggestion("raise --stack-slots"),
            VmError::UndefinedIdentifier { .. } => {
                d.with_note("looked in the closure, the globals and the intrinsics")
            }
            VmError::OutOfMemory { .. } => d.with_note("a forced collection did not free enough memory"),
            _ => d,
        }
    }
}

impl From<&RuntimeFault> for Diagnostic {
    fn from(f: &RuntimeFault) -> Self {
        Diagnostic::from(&f.error).at(&f.function, f.pc)
    }
}
