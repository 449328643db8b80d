//! Diagnostics and the engine's error taxonomy.
//!
//! Every fallible operation in the engine returns [`EngineResult`].
//! Runtime faults become [`Diagnostic`]s that carry an [`ErrorKind`],
//! a message, and a stack of source positions (innermost frame
//! first); they are modelled as a control-flow escape (spec.md §5,
//! "Fault isolation"), never recovered locally.

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

pub type EngineResult<T> = Result<T, RunError>;

/// A location in compiler-emitted source, carried on AST nodes and
/// instructions (spec.md §6.1/§6.2) and attached to diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct CodeRange {
    pub filename: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl fmt::Display for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.column)
    }
}

/// The fixed enumeration of runtime error classes (spec.md §6.3/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
pub enum ErrorKind {
    Evaluation,
    Attribute,
    Type,
    Recursion,
    SchemaCheck,
    CannotAddMembers,
    Immutable,
    Assertion,
    RecursiveLoad,
    CycleInherit,
    MultiInherit,
    IndexSignature,
    Name,
    Value,
    Key,
    UniqueKey,
    IllegalArgument,
    IllegalAttribute,
    IllegalInherit,
    Compile,
    InvalidFormatSpec,
    Plan,
}

/// A structured runtime diagnostic. Warnings reuse this shape but are
/// pushed to the non-fatal side channel instead of propagated as an
/// error (spec.md §7).
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub frames: Vec<CodeRange>,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), frames: Vec::new() }
    }

    #[must_use]
    pub fn with_position(mut self, pos: CodeRange) -> Self {
        self.frames.push(pos);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(pos) = self.frames.first() {
            write!(f, " ({pos})")?;
        }
        Ok(())
    }
}

/// The error type every engine operation returns. `Internal` is
/// reserved for engine-side invariant violations (a corrupt heap
/// index, an impossible opcode operand) that user code cannot trigger
/// and should never be pattern-matched on by a host.
#[derive(Debug, Clone, PartialEq)]
pub enum RunError {
    Diagnostic(Box<Diagnostic>),
    Internal(String),
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Diagnostic(Box::new(Diagnostic::new(kind, message)))
    }

    #[must_use]
    pub fn with_position(self, pos: CodeRange) -> Self {
        match self {
            Self::Diagnostic(d) => Self::Diagnostic(Box::new(d.with_position(pos))),
            other @ Self::Internal(_) => other,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Diagnostic(d) => Some(d.kind),
            Self::Internal(_) => None,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diagnostic(d) => write!(f, "{d}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<Diagnostic> for RunError {
    fn from(d: Diagnostic) -> Self {
        Self::Diagnostic(Box::new(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_display_includes_kind_and_position() {
        let d = Diagnostic::new(ErrorKind::UniqueKey, "conflicting values on the attribute 'k'")
            .with_position(CodeRange { filename: "a.k".into(), line: 3, column: 1, ..Default::default() });
        let rendered = d.to_string();
        assert!(rendered.contains("UniqueKey"));
        assert!(rendered.contains("a.k:3:1"));
    }

    #[test]
    fn run_error_kind_is_none_for_internal() {
        let err = RunError::Internal("heap corruption".into());
        assert_eq!(err.kind(), None);
    }
}
