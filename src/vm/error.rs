use std::fmt;

use crate::value::ValueType;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeErrorKind {
    #[error("unsupported binary operator '{op}' for {left} and {right}")]
    UnsupportedOperator { op: &'static str, left: ValueType, right: ValueType },
    #[error("unsupported unary operator '{op}' for {operand}")]
    UnsupportedUnary { op: &'static str, operand: ValueType },
    #[error("{callee} expects {expected} argument(s), got {got}")]
    Arity { callee: String, expected: usize, got: usize },
    #[error("{callee} needs at least {min} argument(s), got {got}")]
    VariadicShortfall { callee: String, min: usize, got: usize },
    #[error("index {index} out of bounds for {container} of length {len}")]
    IndexOutOfBounds { container: ValueType, index: i64, len: usize },
    #[error("cannot index {container} with {index}")]
    BadIndex { container: ValueType, index: ValueType },
    #[error("cannot assign {value} into {container}")]
    BadElement { container: ValueType, value: ValueType },
    #[error("{0} has no length")]
    NoLength(ValueType),
    #[error("can't call {0}")]
    NotCallable(ValueType),
    #[error("division by zero")]
    DivisionByZero,
    #[error("cannot convert {from} to {to}")]
    InvalidCast { from: ValueType, to: ValueType },
    #[error("cannot parse {0:?} as a number")]
    NotANumber(String),
    #[error("map keys must be strings, got {0}")]
    MapKey(ValueType),
    #[error("{0}")]
    Raised(String),
    #[error("heap exhausted: {live} live objects exceed the limit of {limit}")]
    HeapExhausted { live: usize, limit: usize },
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),
    #[error("module '{path}': {reason}")]
    Module { path: String, reason: String },
}

impl RuntimeErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeErrorKind::UnsupportedOperator { .. } | RuntimeErrorKind::UnsupportedUnary { .. } => "QL-R001",
            RuntimeErrorKind::Arity { .. } | RuntimeErrorKind::VariadicShortfall { .. } => "QL-R002",
            RuntimeErrorKind::IndexOutOfBounds { .. } => "QL-R003",
            RuntimeErrorKind::BadIndex { .. }
            | RuntimeErrorKind::BadElement { .. }
            | RuntimeErrorKind::NoLength(_)
            | RuntimeErrorKind::MapKey(_) => "QL-R004",
            RuntimeErrorKind::NotCallable(_) => "QL-R005",
            RuntimeErrorKind::DivisionByZero => "QL-R006",
            RuntimeErrorKind::InvalidCast { .. } | RuntimeErrorKind::NotANumber(_) => "QL-R007",
            RuntimeErrorKind::Raised(_) => "QL-R008",
            RuntimeErrorKind::HeapExhausted { .. } => "QL-R009",
            RuntimeErrorKind::StackOverflow => "QL-R010",
            RuntimeErrorKind::InvalidBytecode(_) => "QL-R011",
            RuntimeErrorKind::Module { .. } => "QL-R012",
        }
    }
}

/// One frame of a runtime traceback.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub function: String,
    pub filename: String,
    pub line: u32,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.filename, self.line, self.function)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}")]
pub struct RuntimeError {
    pub code: &'static str,
    pub kind: RuntimeErrorKind,
    /// Innermost frame first.
    pub trace: Vec<TraceEntry>,
}

impl RuntimeError {
    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    /// Line of the innermost frame, 0 when unknown.
    pub fn line(&self) -> u32 {
        self.trace.first().map(|t| t.line).unwrap_or(0)
    }
}

impl From<RuntimeErrorKind> for RuntimeError {
    fn from(kind: RuntimeErrorKind) -> Self {
        RuntimeError { code: kind.code(), kind, trace: Vec::new() }
    }
}
