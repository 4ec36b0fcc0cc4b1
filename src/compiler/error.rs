use crate::options::OptionError;
use crate::source::{Position, Span};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("{0}")]
    Syntax(String),
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("'{0}' is already defined in this scope")]
    DuplicateDefinition(String),
    #[error("invalid value for option: {0}")]
    InvalidOption(String),
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("source requires language version {required}, this is version {supported}")]
    VersionTooOld { required: i64, supported: i64 },
    #[error("too many parameters (limit is {0})")]
    TooManyParameters(usize),
    #[error("too many constants in one program (limit is {})", u16::MAX)]
    TooManyConstants,
    #[error("unknown escape sequence '\\{0}'")]
    InvalidEscape(char),
    #[error("malformed number literal '{0}'")]
    InvalidNumber(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected character(s) '{0}'")]
    UnexpectedCharacter(String),
    #[error("module '{0}' not found in search path")]
    ModuleNotFound(String),
    #[error("cannot read module '{path}': {reason}")]
    ModuleIo { path: String, reason: String },
    #[error("'{0}' is reserved")]
    Reserved(String),
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,
    #[error("jump target beyond {} bytes", u16::MAX)]
    JumpTooFar,
    #[error("'{0}' outside of a loop")]
    LoopControlOutsideLoop(&'static str),
}

impl CompileErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            CompileErrorKind::UnexpectedCharacter(_) => "QL-L001",
            CompileErrorKind::UnterminatedString => "QL-L002",
            CompileErrorKind::InvalidEscape(_) => "QL-L003",
            CompileErrorKind::InvalidNumber(_) => "QL-L004",
            CompileErrorKind::Syntax(_) => "QL-C001",
            CompileErrorKind::UndefinedVariable(_) => "QL-C002",
            CompileErrorKind::DuplicateDefinition(_) => "QL-C003",
            CompileErrorKind::InvalidOption(_) => "QL-C004",
            CompileErrorKind::UnknownOption(_) => "QL-C005",
            CompileErrorKind::VersionTooOld { .. } => "QL-C006",
            CompileErrorKind::TooManyParameters(_) => "QL-C007",
            CompileErrorKind::TooManyConstants => "QL-C008",
            CompileErrorKind::ModuleNotFound(_) => "QL-C009",
            CompileErrorKind::ModuleIo { .. } => "QL-C010",
            CompileErrorKind::Reserved(_) => "QL-C011",
            CompileErrorKind::InvalidAssignmentTarget => "QL-C012",
            CompileErrorKind::JumpTooFar => "QL-C013",
            CompileErrorKind::LoopControlOutsideLoop(_) => "QL-C014",
        }
    }
}

impl From<OptionError> for CompileErrorKind {
    fn from(err: OptionError) -> Self {
        match err {
            OptionError::Unknown(name) => CompileErrorKind::UnknownOption(name),
            OptionError::VersionTooOld { required } => CompileErrorKind::VersionTooOld {
                required,
                supported: crate::options::LANGUAGE_VERSION,
            },
            other => CompileErrorKind::InvalidOption(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{filename}:{line}:{column}: {kind}")]
pub struct CompileError {
    pub code: &'static str,
    pub kind: CompileErrorKind,
    pub filename: String,
    pub line: usize,
    pub column: usize,
    pub span: Span,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, filename: &str, position: Position, span: Span) -> Self {
        CompileError {
            code: kind.code(),
            kind,
            filename: filename.to_string(),
            line: position.line,
            column: position.column,
            span,
        }
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}
