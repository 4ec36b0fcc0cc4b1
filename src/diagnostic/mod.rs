pub mod ansi;
pub mod json;
pub mod registry;

use crate::artifact::ArtifactError;
use crate::compiler::{CompileError, CompileErrorKind};
use crate::interpreter::Error;
use crate::lexer::LexError;
use crate::source::Span;
use crate::vm::RuntimeError;

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<&'static str>,
    pub message: String,
    /// File the labels point into.
    pub filename: Option<String>,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            message: message.into(),
            filename: None,
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into() });
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

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for the error types ----

impl From<&LexError> for Diagnostic {
    fn from(e: &LexError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here")
    }
}

fn suggestion_for(kind: &CompileErrorKind) -> Option<String> {
    match kind {
        CompileErrorKind::UndefinedVariable(name) => Some(format!("declare it first: `let {name} = ...;`")),
        CompileErrorKind::DuplicateDefinition(name) => Some(format!("assign without `let`: `{name} = ...;`")),
        CompileErrorKind::ModuleNotFound(_) => Some("check SEARCH_PATH or pass --search-path".into()),
        _ => None,
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let mut d = Diagnostic::error(e.message())
            .with_code(e.code)
            .with_filename(&e.filename)
            .with_span(e.span, "here");
        if let Some(hint) = suggestion_for(&e.kind) {
            d = d.with_suggestion(hint);
        }
        d
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(e: &RuntimeError) -> Self {
        let mut d = Diagnostic::error(e.message()).with_code(e.code);
        if let Some(innermost) = e.trace.first() {
            d = d.with_filename(&innermost.filename);
        }
        for entry in &e.trace {
            d = d.with_note(format!("at {entry}"));
        }
        d
    }
}

impl From<&ArtifactError> for Diagnostic {
    fn from(e: &ArtifactError) -> Self {
        Diagnostic::error(e.to_string()).with_code(e.code())
    }
}

impl From<&Error> for Diagnostic {
    fn from(e: &Error) -> Self {
        match e {
            Error::Compile(e) => e.into(),
            Error::Runtime(e) => e.into(),
            Error::Artifact(e) => e.into(),
            Error::Io { .. } => Diagnostic::error(e.to_string()).with_code(e.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Position;
    use crate::vm::{RuntimeErrorKind, TraceEntry};

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.message, "something went wrong");
        assert!(d.code.is_none());
        assert!(d.labels.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn diagnostic_with_span() {
        let d = Diagnostic::error("bad token").with_span(Span::new(5, 8), "here");
        assert_eq!(d.labels.len(), 1);
        assert_eq!(d.labels[0].span, Span::new(5, 8));
        assert_eq!(d.labels[0].message, "here");
    }

    #[test]
    fn from_lex_error() {
        let e = crate::lexer::lex("let a = 1 § 2;").unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("QL-L001"));
        assert!(d.message.contains('§'));
        assert_eq!(d.labels[0].span.start, 10);
    }

    #[test]
    fn from_compile_error_adds_hint() {
        let e = CompileError::new(
            CompileErrorKind::UndefinedVariable("x".into()),
            "main.ql",
            Position { line: 1, column: 7 },
            Span::new(6, 7),
        );
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("QL-C002"));
        assert_eq!(d.filename.as_deref(), Some("main.ql"));
        assert!(d.message.contains("undefined variable 'x'"));
        assert!(d.suggestion.unwrap().contains("let x"));
    }

    #[test]
    fn from_runtime_error_lists_trace() {
        let e = RuntimeError {
            code: "QL-R006",
            kind: RuntimeErrorKind::DivisionByZero,
            trace: vec![
                TraceEntry { function: "f".into(), filename: "a.ql".into(), line: 2 },
                TraceEntry { function: "<script>".into(), filename: "a.ql".into(), line: 5 },
            ],
        };
        let d = Diagnostic::from(&e);
        assert!(d.labels.is_empty());
        assert_eq!(d.notes, vec!["at a.ql:2 in f", "at a.ql:5 in <script>"]);
    }

    #[test]
    fn every_emitted_code_is_registered() {
        let e = crate::interpreter::Interpreter::new().run("1 / 0;", "t.ql").unwrap_err();
        let d = Diagnostic::from(&e);
        assert!(registry::lookup(d.code.unwrap()).is_some());
    }
}
