//! Compiler and VM options, set from the host or by `#![NAME(value)]`.

use std::path::PathBuf;

use thiserror::Error;

/// Language version implemented by this crate.
pub const LANGUAGE_VERSION: i64 = 1;

pub const DEFAULT_SEARCH_PATH: &str = ".:/usr/local/share/quill";

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Decimal(f64),
    Str(String),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "boolean",
            OptionValue::Int(_) => "integer",
            OptionValue::Decimal(_) => "decimal",
            OptionValue::Str(_) => "string",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum OptionError {
    #[error("unknown option '{0}'")]
    Unknown(String),
    #[error("option '{name}' expects a {expected}, got a {found}")]
    Mismatch { name: &'static str, expected: &'static str, found: &'static str },
    #[error("option '{name}' must be positive")]
    OutOfRange { name: &'static str },
    #[error("source requires version {required}, this is version {}", LANGUAGE_VERSION)]
    VersionTooOld { required: i64 },
}

#[derive(Debug, Clone)]
pub struct Options {
    pub version: i64,
    pub search_path: String,
    pub gc_grow_factor: f64,
    pub gc_initial_trigger: usize,
    pub gc_max_heap: usize,
    pub debug: bool,
    pub break_each: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            version: LANGUAGE_VERSION,
            search_path: std::env::var("QUILL_PATH").unwrap_or_else(|_| DEFAULT_SEARCH_PATH.to_string()),
            gc_grow_factor: 2.0,
            gc_initial_trigger: 1024,
            gc_max_heap: 1 << 24,
            debug: false,
            break_each: false,
        }
    }
}

impl Options {
    pub const NAMES: [&'static str; 7] = [
        "VERSION",
        "SEARCH_PATH",
        "GC_HEAP_GROW_FACTOR",
        "GC_INITIAL_TRIGGER",
        "GC_MAX_HEAP",
        "DEBUG",
        "BREAK",
    ];

    pub fn set(&mut self, name: &str, value: OptionValue) -> Result<(), OptionError> {
        match name {
            "VERSION" => {
                let required = int("VERSION", &value)?;
                if required > LANGUAGE_VERSION {
                    return Err(OptionError::VersionTooOld { required });
                }
                self.version = required;
            }
            "SEARCH_PATH" => match value {
                OptionValue::Str(path) => self.search_path = path,
                other => return Err(mismatch("SEARCH_PATH", "string", &other)),
            },
            "GC_HEAP_GROW_FACTOR" => {
                let factor = match value {
                    OptionValue::Decimal(d) => d,
                    OptionValue::Int(n) => n as f64,
                    other => return Err(mismatch("GC_HEAP_GROW_FACTOR", "decimal", &other)),
                };
                if factor.is_nan() || factor < 1.0 {
                    return Err(OptionError::OutOfRange { name: "GC_HEAP_GROW_FACTOR" });
                }
                self.gc_grow_factor = factor;
            }
            "GC_INITIAL_TRIGGER" => self.gc_initial_trigger = count("GC_INITIAL_TRIGGER", &value)?,
            "GC_MAX_HEAP" => self.gc_max_heap = count("GC_MAX_HEAP", &value)?,
            "DEBUG" => self.debug = flag("DEBUG", &value)?,
            "BREAK" => self.break_each = flag("BREAK", &value)?,
            other => return Err(OptionError::Unknown(other.to_string())),
        }
        Ok(())
    }

    /// Search roots in order, with `first` (the including file's directory)
    /// ahead of the configured ones.
    pub fn search_roots(&self, first: Option<PathBuf>) -> Vec<PathBuf> {
        first
            .into_iter()
            .chain(self.search_path.split(':').filter(|s| !s.is_empty()).map(PathBuf::from))
            .collect()
    }
}

fn mismatch(name: &'static str, expected: &'static str, found: &OptionValue) -> OptionError {
    OptionError::Mismatch { name, expected, found: found.type_name() }
}

fn int(name: &'static str, value: &OptionValue) -> Result<i64, OptionError> {
    match value {
        OptionValue::Int(n) => Ok(*n),
        other => Err(mismatch(name, "integer", other)),
    }
}

fn count(name: &'static str, value: &OptionValue) -> Result<usize, OptionError> {
    let n = int(name, value)?;
    usize::try_from(n).ok().filter(|&n| n > 0).ok_or(OptionError::OutOfRange { name })
}

fn flag(name: &'static str, value: &OptionValue) -> Result<bool, OptionError> {
    match value {
        OptionValue::Bool(b) => Ok(*b),
        OptionValue::Int(n) => Ok(*n != 0),
        other => Err(mismatch(name, "boolean", other)),
    }
}
