//! quill: a small dynamically typed scripting language.
//!
//! Source is compiled in one pass to bytecode and run on a stack VM with
//! NaN-boxed values and a mark/sweep collector. [`Interpreter`] is the
//! embedding entry point.

pub mod artifact;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod gc;
pub mod interpreter;
pub mod lexer;
pub mod options;
pub mod source;
pub mod symbols;
pub mod value;
pub mod vm;

pub use interpreter::{Error, Interpreter, SharedOutput};
pub use options::Options;
pub use value::{Value, ValueType};
