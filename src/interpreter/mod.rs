//! The interpreter aggregate and the embedding API.
//!
//! One `Interpreter` owns everything the compiler and the VM share: the
//! constant pool, globals, the root symbol table, the memory manager,
//! options, builtins and the value/frame stacks. Nothing is process-global.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;

use crate::artifact::ArtifactError;
use crate::builtins;
use crate::compiler::{self, CompileError};
use crate::gc::{GcStats, MemoryManager};
use crate::options::Options;
use crate::symbols::{Scope, SymbolTable};
use crate::value::{Builtin, BuiltinFn, Closure, Function, Map, Payload, Value, ValueType};
use crate::vm::{Frame, RuntimeError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Compile(e) => e.code,
            Error::Runtime(e) => e.code,
            Error::Artifact(e) => e.code(),
            Error::Io { .. } => "QL-C010",
        }
    }
}

/// Output sink that can be read back, for hosts and tests that capture
/// `print`/`println`.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        SharedOutput::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Interpreter {
    pub(crate) constants: Vec<Value>,
    pub(crate) globals: Vec<Value>,
    pub(crate) symbols: SymbolTable,
    pub(crate) options: Options,
    pub(crate) builtins: Vec<Value>,
    /// Export maps of pre-built modules, by canonical path.
    pub(crate) modules: HashMap<String, Value>,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    /// Live `call_nested` activations.
    pub(crate) nesting: usize,
    /// Values the host asked to keep alive; one entry per `pin`.
    pinned: Vec<Value>,
    /// Result of the latest `run`/`call`, rooted until the next one returns.
    last_result: Value,
    output: Box<dyn Write>,
    next_function_id: usize,
    pub(crate) heap: MemoryManager,
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let heap = MemoryManager::new(options.gc_initial_trigger, options.gc_grow_factor, options.gc_max_heap);
        let mut interp = Interpreter {
            constants: Vec::new(),
            globals: Vec::new(),
            symbols: SymbolTable::new(),
            options,
            builtins: Vec::new(),
            modules: HashMap::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            nesting: 0,
            pinned: Vec::new(),
            last_result: Value::NULL,
            output: Box::new(io::stdout()),
            next_function_id: 0,
            heap,
        };
        for ty in ValueType::ALL {
            interp.symbols.define_type(ty);
        }
        builtins::register_core(&mut interp);
        interp
    }

    /// Redirect `print`/`println`.
    pub fn with_output(mut self, output: impl Write + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Change options from the host. GC tuning applies from the next cycle.
    pub fn set_options(&mut self, options: Options) {
        self.options = options;
        self.apply_gc_options();
    }

    pub(crate) fn apply_gc_options(&mut self) {
        let opts = &self.options;
        self.heap.configure(opts.gc_initial_trigger, opts.gc_grow_factor, opts.gc_max_heap);
    }

    /// Bind `name` as a global. Rebinding an existing global overwrites it.
    pub fn define(&mut self, name: &str, value: Value) {
        let index = match self.symbols.lookup_here(name) {
            Some(symbol) if symbol.scope == Scope::Global => symbol.index,
            _ => self.symbols.define(name).index,
        };
        self.ensure_global(index);
        self.globals[index] = value;
    }

    /// Value bound to a global, builtin or type name.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        let symbol = self.symbols.lookup_here(name)?;
        match symbol.scope {
            Scope::Global => self.globals.get(symbol.index).copied(),
            Scope::Builtin => self.builtins.get(symbol.index).copied(),
            Scope::Type => ValueType::from_u8(symbol.index as u8).map(Value::type_tag),
            _ => None,
        }
    }

    pub fn register_builtin(&mut self, name: &str, func: BuiltinFn) {
        let value = self.heap.alloc(Payload::Builtin(Builtin { name: name.to_string(), func }));
        let index = self.builtins.len();
        self.builtins.push(value);
        self.symbols.define_builtin(index, name);
    }

    /// Registered builtins with their slot index.
    pub(crate) fn builtin_names(&self) -> Vec<(String, usize)> {
        self.builtins
            .iter()
            .enumerate()
            .filter_map(|(i, value)| match &*value.as_object()?.payload() {
                Payload::Builtin(b) => Some((b.name.clone(), i)),
                _ => None,
            })
            .collect()
    }

    /// Compile a program into a zero-argument closure.
    pub fn compile(&mut self, source: &str, filename: &str) -> Result<Value, CompileError> {
        let function = compiler::compile_program(self, source, filename)?;
        Ok(self.heap.alloc(Payload::Closure(Closure { function, free: Vec::new() })))
    }

    /// Compile and execute. Returns the value of a trailing expression
    /// statement, or null.
    ///
    /// The result stays reachable until the next `run` or `call` returns;
    /// `pin` it to hold it longer.
    pub fn run(&mut self, source: &str, filename: &str) -> Result<Value, Error> {
        let closure = self.compile(source, filename)?;
        self.call(closure, &[])
    }

    pub fn run_file(&mut self, path: &Path) -> Result<Value, Error> {
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.run(&source, &path.to_string_lossy())
    }

    /// Invoke any callable value from host code. The result is rooted
    /// like the result of `run`.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Value, Error> {
        let result = self.call_nested(callee, args)?;
        self.last_result = result;
        Ok(result)
    }

    /// Keep `value` alive across collections until a matching `unpin`.
    /// Pins nest: a value pinned twice needs two unpins.
    pub fn pin(&mut self, value: Value) -> Value {
        if value.is_object() {
            self.pinned.push(value);
        }
        value
    }

    pub fn unpin(&mut self, value: Value) {
        if let Some(at) = self.pinned.iter().rposition(|&v| v == value) {
            self.pinned.swap_remove(at);
        }
    }

    /// Full mark/sweep cycle; returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let heap = &self.heap;
        heap.mark_range(self.stack.iter().copied());
        for frame in &self.frames {
            heap.mark(frame.closure);
            heap.mark_range(frame.defers.iter().copied());
        }
        heap.mark_range(self.globals.iter().copied());
        heap.mark_range(self.constants.iter().copied());
        heap.mark_range(self.builtins.iter().copied());
        heap.mark_range(self.modules.values().copied());
        heap.mark_range(self.pinned.iter().copied());
        heap.mark(self.last_result);
        self.heap.sweep()
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// The compiled body behind `closure` and the shared pool its CONST
    /// operands index.
    pub fn code(&self, closure: Value) -> Option<(Rc<Function>, &[Value])> {
        let function = match &*closure.as_object()?.payload() {
            Payload::Closure(c) => c.function,
            _ => return None,
        };
        let function = match &*function.as_object()?.payload() {
            Payload::Function(f) => Rc::clone(f),
            _ => return None,
        };
        Some((function, &self.constants))
    }

    pub fn string(&mut self, s: impl Into<String>) -> Value {
        self.heap.string(s)
    }

    pub fn error(&mut self, msg: impl Into<String>) -> Value {
        self.heap.error(msg)
    }

    pub fn list(&mut self, items: Vec<Value>) -> Value {
        self.heap.list(items)
    }

    pub fn map<K: Into<String>>(&mut self, entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        let mut map = Map::new();
        for (key, value) in entries {
            map.insert(key.into(), value);
        }
        self.heap.alloc(Payload::Map(map))
    }

    /// Write program output; errors on the sink are logged and dropped.
    pub fn write_output(&mut self, text: &str) {
        if let Err(err) = self.output.write_all(text.as_bytes()) {
            log::warn!("output write failed: {err}");
        }
    }

    pub fn flush_output(&mut self) {
        if let Err(err) = self.output.flush() {
            log::warn!("output flush failed: {err}");
        }
    }

    pub(crate) fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub(crate) fn next_function_id(&mut self) -> usize {
        self.next_function_id += 1;
        self.next_function_id
    }

    pub(crate) fn ensure_global(&mut self, index: usize) {
        if self.globals.len() <= index {
            self.globals.resize(index + 1, Value::NULL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Result<Value, Error>, String) {
        let out = SharedOutput::new();
        let mut interp = Interpreter::new().with_output(out.clone());
        let result = interp.run(source, "test.ql");
        (result, out.contents())
    }

    #[test]
    fn run_returns_trailing_expression() {
        let mut interp = Interpreter::new();
        let v = interp.run("1 + 2;", "t.ql").unwrap();
        assert_eq!(v.as_int(), Some(3));
        let v = interp.run("let x = 5;", "t.ql").unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn code_exposes_instructions_and_constants() {
        let mut interp = Interpreter::new();
        let closure = interp.compile("\"hi\";", "t.ql").unwrap();
        let (function, constants) = interp.code(closure).unwrap();
        assert_eq!(function.instructions.first(), Some(&(crate::bytecode::Op::Const as u8)));
        assert_eq!(function.instructions.last(), Some(&(crate::bytecode::Op::Hlt as u8)));
        assert!(constants.iter().any(|c| c.as_str().as_deref() == Some("hi")));
        assert!(interp.code(Value::int(1)).is_none());
    }

    #[test]
    fn define_and_resolve_globals() {
        let mut interp = Interpreter::new();
        interp.define("answer", Value::int(42));
        assert_eq!(interp.resolve("answer"), Some(Value::int(42)));
        let v = interp.run("answer * 2;", "t.ql").unwrap();
        assert_eq!(v.as_int(), Some(84));
        interp.define("answer", Value::int(1));
        assert_eq!(interp.resolve("answer"), Some(Value::int(1)));
        assert_eq!(interp.resolve("Integer"), Some(Value::type_tag(ValueType::Integer)));
        assert!(interp.resolve("missing").is_none());
    }

    #[test]
    fn globals_persist_between_runs() {
        let mut interp = Interpreter::new();
        interp.run("let counter = 10;", "a.ql").unwrap();
        interp.run("counter = counter + 1;", "b.ql").unwrap();
        assert_eq!(interp.resolve("counter"), Some(Value::int(11)));
    }

    fn twice(args: &[Value], _: &mut Interpreter) -> Value {
        match args.first().and_then(|v| v.as_int()) {
            Some(n) => Value::int(n * 2),
            None => Value::NULL,
        }
    }

    #[test]
    fn host_builtins_are_callable() {
        let mut interp = Interpreter::new();
        interp.register_builtin("twice", twice);
        let v = interp.run("twice(21);", "t.ql").unwrap();
        assert_eq!(v.as_int(), Some(42));
    }

    #[test]
    fn call_invokes_script_closures() {
        let mut interp = Interpreter::new();
        interp.run("let add = fun(a, b) { return a + b; };", "t.ql").unwrap();
        let add = interp.resolve("add").unwrap();
        let v = interp.call(add, &[Value::int(2), Value::int(3)]).unwrap();
        assert_eq!(v.as_int(), Some(5));
        assert!(interp.stack.is_empty());
        assert!(interp.frames.is_empty());
    }

    #[test]
    fn errors_leave_interpreter_usable() {
        let mut interp = Interpreter::new();
        let err = interp.run("let f = fun() { return 1 / 0; }; f();", "t.ql").unwrap_err();
        assert_eq!(err.code(), "QL-R006");
        assert!(interp.stack.is_empty());
        assert!(interp.frames.is_empty());
        assert_eq!(interp.run("2;", "t.ql").unwrap().as_int(), Some(2));
    }

    #[test]
    fn compile_errors_surface_as_errors() {
        let (result, _) = run("println(nope);");
        match result {
            Err(Error::Compile(e)) => {
                assert_eq!(e.code, "QL-C002");
                assert_eq!(e.line, 1);
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn output_is_captured() {
        let (result, out) = run("println(\"hi\"); print(1, 2);");
        assert!(result.is_ok());
        assert_eq!(out, "hi\n1 2");
    }

    #[test]
    fn gc_keeps_globals_alive() {
        let mut interp = Interpreter::new();
        interp.run("let keep = [\"a\", \"b\"]; let i = 0; for (i < 100) { [i, i]; i = i + 1; }", "t.ql").unwrap();
        let before = interp.heap.len();
        let freed = interp.collect_garbage();
        assert!(freed > 0);
        assert_eq!(interp.heap.len(), before - freed);
        let keep = interp.resolve("keep").unwrap();
        assert_eq!(keep.to_string(), "[\"a\", \"b\"]");
    }
}
