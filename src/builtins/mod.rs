//! The core builtin set registered on every interpreter.
//!
//! Builtins follow the host contract `fn(&[Value], &mut Interpreter) ->
//! Value`. Failure is reported by returning an Error value, which the VM
//! turns into a runtime error.

use std::ffi::c_void;

use crate::interpreter::Interpreter;
use crate::value::{BuiltinFn, Payload, Value, ValueType};

pub const CORE: [(&str, BuiltinFn); 12] = [
    ("print", print),
    ("println", println),
    ("len", len),
    ("append", append),
    ("range", range),
    ("pop", pop),
    ("clone", clone),
    ("eval", eval),
    ("alloc", alloc),
    ("free", free),
    ("bound", bound),
    ("gc", gc),
];

/// Most elements `range` will materialize.
pub const RANGE_LIMIT: i64 = 1 << 24;

pub fn register_core(interp: &mut Interpreter) {
    for (name, func) in CORE {
        interp.register_builtin(name, func);
    }
}

fn arity(interp: &mut Interpreter, name: &str, expected: usize, args: &[Value]) -> Option<Value> {
    if args.len() == expected {
        None
    } else {
        Some(interp.error(format!("{name}: expected {expected} arg(s), got {}", args.len())))
    }
}

fn joined(args: &[Value]) -> String {
    args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ")
}

fn print(args: &[Value], interp: &mut Interpreter) -> Value {
    interp.write_output(&joined(args));
    Value::NULL
}

fn println(args: &[Value], interp: &mut Interpreter) -> Value {
    let mut line = joined(args);
    line.push('\n');
    interp.write_output(&line);
    Value::NULL
}

fn len(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "len", 1, args) {
        return err;
    }
    match interp.size(args[0]) {
        Ok(n) => Value::int(n as i64),
        Err(e) => interp.error(format!("len: {}", e.message())),
    }
}

/// `append(list, values...)`: push onto the list in place and return it.
fn append(args: &[Value], interp: &mut Interpreter) -> Value {
    let Some((&list, values)) = args.split_first() else {
        return interp.error("append: expected a list");
    };
    let appended = list.as_object().is_some_and(|obj| match &mut *obj.payload_mut() {
        Payload::List(items) => {
            items.extend_from_slice(values);
            true
        }
        _ => false,
    });
    if appended {
        list
    } else {
        interp.error(format!("append: expected a list, got {}", list.value_type()))
    }
}

/// `range(end)`, `range(start, end)` or `range(start, end, step)`.
fn range(args: &[Value], interp: &mut Interpreter) -> Value {
    let ints: Option<Vec<i64>> = args.iter().map(|a| a.as_int()).collect();
    let (start, end, step) = match ints.as_deref() {
        Some(&[end]) => (0, end, 1),
        Some(&[start, end]) => (start, end, 1),
        Some(&[start, end, step]) => (start, end, step),
        _ => return interp.error("range: expected 1 to 3 integer args"),
    };
    if step == 0 {
        return interp.error("range: step must not be zero");
    }
    let span = if step > 0 { end - start } else { start - end };
    let count = if span > 0 { (span - 1) / step.abs() + 1 } else { 0 };
    if count > RANGE_LIMIT {
        return interp.error(format!("range: {count} elements exceed the limit of {RANGE_LIMIT}"));
    }
    let items = (0..count).map(|k| Value::int(start + k * step)).collect();
    interp.list(items)
}

/// Remove and return the last element of a list; null when empty.
fn pop(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "pop", 1, args) {
        return err;
    }
    let popped = args[0].as_object().and_then(|obj| match &mut *obj.payload_mut() {
        Payload::List(items) => Some(items.pop().unwrap_or(Value::NULL)),
        _ => None,
    });
    match popped {
        Some(v) => v,
        None => interp.error(format!("pop: expected a list, got {}", args[0].value_type())),
    }
}

fn clone(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "clone", 1, args) {
        return err;
    }
    interp.deep_clone(args[0])
}

/// Compile and run a string in this interpreter; definitions land in
/// the global scope.
fn eval(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "eval", 1, args) {
        return err;
    }
    let Some(source) = args[0].as_str().filter(|_| args[0].is(ValueType::String)).map(|s| s.to_string()) else {
        return interp.error(format!("eval: expected a string, got {}", args[0].value_type()));
    };
    let result = interp
        .compile(&source, "<eval>")
        .map_err(|e| e.to_string())
        .and_then(|closure| interp.call_nested(closure, &[]).map_err(|e| e.message()));
    match result {
        Ok(v) => v,
        Err(message) => interp.error(format!("eval: {message}")),
    }
}

fn release_buffer(ptr: *mut c_void) {
    // SAFETY: the pointer came from libc::calloc in `alloc` and the
    // object's is_ref flag guarantees this runs at most once.
    unsafe { libc::free(ptr) }
}

/// `alloc(n)`: a zeroed host buffer of `n` bytes.
fn alloc(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "alloc", 1, args) {
        return err;
    }
    let size = match args[0].as_int().and_then(|n| usize::try_from(n).ok()).filter(|&n| n > 0) {
        Some(n) => n,
        None => return interp.error("alloc: size must be a positive integer"),
    };
    // SAFETY: calloc has no preconditions; a null result is handled below.
    let ptr = unsafe { libc::calloc(size, 1) };
    if ptr.is_null() {
        return interp.error(format!("alloc: cannot allocate {size} bytes"));
    }
    interp.heap.alloc_with_cleanup(Payload::Pointer(ptr), release_buffer)
}

/// `free(p)`: release a Pointer's buffer now instead of at collection.
fn free(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "free", 1, args) {
        return err;
    }
    match args[0].as_object() {
        Some(obj) if obj.kind() == ValueType::Pointer => {
            obj.release();
            Value::NULL
        }
        _ => interp.error(format!("free: expected a pointer, got {}", args[0].value_type())),
    }
}

/// `bound(receiver, callable)`: calling the result calls `callable` with
/// `receiver` as first argument.
fn bound(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "bound", 2, args) {
        return err;
    }
    interp.heap.alloc(Payload::Bounded { receiver: args[0], callable: args[1] })
}

/// Run a full collection; returns the number of objects freed.
fn gc(args: &[Value], interp: &mut Interpreter) -> Value {
    if let Some(err) = arity(interp, "gc", 0, args) {
        return err;
    }
    Value::int(interp.collect_garbage() as i64)
}

#[cfg(test)]
mod tests {
    use crate::interpreter::{Error, Interpreter, SharedOutput};

    fn run(source: &str) -> (String, String) {
        let out = SharedOutput::new();
        let mut interp = Interpreter::new().with_output(out.clone());
        let value = interp.run(source, "builtins.ql").unwrap();
        (value.to_string(), out.contents())
    }

    fn raised(source: &str) -> String {
        let mut interp = Interpreter::new();
        match interp.run(source, "builtins.ql") {
            Err(Error::Runtime(e)) => {
                assert_eq!(e.code, "QL-R008");
                e.message()
            }
            other => panic!("expected raised error, got {other:?}"),
        }
    }

    #[test]
    fn print_and_println() {
        let (_, out) = run("print(\"a\", 1); print(\"\\n\"); println([1, \"x\"], null);");
        assert_eq!(out, "a 1\n[1, \"x\"] null\n");
    }

    #[test]
    fn len_counts_characters_elements_and_entries() {
        assert_eq!(run("[len(\"héllo\"), len([1, 2]), len({a: 1})];").0, "[5, 2, 1]");
        assert!(raised("len(3);").starts_with("len:"));
    }

    #[test]
    fn append_and_pop() {
        assert_eq!(run("let l = [1]; append(l, 2, 3); l;").0, "[1, 2, 3]");
        assert_eq!(run("let l = [1, 2]; [pop(l), l];").0, "[2, [1]]");
        assert_eq!(run("pop([]);").0, "null");
        assert!(raised("append(1, 2);").contains("expected a list"));
    }

    #[test]
    fn range_forms() {
        assert_eq!(run("range(3);").0, "[0, 1, 2]");
        assert_eq!(run("range(2, 5);").0, "[2, 3, 4]");
        assert_eq!(run("range(5, 0, -2);").0, "[5, 3, 1]");
        assert!(raised("range(1, 2, 0);").contains("step"));
        assert_eq!(run("range(0, 7, 3);").0, "[0, 3, 6]");
        assert_eq!(run("range(3, 3);").0, "[]");
        assert_eq!(run("range(0, 5, -1);").0, "[]");
        assert!(raised("range(0, 140737488355327);").contains("exceed the limit"));
    }

    #[test]
    fn clone_is_deep() {
        assert_eq!(run("let a = [[1]]; let b = clone(a); b[0][0] = 9; a;").0, "[[1]]");
    }

    #[test]
    fn eval_shares_globals() {
        assert_eq!(run("let x = 2; eval(\"x * 21;\");").0, "42");
        assert!(raised("eval(\"nope;\");").contains("undefined variable"));
    }

    #[test]
    fn alloc_and_free_pointers() {
        assert_eq!(run("let p = alloc(16); free(p); Type(p) == Pointer;").0, "true");
        assert!(raised("alloc(0);").contains("positive"));
        assert!(raised("free(1);").contains("expected a pointer"));
    }

    #[test]
    fn gc_reports_freed_objects() {
        let mut interp = Interpreter::new();
        let v = interp.run("let i = 0; for (i < 10) { [i]; i = i + 1; } gc();", "t.ql").unwrap();
        assert!(v.as_int().unwrap() >= 10);
    }
}
