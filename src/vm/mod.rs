//! Stack VM: fetch/execute loop, call dispatch and frame management.
//!
//! The value stack holds `[callee][args][locals][temporaries]` for every
//! active call; a frame's `base` is the index of its first argument, so
//! the callee sits at `base - 1`. Nested activations (host `call`,
//! defers, `__index__` methods, module bodies) push onto the same stack
//! and frame list and run `execute` until their own frame returns.

pub mod error;
mod ops;

use std::io::BufRead;
use std::rc::Rc;

pub use error::{RuntimeError, RuntimeErrorKind, TraceEntry};

use crate::bytecode::{disassemble_instruction, read_u16, Op};
use crate::interpreter::Interpreter;
use crate::symbols::Scope;
use crate::value::{Closure, Function, Map, Payload, Value, ValueType};

/// Call depth limit.
pub const MAX_FRAMES: usize = 1024;

/// Limit on activations that recurse on the native stack: host calls,
/// defers, `__index__`/`__set_index__` hooks, `eval` and module images.
pub const MAX_NESTING: usize = 64;

pub type VmResult<T> = Result<T, RuntimeError>;

pub(crate) struct Frame {
    pub(crate) closure: Value,
    pub(crate) function: Rc<Function>,
    pub(crate) ip: usize,
    pub(crate) base: usize,
    /// Deferred callables, run last-in first-out on return.
    pub(crate) defers: Vec<Value>,
}

fn invalid(what: impl Into<String>) -> RuntimeError {
    RuntimeErrorKind::InvalidBytecode(what.into()).into()
}

/// What a callee turned out to be, read out of its payload so the borrow
/// ends before dispatch.
enum Callee {
    Closure(Rc<Function>),
    Builtin(crate::value::BuiltinFn),
    Bounded(Value, Value),
    Method(Option<Value>),
    Other(ValueType),
}

impl Interpreter {
    /// Call `callee` with `args` in a nested activation and return its
    /// result. On error the stack and frames are restored to where they
    /// were before the call.
    pub(crate) fn call_nested(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        if self.nesting >= MAX_NESTING {
            let mut err = RuntimeError::from(RuntimeErrorKind::StackOverflow);
            err.trace = self.traceback();
            return Err(err);
        }
        let stack_mark = self.stack.len();
        let frame_mark = self.frames.len();
        self.nesting += 1;
        self.stack.push(callee);
        self.stack.extend_from_slice(args);
        let result = match self.call_value(args.len()) {
            Ok(true) => self.execute(frame_mark),
            Ok(false) => self.pop(),
            Err(e) => Err(e),
        };
        self.nesting -= 1;
        match result {
            Ok(value) => {
                self.stack.truncate(stack_mark);
                Ok(value)
            }
            Err(mut err) => {
                if err.trace.is_empty() {
                    err.trace = self.traceback();
                }
                self.stack.truncate(stack_mark);
                self.frames.truncate(frame_mark);
                Err(err)
            }
        }
    }

    fn traceback(&self) -> Vec<TraceEntry> {
        self.frames
            .iter()
            .rev()
            .map(|frame| TraceEntry {
                function: frame.function.display_name().to_string(),
                filename: frame.function.debug_info.filename.clone(),
                line: frame.function.line_at(frame.ip.saturating_sub(1)),
            })
            .collect()
    }

    pub(crate) fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or_else(|| invalid("stack underflow"))
    }

    fn peek(&self) -> VmResult<Value> {
        self.stack.last().copied().ok_or_else(|| invalid("stack underflow"))
    }

    fn frame(&self) -> VmResult<&Frame> {
        self.frames.last().ok_or_else(|| invalid("no active frame"))
    }

    fn frame_mut(&mut self) -> VmResult<&mut Frame> {
        self.frames.last_mut().ok_or_else(|| invalid("no active frame"))
    }

    /// Dispatch on the callee at `stack[len - argc - 1]`. Returns true when
    /// a new frame was pushed; otherwise the callee and arguments have
    /// been replaced by the result.
    pub(crate) fn call_value(&mut self, argc: usize) -> VmResult<bool> {
        self.dispatch_call(argc, 0)
    }

    /// `hops` counts Bounded and `__call__` indirections followed so far.
    fn dispatch_call(&mut self, argc: usize, hops: usize) -> VmResult<bool> {
        if hops > MAX_NESTING {
            return Err(RuntimeErrorKind::StackOverflow.into());
        }
        let at = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| invalid("call below stack bottom"))?;
        let callee = self.stack[at];

        if let Some(target) = callee.as_type() {
            let args = self.stack[at + 1..].to_vec();
            let result = self.cast(target, &args)?;
            self.stack.truncate(at);
            self.stack.push(result);
            return Ok(false);
        }

        let kind = match callee.as_object() {
            Some(obj) => match &*obj.payload() {
                Payload::Closure(closure) => match closure.function.as_object().map(|f| f.payload()) {
                    Some(p) => match &*p {
                        Payload::Function(function) => Callee::Closure(Rc::clone(function)),
                        _ => Callee::Other(ValueType::Closure),
                    },
                    None => Callee::Other(ValueType::Closure),
                },
                Payload::Builtin(builtin) => Callee::Builtin(builtin.func),
                Payload::Bounded { receiver, callable } => Callee::Bounded(*receiver, *callable),
                Payload::Map(map) => Callee::Method(map.get("__call__")),
                other => Callee::Other(other.kind()),
            },
            None => Callee::Other(callee.value_type()),
        };

        match kind {
            Callee::Closure(function) => self.push_frame(callee, function, argc),
            Callee::Builtin(func) => {
                // Arguments stay on the stack while the host runs.
                let args = self.stack[at + 1..].to_vec();
                let result = func(&args, self);
                if result.is(ValueType::Error) {
                    let message = result.as_str().map(|s| s.to_string()).unwrap_or_default();
                    return Err(RuntimeErrorKind::Raised(message).into());
                }
                self.stack.truncate(at);
                self.stack.push(result);
                Ok(false)
            }
            Callee::Bounded(receiver, callable) => {
                self.stack[at] = callable;
                self.stack.insert(at + 1, receiver);
                self.dispatch_call(argc + 1, hops + 1)
            }
            Callee::Method(Some(method)) => {
                self.stack[at] = method;
                self.stack.insert(at + 1, callee);
                self.dispatch_call(argc + 1, hops + 1)
            }
            Callee::Method(None) => Err(RuntimeErrorKind::NotCallable(ValueType::Map).into()),
            Callee::Other(ty) => Err(RuntimeErrorKind::NotCallable(ty).into()),
        }
    }

    fn push_frame(&mut self, closure: Value, function: Rc<Function>, argc: usize) -> VmResult<bool> {
        let mut argc = argc;
        if function.is_variadic {
            let fixed = function.n_params.saturating_sub(1);
            if argc < fixed {
                return Err(RuntimeErrorKind::VariadicShortfall {
                    callee: function.display_name().to_string(),
                    min: fixed,
                    got: argc,
                }
                .into());
            }
            let start = self.stack.len() - (argc - fixed);
            let rest: Vec<Value> = self.stack.drain(start..).collect();
            let list = self.heap.list(rest);
            self.stack.push(list);
            argc = fixed + 1;
        }
        if argc != function.n_params {
            return Err(RuntimeErrorKind::Arity {
                callee: function.display_name().to_string(),
                expected: function.n_params,
                got: argc,
            }
            .into());
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeErrorKind::StackOverflow.into());
        }
        let base = self.stack.len() - argc;
        let locals = function.n_locals.saturating_sub(function.n_params);
        self.stack.resize(self.stack.len() + locals, Value::NULL);
        self.frames.push(Frame { closure, function, ip: 0, base, defers: Vec::new() });
        Ok(true)
    }

    /// Run until the frame count drops back to `stop`; returns the value
    /// the last frame returned.
    pub(crate) fn execute(&mut self, stop: usize) -> VmResult<Value> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
                if self.heap.is_exhausted() {
                    return Err(RuntimeErrorKind::HeapExhausted {
                        live: self.heap.len(),
                        limit: self.heap.max_heap(),
                    }
                    .into());
                }
            }

            let frame = self.frame_mut()?;
            let function = Rc::clone(&frame.function);
            let code = &function.instructions;
            let offset = frame.ip;
            let op = code
                .get(offset)
                .and_then(|&byte| Op::from_byte(byte))
                .ok_or_else(|| invalid(format!("no instruction at {offset} in {}", function.display_name())))?;
            if offset + op.width() > code.len() {
                return Err(invalid(format!("truncated {} at {offset}", op.name())));
            }
            let a = if op.operand_count() > 0 { read_u16(code, offset + 1) } else { 0 };
            let b = if op.operand_count() > 1 { read_u16(code, offset + 3) } else { 0 };
            frame.ip = offset + op.width();

            if self.options.debug {
                self.trace_instruction(&function, offset);
            }

            match op {
                Op::Neg => {
                    let v = self.pop()?;
                    let result = self.negate(v)?;
                    self.stack.push(result);
                }
                Op::Not => {
                    let v = self.pop()?;
                    self.stack.push(Value::boolean(v.is_falsy()));
                }
                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::LShift
                | Op::RShift
                | Op::And
                | Op::Or
                | Op::LAnd
                | Op::LOr
                | Op::Eq
                | Op::Ne
                | Op::Lt
                | Op::Le
                | Op::Gt
                | Op::Ge => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let result = self.binary(op, left, right)?;
                    self.stack.push(result);
                }
                Op::Const => {
                    let value = self
                        .constants
                        .get(a as usize)
                        .copied()
                        .ok_or_else(|| invalid(format!("constant {a} out of range")))?;
                    // Strings are mutable through SET; each use gets a copy.
                    let value = match value.as_object().map(|o| o.kind()) {
                        Some(ValueType::String) => {
                            let text = value.as_str().map(|s| s.to_string()).unwrap_or_default();
                            self.heap.string(text)
                        }
                        _ => value,
                    };
                    self.stack.push(value);
                }
                Op::ConstInt => self.stack.push(Value::int(i64::from(a as i16))),
                Op::ConstTrue => self.stack.push(Value::TRUE),
                Op::ConstFalse => self.stack.push(Value::FALSE),
                Op::ConstNull => self.stack.push(Value::NULL),
                Op::Load => {
                    let value = self.load(a, b as usize)?;
                    self.stack.push(value);
                }
                Op::Store => {
                    let value = self.peek()?;
                    self.store(a, b as usize, value)?;
                }
                Op::Pack => {
                    let items = self.take(a as usize)?;
                    let list = self.heap.list(items);
                    self.stack.push(list);
                }
                Op::Map => {
                    let items = self.take(2 * a as usize)?;
                    let mut map = Map::new();
                    for pair in items.chunks_exact(2) {
                        let key = pair[0]
                            .as_str()
                            .filter(|_| pair[0].is(ValueType::String))
                            .map(|s| s.to_string())
                            .ok_or(RuntimeErrorKind::MapKey(pair[0].value_type()))?;
                        map.insert(key, pair[1]);
                    }
                    let value = self.heap.alloc(Payload::Map(map));
                    self.stack.push(value);
                }
                Op::Index => {
                    // Operands stay on the stack until the result is known.
                    let result = match a {
                        1 => {
                            let [container, index] = self.top::<2>()?;
                            self.index(container, index)?
                        }
                        2 => {
                            let [container, start, end] = self.top::<3>()?;
                            self.slice(container, start, end)?
                        }
                        n => return Err(invalid(format!("INDEX with {n} operands"))),
                    };
                    let keep = self.stack.len() - 1 - a as usize;
                    self.stack.truncate(keep);
                    self.stack.push(result);
                }
                Op::Set => {
                    let [container, index, value] = self.top::<3>()?;
                    self.set_index(container, index, value)?;
                    let keep = self.stack.len() - 3;
                    self.stack.truncate(keep);
                    self.stack.push(container);
                }
                Op::Size => {
                    let container = self.pop()?;
                    let len = self.size(container)?;
                    self.stack.push(Value::int(len as i64));
                }
                Op::Jmp | Op::Break | Op::Continue => self.jump(a)?,
                Op::Jnz => {
                    if self.pop()?.is_falsy() {
                        self.jump(a)?;
                    }
                }
                Op::Chk => {
                    let truthy = !self.peek()?.is_falsy();
                    if truthy == (a != 0) {
                        self.jump(b)?;
                    } else {
                        self.pop()?;
                    }
                }
                Op::Call => {
                    self.call_value(a as usize)?;
                }
                Op::Ret => {
                    let result = self.peek()?;
                    if let Some(value) = self.return_from(result, stop)? {
                        return Ok(value);
                    }
                }
                Op::Hlt => {
                    let frame = self.frame()?;
                    let floor = frame.base + frame.function.n_locals;
                    let result = if self.stack.len() > floor { self.peek()? } else { Value::NULL };
                    if let Some(value) = self.return_from(result, stop)? {
                        return Ok(value);
                    }
                }
                Op::Defer => {
                    let callable = self.pop()?;
                    self.frame_mut()?.defers.push(callable);
                }
                Op::Closure => {
                    let free = self.take(b as usize)?;
                    let function = self
                        .constants
                        .get(a as usize)
                        .copied()
                        .filter(|f| f.is(ValueType::Function))
                        .ok_or_else(|| invalid(format!("constant {a} is not a function")))?;
                    let closure = self.heap.alloc(Payload::Closure(Closure { function, free }));
                    self.stack.push(closure);
                }
                Op::SetSelf => {
                    let closure = self.peek()?;
                    let obj = closure.as_object().ok_or_else(|| invalid("SET_SELF without a closure"))?;
                    match &mut *obj.payload_mut() {
                        Payload::Closure(c) if (a as usize) < c.free.len() => c.free[a as usize] = closure,
                        _ => return Err(invalid(format!("SET_SELF {a} on {}", closure.value_type()))),
                    }
                }
                Op::Module => {
                    let path = self.peek()?;
                    let path = path
                        .as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| invalid("MODULE path is not a string"))?;
                    let exports = self.load_artifact_module(&path)?;
                    self.pop()?;
                    self.stack.push(exports);
                }
                Op::Pop => {
                    self.pop()?;
                }
            }
        }
    }

    fn jump(&mut self, target: u16) -> VmResult<()> {
        let frame = self.frame_mut()?;
        if target as usize > frame.function.instructions.len() {
            return Err(invalid(format!("jump to {target} outside {}", frame.function.display_name())));
        }
        frame.ip = target as usize;
        Ok(())
    }

    /// Copies of the top `N` stack slots, deepest first.
    fn top<const N: usize>(&self) -> VmResult<[Value; N]> {
        let start = self.stack.len().checked_sub(N).ok_or_else(|| invalid("stack underflow"))?;
        let mut out = [Value::NULL; N];
        out.copy_from_slice(&self.stack[start..]);
        Ok(out)
    }

    fn take(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let start = self.stack.len().checked_sub(n).ok_or_else(|| invalid("stack underflow"))?;
        Ok(self.stack.drain(start..).collect())
    }

    /// Run the frame's defers, unwind it, and either hand the result to
    /// the caller's frame or, at `stop`, return it.
    fn return_from(&mut self, result: Value, stop: usize) -> VmResult<Option<Value>> {
        // The result stays on the stack while defers run.
        while let Some(deferred) = self.frame_mut()?.defers.pop() {
            self.call_nested(deferred, &[])?;
        }
        let frame = self.frames.pop().ok_or_else(|| invalid("return without a frame"))?;
        self.stack.truncate(frame.base.saturating_sub(1));
        if self.frames.len() <= stop {
            return Ok(Some(result));
        }
        self.stack.push(result);
        Ok(None)
    }

    fn load(&self, scope: u16, index: usize) -> VmResult<Value> {
        let missing = || invalid(format!("LOAD {} {index} out of range", Scope::from_code(scope).map(Scope::name).unwrap_or("?")));
        match Scope::from_code(scope) {
            Some(Scope::Local) => {
                let base = self.frame()?.base;
                self.stack.get(base + index).copied().ok_or_else(missing)
            }
            Some(Scope::Global) => self.globals.get(index).copied().ok_or_else(missing),
            Some(Scope::Builtin) => self.builtins.get(index).copied().ok_or_else(missing),
            Some(Scope::Type) => ValueType::from_u8(index as u8).map(Value::type_tag).ok_or_else(missing),
            Some(Scope::Free) => {
                let closure = self.frame()?.closure;
                let obj = closure.as_object().ok_or_else(missing)?;
                match &*obj.payload() {
                    Payload::Closure(c) => c.free.get(index).copied().ok_or_else(missing),
                    _ => Err(missing()),
                }
            }
            Some(Scope::Function) => Ok(self.frame()?.closure),
            None => Err(invalid(format!("unknown scope {scope}"))),
        }
    }

    fn store(&mut self, scope: u16, index: usize, value: Value) -> VmResult<()> {
        match Scope::from_code(scope) {
            Some(Scope::Local) => {
                let at = self.frame()?.base + index;
                let slot = self.stack.get_mut(at).ok_or_else(|| invalid(format!("STORE LOCAL {index} out of range")))?;
                *slot = value;
            }
            Some(Scope::Global) => {
                self.ensure_global(index);
                self.globals[index] = value;
            }
            Some(Scope::Free) => {
                let closure = self.frame()?.closure;
                let obj = closure.as_object().ok_or_else(|| invalid("STORE FREE outside a closure"))?;
                match &mut *obj.payload_mut() {
                    Payload::Closure(c) if index < c.free.len() => c.free[index] = value,
                    _ => return Err(invalid(format!("STORE FREE {index} out of range"))),
                }
            }
            _ => return Err(invalid(format!("STORE into scope {scope}"))),
        }
        Ok(())
    }

    /// One line per instruction on stderr: `file:line offset OP operands |
    /// stack: [...]`.
    fn trace_instruction(&self, function: &Function, offset: usize) {
        let (text, _) = disassemble_instruction(&function.instructions, offset);
        let stack: Vec<String> = self.stack.iter().map(|v| format!("{v:?}")).collect();
        eprintln!(
            "{}:{} {offset:04} {text} | stack: [{}]",
            function.debug_info.filename,
            function.line_at(offset),
            stack.join(", ")
        );
        if self.options.break_each {
            let mut line = String::new();
            if let Err(err) = std::io::stdin().lock().read_line(&mut line) {
                log::warn!("cannot read from stdin while stepping: {err}");
            }
        }
    }
}
