use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{Value, ValueType};
use crate::bytecode::DebugInfo;
use crate::interpreter::Interpreter;

/// Host callback contract for builtins.
pub type BuiltinFn = fn(&[Value], &mut Interpreter) -> Value;

/// Called with the raw payload pointer of a Pointer object when it dies.
pub type Cleanup = fn(*mut c_void);

pub struct HeapObject {
    kind: ValueType,
    payload: RefCell<Payload>,
    /// The payload is borrowed from the host; the sweeper leaves it alone.
    is_ref: Cell<bool>,
    marked: Cell<bool>,
    cleanup: Option<Cleanup>,
}

pub enum Payload {
    String(String),
    Error(String),
    List(Vec<Value>),
    Map(Map),
    Function(Rc<Function>),
    Closure(Closure),
    Builtin(Builtin),
    Bounded { receiver: Value, callable: Value },
    Pointer(*mut c_void),
}

impl Payload {
    pub fn kind(&self) -> ValueType {
        match self {
            Payload::String(_) => ValueType::String,
            Payload::Error(_) => ValueType::Error,
            Payload::List(_) => ValueType::List,
            Payload::Map(_) => ValueType::Map,
            Payload::Function(_) => ValueType::Function,
            Payload::Closure(_) => ValueType::Closure,
            Payload::Builtin(_) => ValueType::Builtin,
            Payload::Bounded { .. } => ValueType::Bounded,
            Payload::Pointer(_) => ValueType::Pointer,
        }
    }

    /// Values directly reachable from this payload, for GC tracing.
    pub fn for_each_child(&self, mut f: impl FnMut(Value)) {
        match self {
            Payload::List(items) => items.iter().copied().for_each(f),
            Payload::Map(map) => map.values().for_each(f),
            Payload::Closure(closure) => {
                f(closure.function);
                closure.free.iter().copied().for_each(f);
            }
            Payload::Bounded { receiver, callable } => {
                f(*receiver);
                f(*callable);
            }
            Payload::String(_)
            | Payload::Error(_)
            | Payload::Function(_)
            | Payload::Builtin(_)
            | Payload::Pointer(_) => {}
        }
    }
}

impl HeapObject {
    pub fn new(payload: Payload) -> Self {
        HeapObject {
            kind: payload.kind(),
            payload: RefCell::new(payload),
            is_ref: Cell::new(false),
            marked: Cell::new(false),
            cleanup: None,
        }
    }

    pub fn with_cleanup(payload: Payload, cleanup: Cleanup) -> Self {
        HeapObject { cleanup: Some(cleanup), ..HeapObject::new(payload) }
    }

    /// Leak the object into a boxed value.
    pub(crate) fn into_value(self) -> Value {
        let ptr = NonNull::from(Box::leak(Box::new(self)));
        Value::from_object(ptr)
    }

    pub fn kind(&self) -> ValueType {
        self.kind
    }

    pub fn payload(&self) -> Ref<'_, Payload> {
        self.payload.borrow()
    }

    pub fn payload_mut(&self) -> RefMut<'_, Payload> {
        self.payload.borrow_mut()
    }

    pub fn is_ref(&self) -> bool {
        self.is_ref.get()
    }

    pub fn set_ref(&self, is_ref: bool) {
        self.is_ref.set(is_ref);
    }

    pub fn is_marked(&self) -> bool {
        self.marked.get()
    }

    pub(crate) fn set_marked(&self, marked: bool) {
        self.marked.set(marked);
    }

    /// Run the cleanup callback on the payload, unless it is borrowed.
    pub(crate) fn release(&self) {
        if self.is_ref.get() {
            return;
        }
        if let (Some(cleanup), Payload::Pointer(ptr)) = (self.cleanup, &*self.payload.borrow()) {
            if !ptr.is_null() {
                cleanup(*ptr);
            }
        }
        self.is_ref.set(true);
    }
}

/// Compiled function. Instructions are immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: usize,
    pub name: Option<String>,
    pub instructions: Vec<u8>,
    pub n_locals: usize,
    pub n_params: usize,
    pub is_variadic: bool,
    pub debug_info: DebugInfo,
}

impl Function {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.debug_info.line_at(offset)
    }
}

/// A function plus the values it captured when `CLOSURE` executed.
pub struct Closure {
    /// A Function object.
    pub function: Value,
    pub free: Vec<Value>,
}

pub struct Builtin {
    pub name: String,
    pub func: BuiltinFn,
}

/// String-keyed map that iterates in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Map {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl Map {
    pub fn new() -> Self {
        Map::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.index.get(key).map(|&i| self.entries[i].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or overwrite. An overwritten key keeps its position.
    pub fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        if let Some(&i) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.entries[i].1, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    pub fn key_at(&self, position: usize) -> Option<&str> {
        self.entries.get(position).map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }
}
