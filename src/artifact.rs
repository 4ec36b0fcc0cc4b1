//! Pre-built module images (`.qlc`).
//!
//! An image is a module compiled ahead of time and serialized as JSON.
//! Operands that point into interpreter-wide tables are made relative to
//! the image: CONST/CLOSURE index `constants`, GLOBAL slots index
//! `globals` by name, BUILTIN slots index `builtins` by name. Loading
//! re-bases all of them onto the interpreter that runs `MODULE`.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::{Op, read_u16};
use crate::compiler;
use crate::interpreter::{Error, Interpreter};
use crate::symbols::Scope;
use crate::value::{Closure, Function, Payload, Value, ValueType};
use crate::vm::{RuntimeErrorKind, VmResult};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("cannot access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed module image: {0}")]
    Json(#[from] serde_json::Error),
    #[error("module image format {found} is not supported (expected {FORMAT_VERSION})")]
    Version { found: u32 },
    #[error("module image needs builtin '{0}', which is not registered")]
    UnknownBuiltin(String),
    #[error("{0} constants cannot be stored in a module image")]
    Unserializable(ValueType),
    #[error("corrupt module image: {0}")]
    Corrupt(String),
}

impl ArtifactError {
    pub fn code(&self) -> &'static str {
        match self {
            ArtifactError::Io { .. } => "QL-A001",
            ArtifactError::Json(_) | ArtifactError::Corrupt(_) => "QL-A002",
            ArtifactError::Version { .. } => "QL-A003",
            ArtifactError::UnknownBuiltin(_) => "QL-A004",
            ArtifactError::Unserializable(_) => "QL-A005",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ConstantImage {
    Integer(i64),
    Decimal(f64),
    String(String),
    /// Index into `ModuleImage::functions`.
    Function(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleImage {
    pub format_version: u32,
    pub filename: String,
    pub functions: Vec<Function>,
    pub constants: Vec<ConstantImage>,
    pub globals: Vec<String>,
    pub builtins: Vec<String>,
    /// Index of the module body in `functions`.
    pub entry: usize,
}

/// Walk every instruction of `code`, handing each operand slot with its
/// opcode and slot number to `f`, which may rewrite it.
fn rewrite_operands(
    code: &mut [u8],
    mut f: impl FnMut(Op, usize, u16, u16) -> Result<u16, ArtifactError>,
) -> Result<(), ArtifactError> {
    let mut offset = 0;
    while offset < code.len() {
        let op = Op::from_byte(code[offset])
            .ok_or_else(|| ArtifactError::Corrupt(format!("bad opcode {} at {offset}", code[offset])))?;
        if offset + op.width() > code.len() {
            return Err(ArtifactError::Corrupt(format!("truncated {} at {offset}", op.name())));
        }
        let first = if op.operand_count() > 0 { read_u16(code, offset + 1) } else { 0 };
        for slot in 0..op.operand_count() {
            let at = offset + 1 + 2 * slot;
            let operand = read_u16(code, at);
            let rewritten = f(op, slot, first, operand)?;
            code[at..at + 2].copy_from_slice(&rewritten.to_le_bytes());
        }
        offset += op.width();
    }
    Ok(())
}

fn is_pool_operand(op: Op, slot: usize) -> bool {
    matches!((op, slot), (Op::Const, 0) | (Op::Closure, 0))
}

fn is_slot_operand(op: Op, slot: usize, scope: u16, wanted: Scope) -> bool {
    matches!(op, Op::Load | Op::Store) && slot == 1 && scope == wanted.code()
}

fn index_of(names: &mut Vec<String>, name: &str) -> usize {
    match names.iter().position(|n| n == name) {
        Some(i) => i,
        None => {
            names.push(name.to_string());
            names.len() - 1
        }
    }
}

fn image_operand(index: usize) -> Result<u16, ArtifactError> {
    u16::try_from(index).map_err(|_| ArtifactError::Corrupt(format!("index {index} does not fit an operand")))
}

struct Builder<'a> {
    interp: &'a Interpreter,
    global_names: HashMap<usize, String>,
    builtin_names: HashMap<usize, String>,
    image: ModuleImage,
    /// Pool index -> image constant index.
    seen: HashMap<usize, usize>,
}

impl Builder<'_> {
    fn function(&mut self, function: &Function) -> Result<usize, ArtifactError> {
        let index = self.image.functions.len();
        self.image.functions.push(function.clone());
        let mut code = function.instructions.clone();
        rewrite_operands(&mut code, |op, slot, scope, operand| {
            if is_pool_operand(op, slot) {
                return image_operand(self.constant(operand as usize)?);
            }
            if is_slot_operand(op, slot, scope, Scope::Global) {
                let name = self.global_names.get(&(operand as usize)).ok_or_else(|| {
                    ArtifactError::Corrupt(format!("global slot {operand} has no name"))
                })?;
                return image_operand(index_of(&mut self.image.globals, name));
            }
            if is_slot_operand(op, slot, scope, Scope::Builtin) {
                let name = self.builtin_names.get(&(operand as usize)).ok_or_else(|| {
                    ArtifactError::Corrupt(format!("builtin slot {operand} has no name"))
                })?;
                return image_operand(index_of(&mut self.image.builtins, name));
            }
            Ok(operand)
        })?;
        self.image.functions[index].instructions = code;
        Ok(index)
    }

    fn constant(&mut self, pool_index: usize) -> Result<usize, ArtifactError> {
        if let Some(&k) = self.seen.get(&pool_index) {
            return Ok(k);
        }
        let value = *self
            .interp
            .constants
            .get(pool_index)
            .ok_or_else(|| ArtifactError::Corrupt(format!("constant {pool_index} out of range")))?;
        // Reserve the slot first so a function constant that refers back
        // to itself terminates.
        let k = self.image.constants.len();
        self.image.constants.push(ConstantImage::Integer(0));
        self.seen.insert(pool_index, k);
        let image = if let Some(n) = value.as_int() {
            ConstantImage::Integer(n)
        } else if let Some(d) = value.as_decimal() {
            ConstantImage::Decimal(d)
        } else if value.is(ValueType::String) {
            ConstantImage::String(value.as_str().map(|s| s.to_string()).unwrap_or_default())
        } else if let Some(function) = function_of(value) {
            ConstantImage::Function(self.function(&function)?)
        } else {
            return Err(ArtifactError::Unserializable(value.value_type()));
        };
        self.image.constants[k] = image;
        Ok(k)
    }
}

fn function_of(value: Value) -> Option<Rc<Function>> {
    match &*value.as_object()?.payload() {
        Payload::Function(f) => Some(Rc::clone(f)),
        _ => None,
    }
}

/// Compile `source` as a module in a scratch interpreter and capture it
/// as an image.
pub fn build(source: &str, filename: &str) -> Result<ModuleImage, Error> {
    let mut interp = Interpreter::new();
    let module = compiler::compile_module(&mut interp, source, filename)?;
    let entry = function_of(module).ok_or_else(|| ArtifactError::Corrupt("module did not compile to a function".into()))?;

    let mut global_names = HashMap::new();
    let mut builtin_names = HashMap::new();
    for symbol in interp.symbols.definitions() {
        global_names.insert(symbol.index, symbol.name.clone());
    }
    for (name, index) in interp.builtin_names() {
        builtin_names.insert(index, name);
    }

    let mut builder = Builder {
        interp: &interp,
        global_names,
        builtin_names,
        image: ModuleImage {
            format_version: FORMAT_VERSION,
            filename: filename.to_string(),
            functions: Vec::new(),
            constants: Vec::new(),
            globals: Vec::new(),
            builtins: Vec::new(),
            entry: 0,
        },
        seen: HashMap::new(),
    };
    builder.image.entry = builder.function(&entry)?;
    log::debug!(
        "built image of '{filename}': {} function(s), {} constant(s)",
        builder.image.functions.len(),
        builder.image.constants.len()
    );
    Ok(builder.image)
}

impl ModuleImage {
    pub fn read(path: &Path) -> Result<ModuleImage, ArtifactError> {
        let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let image: ModuleImage = serde_json::from_slice(&bytes)?;
        if image.format_version != FORMAT_VERSION {
            return Err(ArtifactError::Version { found: image.format_version });
        }
        Ok(image)
    }

    pub fn write(&self, path: &Path) -> Result<(), ArtifactError> {
        let json = serde_json::to_vec(self)?;
        std::fs::write(path, json).map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Re-base the image onto `interp` and return the module body as a
    /// zero-argument closure.
    pub fn instantiate(self, interp: &mut Interpreter) -> Result<Value, ArtifactError> {
        if self.entry >= self.functions.len() {
            return Err(ArtifactError::Corrupt(format!("entry {} out of range", self.entry)));
        }
        let builtins = self
            .builtins
            .iter()
            .map(|name| match interp.symbols.lookup_here(name) {
                Some(symbol) if symbol.scope == Scope::Builtin => Ok(symbol.index),
                _ => Err(ArtifactError::UnknownBuiltin(name.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let base = interp.constants.len();
        if base + self.constants.len() > u16::MAX as usize {
            return Err(ArtifactError::Corrupt("constant pool is full".into()));
        }

        let mut functions = Vec::with_capacity(self.functions.len());
        let mut globals = Vec::with_capacity(self.globals.len());
        for name in &self.globals {
            let index = match interp.symbols.lookup_here(name) {
                Some(symbol) if symbol.scope == Scope::Global => symbol.index,
                _ => interp.symbols.define(name).index,
            };
            interp.ensure_global(index);
            globals.push(index);
        }
        let n_constants = self.constants.len();
        for mut function in self.functions {
            rewrite_operands(&mut function.instructions, |op, slot, scope, operand| {
                let index = operand as usize;
                let mapped = if is_pool_operand(op, slot) {
                    (index < n_constants).then_some(base + index)
                } else if is_slot_operand(op, slot, scope, Scope::Global) {
                    globals.get(index).copied()
                } else if is_slot_operand(op, slot, scope, Scope::Builtin) {
                    builtins.get(index).copied()
                } else {
                    Some(index)
                };
                mapped
                    .ok_or_else(|| ArtifactError::Corrupt(format!("{} operand {operand} out of range", op.name())))
                    .and_then(image_operand)
            })?;
            function.id = interp.next_function_id();
            functions.push(Rc::new(function));
        }

        let function_value = |interp: &mut Interpreter, i: usize| -> Result<Value, ArtifactError> {
            let function = functions
                .get(i)
                .ok_or_else(|| ArtifactError::Corrupt(format!("function {i} out of range")))?;
            Ok(interp.heap.alloc(Payload::Function(Rc::clone(function))))
        };
        let mut values = Vec::with_capacity(n_constants);
        for constant in &self.constants {
            values.push(match constant {
                ConstantImage::Integer(n) => Value::int(*n),
                ConstantImage::Decimal(d) => Value::decimal(*d),
                ConstantImage::String(s) => interp.string(s.as_str()),
                ConstantImage::Function(i) => function_value(interp, *i)?,
            });
        }
        for value in values {
            interp.add_constant(value);
        }
        let entry = function_value(interp, self.entry)?;
        Ok(interp.heap.alloc(Payload::Closure(Closure { function: entry, free: Vec::new() })))
    }
}

impl Interpreter {
    /// Run the image at `path` once and cache its export map.
    pub(crate) fn load_artifact_module(&mut self, path: &str) -> VmResult<Value> {
        if let Some(&exports) = self.modules.get(path) {
            return Ok(exports);
        }
        log::debug!("loading module image {path}");
        let module_error = |e: ArtifactError| RuntimeErrorKind::Module { path: path.to_string(), reason: e.to_string() };
        let image = ModuleImage::read(Path::new(path)).map_err(module_error)?;
        let closure = image.instantiate(self).map_err(module_error)?;
        // In progress: a cyclic load sees null.
        self.modules.insert(path.to_string(), Value::NULL);
        match self.call_nested(closure, &[]) {
            Ok(exports) => {
                self.modules.insert(path.to_string(), exports);
                Ok(exports)
            }
            Err(err) => {
                self.modules.remove(path);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::SharedOutput;

    const GREETER: &str = "let greeting = \"hello\";\nlet big = 100000;\nlet half = 0.5;\nlet greet = fun(who) { println(greeting + \", \" + who); return len(who); };\n";

    #[test]
    fn build_collects_constants_and_builtin_names() {
        let image = build(GREETER, "greeter.ql").unwrap();
        assert_eq!(image.format_version, FORMAT_VERSION);
        assert!(image.constants.contains(&ConstantImage::String("hello".into())));
        assert!(image.constants.contains(&ConstantImage::Integer(100000)));
        assert!(image.constants.contains(&ConstantImage::Decimal(0.5)));
        assert!(image.constants.iter().any(|c| matches!(c, ConstantImage::Function(_))));
        assert_eq!(image.builtins, vec!["println".to_string(), "len".to_string()]);
        assert_eq!(image.functions.len(), 2);
    }

    #[test]
    fn image_runs_in_another_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeter.qlc");
        build(GREETER, "greeter.ql").unwrap().write(&path).unwrap();

        let out = SharedOutput::new();
        let mut interp = Interpreter::new().with_output(out.clone());
        interp.run("let padding = [1, 2, 3]; let other = \"x\";", "pad.ql").unwrap();
        let path = path.to_string_lossy().into_owned();
        let exports = interp.load_artifact_module(&path).unwrap();
        assert_eq!(
            exports.to_string(),
            "{greeting: \"hello\", big: 100000, half: 0.5, greet: <function greet>}"
        );

        interp.define("greeter", exports);
        let n = interp.run("greeter.greet(\"bob\");", "t.ql").unwrap();
        assert_eq!(n.as_int(), Some(3));
        assert_eq!(out.contents(), "hello, bob\n");

        let again = interp.load_artifact_module(&path).unwrap();
        assert_eq!(again, exports);
    }

    #[test]
    fn read_rejects_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.qlc");
        let mut image = build("let a = 1;", "old.ql").unwrap();
        image.format_version = 99;
        image.write(&path).unwrap();
        let err = ModuleImage::read(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::Version { found: 99 }));
        assert_eq!(err.code(), "QL-A003");
    }

    #[test]
    fn unknown_builtins_are_rejected() {
        fn shout(_: &[Value], _: &mut Interpreter) -> Value {
            Value::NULL
        }
        let image = build("let a = len;", "a.ql").unwrap();
        let mut image = image;
        image.builtins = vec!["shout".into()];
        let mut interp = Interpreter::new();
        assert!(matches!(image.clone().instantiate(&mut interp), Err(ArtifactError::UnknownBuiltin(_))));
        interp.register_builtin("shout", shout);
        assert!(image.instantiate(&mut interp).is_ok());
    }

    #[test]
    fn corrupt_operands_are_rejected() {
        let mut image = build("let a = \"s\";", "a.ql").unwrap();
        image.constants.clear();
        let mut interp = Interpreter::new();
        assert!(matches!(image.instantiate(&mut interp), Err(ArtifactError::Corrupt(_))));
    }
}
