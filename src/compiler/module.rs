//! `require("name")`: module lookup and inline compilation.
//!
//! A source module compiles into a zero-argument function that returns
//! the map of its top-level definitions. Its value lives in a hidden
//! global keyed by the module's canonical path, so every `require` of the
//! same file yields the same map and the body runs at most once.
//! Pre-built `.qlc` artifacts are loaded by the VM (`MODULE`).

use std::path::{Path, PathBuf};

use super::{CompileErrorKind, Compiler, Result, Unit, PLACEHOLDER};
use crate::bytecode::Op;
use crate::source::Span;
use crate::symbols::SymbolTable;

pub(crate) const SOURCE_EXTENSION: &str = "ql";
pub(crate) const ARTIFACT_EXTENSION: &str = "qlc";

/// First match for `name` across `roots`: `name.ql`, then `name.qlc`,
/// then `name` as written when it already carries an extension.
pub(crate) fn find_module(roots: &[PathBuf], name: &str) -> Option<PathBuf> {
    for root in roots {
        for ext in [SOURCE_EXTENSION, ARTIFACT_EXTENSION] {
            let candidate = root.join(format!("{name}.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        let literal = root.join(name);
        if literal.extension().is_some() && literal.is_file() {
            return Some(literal);
        }
    }
    None
}

pub(crate) fn is_artifact(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION)
}

impl Compiler<'_> {
    pub(super) fn require(&mut self, name: &str, span: Span) -> Result<()> {
        let roots = self.interp.options.search_roots(self.unit.dir.clone());
        let found = find_module(&roots, name)
            .ok_or_else(|| self.error_at(span, CompileErrorKind::ModuleNotFound(name.to_string())))?;
        let path = found.canonicalize().unwrap_or(found);
        let path_text = path.to_string_lossy().into_owned();
        log::debug!("require '{name}' -> {path_text}");

        if is_artifact(&path) {
            let k = self.string_constant(&path_text)?;
            self.emit(Op::Const, &[k]);
            self.emit(Op::Module, &[]);
            return Ok(());
        }

        let slot_name = format!("require:{path_text}");
        let slot = match self.symbols.lookup_global(&slot_name) {
            Some(existing) => existing.clone(),
            None => {
                let symbol = self.symbols.define_global(&slot_name);
                self.interp.ensure_global(symbol.index);
                symbol
            }
        };

        // Already initialised by an earlier run or still being compiled
        // (a cycle): read the slot as is.
        let k = match self.modules.get(&path_text) {
            Some(&k) => k,
            None if !self.interp.globals[slot.index].is_null() || self.loading.contains(&path_text) => {
                return self.load(&slot);
            }
            None => self.compile_module_source(&path, &path_text, span)?,
        };

        // LOAD slot; CHK 1 done; <call module>; STORE slot; done:
        self.load(&slot)?;
        let chk = self.emit(Op::Chk, &[1, PLACEHOLDER]);
        self.emit_closure(k, &[])?;
        self.emit(Op::Call, &[0]);
        self.store(&slot)?;
        self.patch_here(chk, 1)
    }

    /// Compile the module body as a function constant seeing only the
    /// global scope.
    fn compile_module_source(&mut self, path: &Path, path_text: &str, span: Span) -> Result<u16> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            self.error_at(
                span,
                CompileErrorKind::ModuleIo { path: path_text.to_string(), reason: e.to_string() },
            )
        })?;
        let unit = Unit::new(&source, path_text)?;
        let saved_unit = std::mem::replace(&mut self.unit, unit);
        let (root, levels) = std::mem::take(&mut self.symbols).unwind();
        self.symbols = root;
        self.loading.push(path_text.to_string());

        self.begin_function(None);
        let name = format!("<module {}>", path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default());
        let compiled = self
            .module_body()
            .and_then(|_| self.finish_function(Some(name), 0, false));

        self.loading.pop();
        self.unit = saved_unit;
        let (k, _) = compiled?;
        let root = std::mem::take(&mut self.symbols);
        self.symbols = SymbolTable::rewind(root, levels);
        self.modules.insert(path_text.to_string(), k);
        Ok(k)
    }
}
