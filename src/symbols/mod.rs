use std::collections::HashMap;

use crate::value::ValueType;

/// Where a symbol's value lives at runtime. The discriminant is the scope
/// operand of `LOAD`/`STORE`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Builtin = 0,
    Global = 1,
    Local = 2,
    Free = 3,
    /// Self-reference of the named function being compiled.
    Function = 4,
    Type = 5,
}

impl Scope {
    pub fn from_code(code: u16) -> Option<Scope> {
        match code {
            0 => Some(Scope::Builtin),
            1 => Some(Scope::Global),
            2 => Some(Scope::Local),
            3 => Some(Scope::Free),
            4 => Some(Scope::Function),
            5 => Some(Scope::Type),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Scope::Builtin => "BUILTIN",
            Scope::Global => "GLOBAL",
            Scope::Local => "LOCAL",
            Scope::Free => "FREE",
            Scope::Function => "FUNCTION",
            Scope::Type => "TYPE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: Scope,
    pub index: usize,
}

/// One lexical scope. The root table (no parent) holds builtins, type
/// names and globals; every function body gets an enclosed table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    parent: Option<Box<SymbolTable>>,
    store: HashMap<String, Symbol>,
    free: Vec<Symbol>,
    n_definitions: usize,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn enclosed(parent: SymbolTable) -> Self {
        SymbolTable { parent: Some(Box::new(parent)), ..SymbolTable::default() }
    }

    /// Detach from the parent, returning it.
    pub fn into_parent(self) -> Option<SymbolTable> {
        self.parent.map(|p| *p)
    }

    /// Walk up to the outermost table, dropping the nested ones.
    pub fn into_root(mut self) -> SymbolTable {
        while let Some(parent) = self.parent.take() {
            self = *parent;
        }
        self
    }

    /// Split the chain into the root and the nested tables, outermost
    /// first. `rewind` puts it back together.
    pub fn unwind(mut self) -> (SymbolTable, Vec<SymbolTable>) {
        let mut levels = Vec::new();
        while let Some(parent) = self.parent.take() {
            levels.push(self);
            self = *parent;
        }
        levels.reverse();
        (self, levels)
    }

    pub fn rewind(root: SymbolTable, levels: Vec<SymbolTable>) -> SymbolTable {
        levels.into_iter().fold(root, |parent, mut level| {
            level.parent = Some(Box::new(parent));
            level
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn n_definitions(&self) -> usize {
        self.n_definitions
    }

    pub fn free_symbols(&self) -> &[Symbol] {
        &self.free
    }

    /// LOCAL when enclosed, GLOBAL at the root. Indices are contiguous
    /// from 0 within this table.
    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.parent.is_some() { Scope::Local } else { Scope::Global };
        let symbol = Symbol { name: name.to_string(), scope, index: self.n_definitions };
        self.n_definitions += 1;
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Define in the root table regardless of nesting.
    pub fn define_global(&mut self, name: &str) -> Symbol {
        match self.parent.as_mut() {
            Some(parent) => parent.define_global(name),
            None => self.define(name),
        }
    }

    pub fn define_fun(&mut self, name: &str) -> Symbol {
        let symbol = Symbol { name: name.to_string(), scope: Scope::Function, index: 0 };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol { name: name.to_string(), scope: Scope::Builtin, index };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn define_type(&mut self, ty: ValueType) -> Symbol {
        let symbol = Symbol { name: ty.name().to_string(), scope: Scope::Type, index: ty as usize };
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    /// Symbol stored in this table only, ignoring parents.
    pub fn lookup_here(&self, name: &str) -> Option<&Symbol> {
        self.store.get(name)
    }

    pub fn lookup_global(&self, name: &str) -> Option<&Symbol> {
        match &self.parent {
            Some(parent) => parent.lookup_global(name),
            None => self.store.get(name),
        }
    }

    /// Resolve through enclosing scopes. LOCAL and FREE symbols of an
    /// ancestor, and this table's own FUNCTION self-reference, are captured
    /// into the free list; BUILTIN, GLOBAL and TYPE pass through.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            if symbol.scope == Scope::Function {
                let symbol = symbol.clone();
                return Some(self.define_free(symbol));
            }
            return Some(symbol.clone());
        }
        let outer = self.parent.as_mut()?.resolve(name)?;
        match outer.scope {
            Scope::Global | Scope::Builtin | Scope::Type => Some(outer),
            Scope::Local | Scope::Free | Scope::Function => Some(self.define_free(outer)),
        }
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        log::trace!("capture '{}' ({} {}) as free {}", original.name, original.scope.name(), original.index, self.free.len());
        let symbol = Symbol { name: original.name.clone(), scope: Scope::Free, index: self.free.len() };
        self.free.push(original);
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    /// LOCAL/GLOBAL definitions of this table in index order.
    pub fn definitions(&self) -> Vec<&Symbol> {
        let mut defs: Vec<&Symbol> = self
            .store
            .values()
            .filter(|s| matches!(s.scope, Scope::Local | Scope::Global))
            .collect();
        defs.sort_by_key(|s| s.index);
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, scope: Scope, index: usize) -> Symbol {
        Symbol { name: name.to_string(), scope, index }
    }

    #[test]
    fn root_definitions_are_global() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define("a"), sym("a", Scope::Global, 0));
        assert_eq!(table.define("b"), sym("b", Scope::Global, 1));
        assert_eq!(table.resolve("a"), Some(sym("a", Scope::Global, 0)));
    }

    #[test]
    fn enclosed_definitions_are_local_and_contiguous() {
        let mut root = SymbolTable::new();
        root.define("g");
        let mut inner = SymbolTable::enclosed(root);
        assert_eq!(inner.define("x"), sym("x", Scope::Local, 0));
        assert_eq!(inner.define("y"), sym("y", Scope::Local, 1));
        assert_eq!(inner.n_definitions(), 2);
        assert_eq!(inner.resolve("g"), Some(sym("g", Scope::Global, 0)));
        assert!(inner.free_symbols().is_empty());
    }

    #[test]
    fn nested_locals_become_free() {
        let root = SymbolTable::new();
        let mut outer = SymbolTable::enclosed(root);
        outer.define("a");
        outer.define("b");
        let mut inner = SymbolTable::enclosed(outer);
        inner.define("c");

        assert_eq!(inner.resolve("b"), Some(sym("b", Scope::Free, 0)));
        assert_eq!(inner.resolve("a"), Some(sym("a", Scope::Free, 1)));
        // Second lookup reuses the slot.
        assert_eq!(inner.resolve("b"), Some(sym("b", Scope::Free, 0)));
        assert_eq!(inner.resolve("c"), Some(sym("c", Scope::Local, 0)));
        assert_eq!(
            inner.free_symbols(),
            &[sym("b", Scope::Local, 1), sym("a", Scope::Local, 0)]
        );
    }

    #[test]
    fn free_variables_chain_through_intermediate_scopes() {
        let root = SymbolTable::new();
        let mut first = SymbolTable::enclosed(root);
        first.define("x");
        let second = SymbolTable::enclosed(first);
        let mut third = SymbolTable::enclosed(second);

        assert_eq!(third.resolve("x"), Some(sym("x", Scope::Free, 0)));
        assert_eq!(third.free_symbols(), &[sym("x", Scope::Free, 0)]);
        let second = third.into_parent().unwrap();
        assert_eq!(second.free_symbols(), &[sym("x", Scope::Local, 0)]);
    }

    #[test]
    fn builtins_and_types_pass_through() {
        let mut root = SymbolTable::new();
        root.define_builtin(3, "len");
        root.define_type(ValueType::List);
        let mut inner = SymbolTable::enclosed(SymbolTable::enclosed(root));
        assert_eq!(inner.resolve("len"), Some(sym("len", Scope::Builtin, 3)));
        assert_eq!(inner.resolve("List"), Some(sym("List", Scope::Type, ValueType::List as usize)));
        assert!(inner.free_symbols().is_empty());
    }

    #[test]
    fn function_self_reference_is_captured() {
        let root = SymbolTable::new();
        let mut body = SymbolTable::enclosed(root);
        body.define_fun("fib");
        body.define("n");
        assert_eq!(body.resolve("fib"), Some(sym("fib", Scope::Free, 0)));
        assert_eq!(body.free_symbols(), &[sym("fib", Scope::Function, 0)]);
    }

    #[test]
    fn define_global_from_nested_scope() {
        let mut inner = SymbolTable::enclosed(SymbolTable::enclosed(SymbolTable::new()));
        assert_eq!(inner.define_global("g"), sym("g", Scope::Global, 0));
        assert_eq!(inner.lookup_global("g"), Some(&sym("g", Scope::Global, 0)));
        assert!(inner.lookup_here("g").is_none());
    }

    #[test]
    fn unwind_and_rewind_keep_nesting() {
        let mut root = SymbolTable::new();
        root.define("g");
        let mut outer = SymbolTable::enclosed(root);
        outer.define("a");
        let mut inner = SymbolTable::enclosed(outer);
        inner.define("b");

        let (root, levels) = inner.unwind();
        assert!(root.is_root());
        assert_eq!(levels.len(), 2);
        assert!(levels[0].lookup_here("a").is_some());
        assert!(levels[1].lookup_here("b").is_some());

        let mut inner = SymbolTable::rewind(root, levels);
        assert_eq!(inner.resolve("a"), Some(sym("a", Scope::Free, 0)));
        assert_eq!(inner.into_root().lookup_here("g"), Some(&sym("g", Scope::Global, 0)));
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let mut inner = SymbolTable::enclosed(SymbolTable::new());
        assert_eq!(inner.resolve("missing"), None);
    }
}
