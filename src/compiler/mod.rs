//! Single-pass compiler: Pratt expression parsing that emits bytecode
//! directly, with no intermediate tree.
//!
//! The compiler borrows the interpreter for the duration of one
//! translation unit. New constants and function objects go straight into
//! the shared constant pool; the root symbol table is taken out of the
//! interpreter and put back when compilation ends, successful or not.

pub mod error;
mod module;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub use error::{CompileError, CompileErrorKind};

use crate::bytecode::{Instructions, Op};
use crate::interpreter::Interpreter;
use crate::lexer::{LexError, LexErrorKind, Lexer, Number, Token};
use crate::options::OptionValue;
use crate::source::{SourceMap, Span};
use crate::symbols::{Scope, Symbol, SymbolTable};
use crate::value::{Function, Payload, Value};

pub const MAX_PARAMS: usize = 255;

const PLACEHOLDER: u16 = u16::MAX;

type Result<T> = std::result::Result<T, CompileError>;

/// Compile a program. The result is a Function object whose body ends in
/// `HLT`; top-level definitions are globals.
pub fn compile_program(interp: &mut Interpreter, source: &str, filename: &str) -> Result<Value> {
    let unit = Unit::new(source, filename)?;
    let mut compiler = Compiler::new(interp, unit);
    let result = compiler.program();
    compiler.finish();
    result
}

/// Compile a source file as a module: top-level definitions are locals
/// and the body returns a map of them.
pub fn compile_module(interp: &mut Interpreter, source: &str, filename: &str) -> Result<Value> {
    let unit = Unit::new(source, filename)?;
    let mut compiler = Compiler::new(interp, unit);
    let result = compiler.standalone_module();
    compiler.finish();
    result
}

/// Binding power of infix operators, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    BitOr,
    BitAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary | Precedence::Call => Precedence::Call,
        }
    }
}

fn infix_precedence(token: Option<&Token>) -> Precedence {
    match token {
        Some(Token::Or) => Precedence::Or,
        Some(Token::And) => Precedence::And,
        Some(Token::Pipe) => Precedence::BitOr,
        Some(Token::Amp) => Precedence::BitAnd,
        Some(Token::EqEq | Token::NotEq) => Precedence::Equality,
        Some(Token::Less | Token::Greater | Token::LessEq | Token::GreaterEq) => Precedence::Comparison,
        Some(Token::ShiftLeft | Token::ShiftRight) => Precedence::Shift,
        Some(Token::Plus | Token::Minus) => Precedence::Term,
        Some(Token::Star | Token::Slash | Token::Percent) => Precedence::Factor,
        Some(Token::LParen | Token::LBracket | Token::LBrace | Token::Dot) => Precedence::Call,
        _ => Precedence::None,
    }
}

fn binary_op(token: &Token) -> Option<Op> {
    Some(match token {
        Token::Plus => Op::Add,
        Token::Minus => Op::Sub,
        Token::Star => Op::Mul,
        Token::Slash => Op::Div,
        Token::Percent => Op::Mod,
        Token::ShiftLeft => Op::LShift,
        Token::ShiftRight => Op::RShift,
        Token::Amp => Op::And,
        Token::Pipe => Op::Or,
        Token::EqEq => Op::Eq,
        Token::NotEq => Op::Ne,
        Token::Less => Op::Lt,
        Token::LessEq => Op::Le,
        Token::Greater => Op::Gt,
        Token::GreaterEq => Op::Ge,
        _ => return None,
    })
}

/// True for names a program can write; hidden compiler temporaries and
/// module slots are not identifiers.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One source text being compiled.
struct Unit {
    lexer: Lexer,
    map: SourceMap,
    filename: String,
    dir: Option<PathBuf>,
}

impl Unit {
    fn new(source: &str, filename: &str) -> Result<Unit> {
        // A leading `#!/path/to/quill` line is not an option.
        let blanked;
        let text = if source.starts_with("#!") && !source.starts_with("#![") {
            let end = source.find('\n').unwrap_or(source.len());
            blanked = format!("{}{}", " ".repeat(end), &source[end..]);
            blanked.as_str()
        } else {
            source
        };
        let map = SourceMap::new(text);
        let lexer = Lexer::new(text).map_err(|e| lex_error(e, text, &map, filename))?;
        let dir = Path::new(filename)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Ok(Unit { lexer, map, filename: filename.to_string(), dir })
    }
}

fn lex_error(err: LexError, source: &str, map: &SourceMap, filename: &str) -> CompileError {
    let kind = match err.kind {
        LexErrorKind::UnexpectedCharacter => CompileErrorKind::UnexpectedCharacter(
            source.get(err.span.start..err.span.end).unwrap_or("").to_string(),
        ),
        LexErrorKind::UnterminatedString => CompileErrorKind::UnterminatedString,
        LexErrorKind::InvalidEscape(c) => CompileErrorKind::InvalidEscape(c),
        LexErrorKind::InvalidNumber(raw) => CompileErrorKind::InvalidNumber(raw),
    };
    CompileError::new(kind, filename, map.position(err.span.start), err.span)
}

#[derive(Default)]
struct Loop {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

#[derive(Default)]
struct FunctionScope {
    code: Instructions,
    loops: Vec<Loop>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Number(u64),
    Str(String),
}

pub(crate) struct Compiler<'a> {
    interp: &'a mut Interpreter,
    unit: Unit,
    symbols: SymbolTable,
    /// Function being emitted; enclosing ones wait in `outer`.
    scope: FunctionScope,
    outer: Vec<FunctionScope>,
    constant_index: HashMap<ConstKey, u16>,
    /// Name for the next function literal, set by `let name = fun ...`.
    pending_name: Option<String>,
    hidden: usize,
    /// Function constants of source modules compiled in this unit.
    modules: HashMap<String, u16>,
    /// Modules whose bodies are being compiled, innermost last.
    loading: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn new(interp: &'a mut Interpreter, unit: Unit) -> Self {
        let symbols = std::mem::take(&mut interp.symbols);
        Compiler {
            interp,
            unit,
            symbols,
            scope: FunctionScope::default(),
            outer: Vec::new(),
            constant_index: HashMap::new(),
            pending_name: None,
            hidden: 0,
            modules: HashMap::new(),
            loading: Vec::new(),
        }
    }

    /// Hand the root symbol table back to the interpreter.
    fn finish(mut self) {
        let symbols = std::mem::take(&mut self.symbols);
        self.interp.symbols = symbols.into_root();
    }

    fn program(&mut self) -> Result<Value> {
        let mut trailing_expression = false;
        while !self.unit.lexer.at_end() {
            trailing_expression = self.statement()?;
        }
        if trailing_expression && self.code_ref().ends_with(Op::Pop) {
            self.code_mut().remove_last();
        }
        self.emit(Op::Hlt, &[]);
        let scope = std::mem::take(&mut self.scope);
        let k = self.make_function(Some("<script>".to_string()), scope.code, 0, 0, false)?;
        Ok(self.interp.constants[k as usize])
    }

    fn standalone_module(&mut self) -> Result<Value> {
        self.begin_function(None);
        self.module_body()?;
        let name = format!("<module {}>", self.unit.filename);
        let (k, _) = self.finish_function(Some(name), 0, false)?;
        Ok(self.interp.constants[k as usize])
    }

    /// Statements up to end of input, then `MAP k; RET` over the
    /// top-level definitions.
    fn module_body(&mut self) -> Result<()> {
        while !self.unit.lexer.at_end() {
            self.statement()?;
        }
        let exports: Vec<Symbol> = self
            .symbols
            .definitions()
            .into_iter()
            .filter(|s| is_identifier(&s.name))
            .cloned()
            .collect();
        for symbol in &exports {
            let k = self.string_constant(&symbol.name)?;
            self.emit(Op::Const, &[k]);
            self.load(symbol)?;
        }
        let count = self.u16_operand(exports.len())?;
        self.emit(Op::Map, &[count]);
        self.emit(Op::Ret, &[]);
        Ok(())
    }

    // ---- token helpers ----

    fn cur(&self) -> Option<&Token> {
        self.unit.lexer.cur()
    }

    fn check(&self, token: &Token) -> bool {
        self.unit.lexer.cur() == Some(token)
    }

    fn matches(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.unit.lexer.eat();
            true
        } else {
            false
        }
    }

    fn span(&self) -> Span {
        self.unit.lexer.span()
    }

    fn found(&self) -> String {
        self.cur().map(Token::describe).unwrap_or_else(|| "end of input".to_string())
    }

    fn error_at(&self, span: Span, kind: CompileErrorKind) -> CompileError {
        CompileError::new(kind, &self.unit.filename, self.unit.map.position(span.start), span)
    }

    fn error(&self, kind: CompileErrorKind) -> CompileError {
        self.error_at(self.span(), kind)
    }

    fn syntax(&self, message: String) -> CompileError {
        self.error(CompileErrorKind::Syntax(message))
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<()> {
        if self.matches(&token) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected {what}, found {}", self.found())))
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        match self.cur() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.unit.lexer.eat();
                Ok(name)
            }
            Some(reserved @ (Token::Class | Token::Native | Token::As)) => {
                Err(self.error(CompileErrorKind::Reserved(reserved.describe())))
            }
            _ => Err(self.syntax(format!("expected {what}, found {}", self.found()))),
        }
    }

    // ---- emission ----

    fn code_ref(&self) -> &Instructions {
        &self.scope.code
    }

    fn code_mut(&mut self) -> &mut Instructions {
        &mut self.scope.code
    }

    fn line(&self) -> u32 {
        self.unit.map.lookup(self.unit.lexer.prev_span().start).0 as u32
    }

    fn emit(&mut self, op: Op, operands: &[u16]) -> usize {
        let line = self.line();
        self.code_mut().emit(op, operands, line)
    }

    fn u16_operand(&self, n: usize) -> Result<u16> {
        u16::try_from(n).map_err(|_| self.syntax(format!("operand {n} does not fit in 16 bits")))
    }

    fn here(&self) -> Result<u16> {
        u16::try_from(self.code_ref().len()).map_err(|_| self.error(CompileErrorKind::JumpTooFar))
    }

    /// Point operand `slot` of the jump at `at` to the current end.
    fn patch_here(&mut self, at: usize, slot: usize) -> Result<()> {
        let target = self.here()?;
        let code = self.code_mut();
        code.patch(at, slot, target);
        code.mark_label();
        Ok(())
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op, &[PLACEHOLDER])
    }

    fn emit_jump_back(&mut self, target: u16) {
        self.emit(Op::Jmp, &[target]);
    }

    fn constant(&mut self, value: Value, key: Option<ConstKey>) -> Result<u16> {
        if let Some(&k) = key.as_ref().and_then(|key| self.constant_index.get(key)) {
            return Ok(k);
        }
        let index = self.interp.add_constant(value);
        let k = u16::try_from(index).map_err(|_| self.error(CompileErrorKind::TooManyConstants))?;
        if let Some(key) = key {
            self.constant_index.insert(key, k);
        }
        Ok(k)
    }

    fn number_constant(&mut self, value: Value) -> Result<u16> {
        self.constant(value, Some(ConstKey::Number(value.bits())))
    }

    fn string_constant(&mut self, s: &str) -> Result<u16> {
        let key = ConstKey::Str(s.to_string());
        if let Some(&k) = self.constant_index.get(&key) {
            return Ok(k);
        }
        let value = self.interp.heap.string(s);
        self.constant(value, Some(key))
    }

    fn integer(&mut self, n: i64) -> Result<()> {
        match i16::try_from(n) {
            Ok(small) => {
                self.emit(Op::ConstInt, &[small as u16]);
            }
            Err(_) => {
                let k = self.number_constant(Value::int(n))?;
                self.emit(Op::Const, &[k]);
            }
        }
        Ok(())
    }

    fn load(&mut self, symbol: &Symbol) -> Result<()> {
        let index = self.u16_operand(symbol.index)?;
        self.emit(Op::Load, &[symbol.scope.code(), index]);
        Ok(())
    }

    fn store(&mut self, symbol: &Symbol) -> Result<()> {
        let index = self.u16_operand(symbol.index)?;
        self.emit(Op::Store, &[symbol.scope.code(), index]);
        Ok(())
    }

    // ---- scopes ----

    fn begin_function(&mut self, name: Option<&str>) {
        let parent = std::mem::take(&mut self.symbols);
        self.symbols = SymbolTable::enclosed(parent);
        if let Some(name) = name {
            self.symbols.define_fun(name);
        }
        let enclosing = std::mem::take(&mut self.scope);
        self.outer.push(enclosing);
    }

    fn pop_scope(&mut self) -> FunctionScope {
        let enclosing = self.outer.pop().unwrap_or_default();
        std::mem::replace(&mut self.scope, enclosing)
    }

    /// Close the innermost function: make sure it ends in `RET`, leave its
    /// symbol table, and add it to the constant pool. Returns the constant
    /// index and the captured symbols, in free-slot order.
    fn finish_function(
        &mut self,
        name: Option<String>,
        n_params: usize,
        is_variadic: bool,
    ) -> Result<(u16, Vec<Symbol>)> {
        if self.code_ref().ends_with(Op::Pop) {
            self.code_mut().replace_last(Op::Ret);
        } else if !self.code_ref().ends_with(Op::Ret) {
            self.emit(Op::ConstNull, &[]);
            self.emit(Op::Ret, &[]);
        }
        let scope = self.pop_scope();
        let table = std::mem::take(&mut self.symbols);
        let free = table.free_symbols().to_vec();
        let n_locals = table.n_definitions();
        self.symbols = table.into_parent().unwrap_or_default();
        let k = self.make_function(name, scope.code, n_locals, n_params, is_variadic)?;
        Ok((k, free))
    }

    /// Push captured values and build the closure. A capture of the
    /// function's own name gets a null placeholder, then `SET_SELF`.
    fn emit_closure(&mut self, k: u16, free: &[Symbol]) -> Result<()> {
        let mut self_slots = Vec::new();
        for (slot, symbol) in free.iter().enumerate() {
            if symbol.scope == Scope::Function {
                self.emit(Op::ConstNull, &[]);
                self_slots.push(slot);
            } else {
                self.load(symbol)?;
            }
        }
        let count = self.u16_operand(free.len())?;
        self.emit(Op::Closure, &[k, count]);
        for slot in self_slots {
            let slot = self.u16_operand(slot)?;
            self.emit(Op::SetSelf, &[slot]);
        }
        Ok(())
    }

    fn make_function(
        &mut self,
        name: Option<String>,
        code: Instructions,
        n_locals: usize,
        n_params: usize,
        is_variadic: bool,
    ) -> Result<u16> {
        let (instructions, debug_info) = code.into_parts(&self.unit.filename);
        let function = Function {
            id: self.interp.next_function_id(),
            name,
            instructions,
            n_locals,
            n_params,
            is_variadic,
            debug_info,
        };
        let value = self.interp.heap.alloc(Payload::Function(Rc::new(function)));
        self.constant(value, None)
    }

    /// Define `name` in the current scope, or in the root one for
    /// `let global`.
    fn check_duplicate(&self, name: &str, global: bool, span: Span) -> Result<()> {
        let existing = if global {
            self.symbols.lookup_global(name)
        } else {
            self.symbols.lookup_here(name)
        };
        if existing.is_some_and(|s| matches!(s.scope, Scope::Local | Scope::Global)) {
            return Err(self.error_at(span, CompileErrorKind::DuplicateDefinition(name.to_string())));
        }
        Ok(())
    }

    fn declare(&mut self, name: &str, global: bool, span: Span) -> Result<Symbol> {
        self.check_duplicate(name, global, span)?;
        let symbol = if global { self.symbols.define_global(name) } else { self.symbols.define(name) };
        if symbol.scope == Scope::Global {
            self.interp.ensure_global(symbol.index);
        }
        Ok(symbol)
    }

    /// Compiler temporary; the name can never clash with a program name.
    fn hidden(&mut self, what: &str) -> Symbol {
        self.hidden += 1;
        let name = format!("@{what}{}", self.hidden);
        let symbol = match self.symbols.lookup_here(&name) {
            Some(existing) if matches!(existing.scope, Scope::Local | Scope::Global) => existing.clone(),
            _ => self.symbols.define(&name),
        };
        if symbol.scope == Scope::Global {
            self.interp.ensure_global(symbol.index);
        }
        symbol
    }

    fn resolve(&mut self, name: &str, span: Span) -> Result<Symbol> {
        self.symbols
            .resolve(name)
            .ok_or_else(|| self.error_at(span, CompileErrorKind::UndefinedVariable(name.to_string())))
    }

    // ---- statements ----

    /// Returns true for an expression statement.
    fn statement(&mut self) -> Result<bool> {
        match self.cur() {
            Some(Token::Let) => self.let_statement()?,
            Some(Token::Return) => self.return_statement()?,
            Some(Token::If) => self.if_statement()?,
            Some(Token::For) => self.for_statement()?,
            Some(Token::Break) => self.loop_control(Op::Break)?,
            Some(Token::Continue) => self.loop_control(Op::Continue)?,
            Some(Token::Defer) => self.defer_statement()?,
            Some(Token::Shebang) => self.option_statement()?,
            Some(Token::Semicolon) => {
                self.unit.lexer.eat();
            }
            Some(Token::Fun) if matches!(self.unit.lexer.peek(), Some(Token::Ident(_))) => {
                self.function_statement()?
            }
            Some(reserved @ (Token::Class | Token::Native | Token::As)) => {
                return Err(self.error(CompileErrorKind::Reserved(reserved.describe())));
            }
            _ => {
                self.expression()?;
                self.expect(Token::Semicolon, "';' after expression")?;
                self.emit(Op::Pop, &[]);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn block(&mut self) -> Result<()> {
        self.expect(Token::LBrace, "'{'")?;
        while !self.check(&Token::RBrace) && !self.unit.lexer.at_end() {
            self.statement()?;
        }
        self.expect(Token::RBrace, "'}'")
    }

    fn block_or_statement(&mut self) -> Result<()> {
        if self.check(&Token::LBrace) {
            self.block()
        } else {
            self.statement().map(|_| ())
        }
    }

    fn let_statement(&mut self) -> Result<()> {
        self.unit.lexer.eat();
        let global = self.matches(&Token::Global);
        let span = self.span();
        let name = self.identifier("variable name")?;
        self.check_duplicate(&name, global, span)?;
        self.expect(Token::Assign, "'=' in let")?;
        self.pending_name = Some(name.clone());
        self.expression()?;
        self.pending_name = None;
        let symbol = self.declare(&name, global, span)?;
        self.store(&symbol)?;
        self.emit(Op::Pop, &[]);
        self.expect(Token::Semicolon, "';' after let")
    }

    fn return_statement(&mut self) -> Result<()> {
        self.unit.lexer.eat();
        if self.check(&Token::Semicolon) {
            self.emit(Op::ConstNull, &[]);
        } else {
            self.expression()?;
        }
        self.emit(Op::Ret, &[]);
        self.expect(Token::Semicolon, "';' after return")
    }

    fn if_statement(&mut self) -> Result<()> {
        self.unit.lexer.eat();
        self.expect(Token::LParen, "'(' after if")?;
        self.expression()?;
        self.expect(Token::RParen, "')' after condition")?;
        let skip_then = self.emit_jump(Op::Jnz);
        self.block_or_statement()?;
        if self.matches(&Token::Else) {
            let skip_else = self.emit_jump(Op::Jmp);
            self.patch_here(skip_then, 0)?;
            self.block_or_statement()?;
            self.patch_here(skip_else, 0)
        } else {
            self.patch_here(skip_then, 0)
        }
    }

    fn for_statement(&mut self) -> Result<()> {
        self.unit.lexer.eat();
        self.expect(Token::LParen, "'(' after for")?;
        if matches!(self.cur(), Some(Token::Ident(_))) && self.unit.lexer.peek() == Some(&Token::In) {
            return self.for_in();
        }

        let start = self.here()?;
        let c_style = if self.matches(&Token::Semicolon) {
            true
        } else if self.check(&Token::Let) {
            self.let_statement()?;
            true
        } else {
            self.expression()?;
            if self.matches(&Token::Semicolon) {
                self.emit(Op::Pop, &[]);
                true
            } else {
                false
            }
        };

        if !c_style {
            // for (cond): the condition is already at `start`.
            self.expect(Token::RParen, "')' after loop condition")?;
            let exit = self.emit_jump(Op::Jnz);
            let body = self.loop_body()?;
            self.emit_jump_back(start);
            self.patch_here(exit, 0)?;
            return self.close_loop(body, start);
        }

        let cond_start = self.here()?;
        let exit = if self.check(&Token::Semicolon) {
            None
        } else {
            self.expression()?;
            Some(self.emit_jump(Op::Jnz))
        };
        self.expect(Token::Semicolon, "';' after loop condition")?;
        let to_body = self.emit_jump(Op::Jmp);
        let step = self.here()?;
        if !self.check(&Token::RParen) {
            self.expression()?;
            self.emit(Op::Pop, &[]);
        }
        self.emit_jump_back(cond_start);
        self.expect(Token::RParen, "')' after loop header")?;
        self.patch_here(to_body, 0)?;
        let body = self.loop_body()?;
        self.emit_jump_back(step);
        if let Some(exit) = exit {
            self.patch_here(exit, 0)?;
        }
        self.close_loop(body, step)
    }

    fn for_in(&mut self) -> Result<()> {
        let span = self.span();
        let name = self.identifier("loop variable")?;
        self.expect(Token::In, "'in'")?;
        self.expression()?;
        self.expect(Token::RParen, "')' after iterable")?;

        let iter = self.hidden("iter");
        let index = self.hidden("index");
        let var = match self.symbols.lookup_here(&name) {
            Some(s) if matches!(s.scope, Scope::Local | Scope::Global) => s.clone(),
            _ => self.declare(&name, false, span)?,
        };

        self.store(&iter)?;
        self.emit(Op::Pop, &[]);
        self.emit(Op::ConstInt, &[0]);
        self.store(&index)?;
        self.emit(Op::Pop, &[]);

        let start = self.here()?;
        self.load(&index)?;
        self.load(&iter)?;
        self.emit(Op::Size, &[]);
        self.emit(Op::Lt, &[]);
        let exit = self.emit_jump(Op::Jnz);
        self.load(&iter)?;
        self.load(&index)?;
        self.emit(Op::Index, &[1]);
        self.store(&var)?;
        self.emit(Op::Pop, &[]);

        let body = self.loop_body()?;
        let step = self.here()?;
        self.load(&index)?;
        self.emit(Op::ConstInt, &[1]);
        self.emit(Op::Add, &[]);
        self.store(&index)?;
        self.emit(Op::Pop, &[]);
        self.emit_jump_back(start);
        self.patch_here(exit, 0)?;
        self.close_loop(body, step)
    }

    fn loop_body(&mut self) -> Result<Loop> {
        self.scope.loops.push(Loop::default());
        let result = self.block_or_statement();
        let body = self.scope.loops.pop().unwrap_or_default();
        result.map(|_| body)
    }

    /// Patch `break`s to the current end and `continue`s to `next`.
    fn close_loop(&mut self, body: Loop, next: u16) -> Result<()> {
        for at in body.breaks {
            self.patch_here(at, 0)?;
        }
        for at in body.continues {
            self.code_mut().patch(at, 0, next);
        }
        Ok(())
    }

    fn loop_control(&mut self, op: Op) -> Result<()> {
        let word = if op == Op::Break { "break" } else { "continue" };
        if self.scope.loops.is_empty() {
            return Err(self.error(CompileErrorKind::LoopControlOutsideLoop(word)));
        }
        self.unit.lexer.eat();
        let at = self.emit_jump(op);
        if let Some(innermost) = self.scope.loops.last_mut() {
            if op == Op::Break {
                innermost.breaks.push(at);
            } else {
                innermost.continues.push(at);
            }
        }
        self.matches(&Token::Semicolon);
        Ok(())
    }

    fn defer_statement(&mut self) -> Result<()> {
        self.unit.lexer.eat();
        if self.check(&Token::Fun) {
            self.expression()?;
        } else {
            // Wrap the expression in a zero-argument closure.
            self.begin_function(None);
            self.expression()?;
            self.emit(Op::Ret, &[]);
            let (k, free) = self.finish_function(Some("<defer>".to_string()), 0, false)?;
            self.emit_closure(k, &free)?;
        }
        self.emit(Op::Defer, &[]);
        self.expect(Token::Semicolon, "';' after defer")
    }

    fn function_statement(&mut self) -> Result<()> {
        self.unit.lexer.eat();
        let span = self.span();
        let name = self.identifier("function name")?;
        self.check_duplicate(&name, false, span)?;
        self.function_literal(Some(name.clone()))?;
        let symbol = self.declare(&name, false, span)?;
        self.store(&symbol)?;
        self.emit(Op::Pop, &[]);
        Ok(())
    }

    /// `#![NAME]` or `#![NAME(value)]`.
    fn option_statement(&mut self) -> Result<()> {
        self.unit.lexer.eat();
        self.expect(Token::LBracket, "'[' after '#!'")?;
        let span = self.span();
        let name = self.identifier("option name")?;
        let value = if self.matches(&Token::LParen) {
            let value = self.option_value()?;
            self.expect(Token::RParen, "')' after option value")?;
            value
        } else {
            OptionValue::Bool(true)
        };
        self.expect(Token::RBracket, "']' after option")?;
        self.interp
            .options
            .set(&name, value)
            .map_err(|e| self.error_at(span, e.into()))?;
        self.interp.apply_gc_options();
        Ok(())
    }

    fn option_value(&mut self) -> Result<OptionValue> {
        let negative = self.matches(&Token::Minus);
        let value = match self.cur() {
            Some(Token::Number(Number::Integer(n))) => OptionValue::Int(if negative { -n } else { *n }),
            Some(Token::Number(Number::Decimal(d))) => OptionValue::Decimal(if negative { -d } else { *d }),
            Some(Token::Str(s)) if !negative => OptionValue::Str(s.clone()),
            Some(Token::True) if !negative => OptionValue::Bool(true),
            Some(Token::False) if !negative => OptionValue::Bool(false),
            _ => return Err(self.syntax(format!("expected option value, found {}", self.found()))),
        };
        self.unit.lexer.eat();
        Ok(value)
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<()> {
        let pending = self.pending_name.take();
        let span = self.span();
        let Some(token) = self.unit.lexer.eat() else {
            return Err(self.syntax("expected expression, found end of input".to_string()));
        };
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(token, span, can_assign, pending)?;

        while precedence <= infix_precedence(self.cur()) {
            let Some(token) = self.unit.lexer.eat() else { break };
            self.infix(token, can_assign)?;
        }

        if can_assign && (self.check(&Token::Assign) || self.check(&Token::Define)) {
            return Err(self.error(CompileErrorKind::InvalidAssignmentTarget));
        }
        Ok(())
    }

    fn prefix(&mut self, token: Token, span: Span, can_assign: bool, pending: Option<String>) -> Result<()> {
        match token {
            Token::Number(Number::Integer(n)) => self.integer(n)?,
            Token::Number(Number::Decimal(d)) => {
                let k = self.number_constant(Value::decimal(d))?;
                self.emit(Op::Const, &[k]);
            }
            Token::Str(s) => {
                let k = self.string_constant(&s)?;
                self.emit(Op::Const, &[k]);
            }
            Token::Ident(name) => self.variable(&name, span, can_assign)?,
            Token::True => {
                self.emit(Op::ConstTrue, &[]);
            }
            Token::False => {
                self.emit(Op::ConstFalse, &[]);
            }
            Token::Null => {
                self.emit(Op::ConstNull, &[]);
            }
            Token::LBracket => self.list_literal()?,
            Token::LBrace => self.map_literal()?,
            Token::Fun => {
                let name = match self.cur() {
                    Some(Token::Ident(_)) => Some(self.identifier("function name")?),
                    _ => pending,
                };
                self.function_literal(name)?;
            }
            Token::Require => self.require_expression()?,
            Token::LParen => {
                self.expression()?;
                self.expect(Token::RParen, "')'")?;
            }
            Token::Minus => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Op::Neg, &[]);
            }
            Token::Not => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Op::Not, &[]);
            }
            reserved @ (Token::Class | Token::Native | Token::As) => {
                return Err(self.error_at(span, CompileErrorKind::Reserved(reserved.describe())));
            }
            other => {
                return Err(self.error_at(
                    span,
                    CompileErrorKind::Syntax(format!("expected expression, found {}", other.describe())),
                ));
            }
        }
        Ok(())
    }

    fn infix(&mut self, token: Token, can_assign: bool) -> Result<()> {
        match token {
            Token::And | Token::Or => {
                // CHK leaves the left operand when it decides the result.
                let cond = u16::from(token == Token::Or);
                let precedence = infix_precedence(Some(&token));
                let chk = self.emit(Op::Chk, &[cond, PLACEHOLDER]);
                self.parse_precedence(precedence.next())?;
                self.patch_here(chk, 1)
            }
            Token::LParen => {
                let argc = self.arguments()?;
                self.emit(Op::Call, &[argc]);
                Ok(())
            }
            Token::LBrace => {
                self.map_literal()?;
                self.emit(Op::Call, &[1]);
                Ok(())
            }
            Token::Dot => {
                let name = self.identifier("field name after '.'")?;
                let k = self.string_constant(&name)?;
                self.emit(Op::Const, &[k]);
                self.index_or_set(can_assign)
            }
            Token::LBracket => self.subscript(can_assign),
            other => {
                let Some(op) = binary_op(&other) else {
                    return Err(self.syntax(format!("unexpected {}", other.describe())));
                };
                self.parse_precedence(infix_precedence(Some(&other)).next())?;
                self.emit(op, &[]);
                Ok(())
            }
        }
    }

    fn variable(&mut self, name: &str, span: Span, can_assign: bool) -> Result<()> {
        if can_assign && self.matches(&Token::Define) {
            self.check_duplicate(name, false, span)?;
            self.expression()?;
            let symbol = self.declare(name, false, span)?;
            return self.store(&symbol);
        }
        if can_assign && self.matches(&Token::Assign) {
            let symbol = self.resolve(name, span)?;
            if matches!(symbol.scope, Scope::Builtin | Scope::Type | Scope::Function) {
                return Err(self.error_at(span, CompileErrorKind::InvalidAssignmentTarget));
            }
            self.expression()?;
            return self.store(&symbol);
        }
        let symbol = self.resolve(name, span)?;
        self.load(&symbol)
    }

    fn arguments(&mut self) -> Result<u16> {
        let mut count = 0usize;
        if !self.check(&Token::RParen) {
            loop {
                self.expression()?;
                count += 1;
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')' after arguments")?;
        self.u16_operand(count)
    }

    fn list_literal(&mut self) -> Result<()> {
        let mut count = 0usize;
        while !self.check(&Token::RBracket) {
            self.expression()?;
            count += 1;
            if !self.matches(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBracket, "']' after list elements")?;
        let count = self.u16_operand(count)?;
        self.emit(Op::Pack, &[count]);
        Ok(())
    }

    /// `{ key: value, ... }` with identifier or string keys; `{` is eaten.
    fn map_literal(&mut self) -> Result<()> {
        let mut count = 0usize;
        while !self.check(&Token::RBrace) {
            let key = match self.cur() {
                Some(Token::Ident(name)) | Some(Token::Str(name)) => name.clone(),
                _ => return Err(self.syntax(format!("expected map key, found {}", self.found()))),
            };
            self.unit.lexer.eat();
            let k = self.string_constant(&key)?;
            self.emit(Op::Const, &[k]);
            self.expect(Token::Colon, "':' after map key")?;
            self.expression()?;
            count += 1;
            if !self.matches(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace, "'}' after map entries")?;
        let count = self.u16_operand(count)?;
        self.emit(Op::Map, &[count]);
        Ok(())
    }

    /// After `[`: `[i]`, `[a:b]`, `[:b]`, `[a:]`.
    fn subscript(&mut self, can_assign: bool) -> Result<()> {
        if self.matches(&Token::Colon) {
            self.emit(Op::ConstInt, &[0]);
            return self.slice_end();
        }
        self.expression()?;
        if self.matches(&Token::Colon) {
            return self.slice_end();
        }
        self.expect(Token::RBracket, "']' after index")?;
        self.index_or_set(can_assign)
    }

    fn slice_end(&mut self) -> Result<()> {
        if self.check(&Token::RBracket) {
            self.emit(Op::ConstInt, &[(-1i16) as u16]);
        } else {
            self.expression()?;
        }
        self.expect(Token::RBracket, "']' after slice")?;
        self.emit(Op::Index, &[2]);
        Ok(())
    }

    fn index_or_set(&mut self, can_assign: bool) -> Result<()> {
        if can_assign && self.matches(&Token::Assign) {
            self.expression()?;
            self.emit(Op::Set, &[]);
        } else {
            self.emit(Op::Index, &[1]);
        }
        Ok(())
    }

    /// `fun` and any name are already eaten; parameters and body follow.
    fn function_literal(&mut self, name: Option<String>) -> Result<()> {
        self.expect(Token::LParen, "'(' before parameters")?;
        self.begin_function(name.as_deref());
        let mut n_params = 0usize;
        let mut is_variadic = false;
        if !self.check(&Token::RParen) {
            loop {
                let span = self.span();
                let param = self.identifier("parameter name")?;
                self.check_duplicate(&param, false, span)?;
                self.symbols.define(&param);
                n_params += 1;
                if n_params > MAX_PARAMS {
                    return Err(self.error_at(span, CompileErrorKind::TooManyParameters(MAX_PARAMS)));
                }
                if self.matches(&Token::Ellipsis) {
                    is_variadic = true;
                    break;
                }
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')' after parameters")?;
        self.block()?;
        let (k, free) = self.finish_function(name, n_params, is_variadic)?;
        self.emit_closure(k, &free)
    }

    fn require_expression(&mut self) -> Result<()> {
        self.expect(Token::LParen, "'(' after require")?;
        let span = self.span();
        let name = match self.cur() {
            Some(Token::Str(name)) => name.clone(),
            _ => return Err(self.syntax(format!("expected module name string, found {}", self.found()))),
        };
        self.unit.lexer.eat();
        self.expect(Token::RParen, "')' after module name")?;
        self.require(&name, span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble;
    use crate::value::Payload;

    fn compile(source: &str) -> (Interpreter, Value) {
        let mut interp = Interpreter::new();
        let f = compile_program(&mut interp, source, "test.ql").unwrap();
        (interp, f)
    }

    fn compile_err(source: &str) -> CompileError {
        let mut interp = Interpreter::new();
        compile_program(&mut interp, source, "test.ql").unwrap_err()
    }

    fn listing(f: Value) -> String {
        match &*f.as_object().unwrap().payload() {
            Payload::Function(func) => disassemble(func),
            _ => panic!("not a function"),
        }
    }

    fn ops(f: Value) -> Vec<String> {
        listing(f)
            .lines()
            .skip(1)
            .map(|l| l.split_whitespace().skip(2).collect::<Vec<_>>().join(" "))
            .collect()
    }

    #[test]
    fn stray_punctuation_is_a_syntax_error() {
        let e = compile_err("let a = 1 ^ 2;");
        assert_eq!(e.code, "QL-C001");
        assert!(e.message().contains("found '^'"), "got: {}", e.message());
        let e = compile_err("let b = ?;");
        assert!(e.message().contains("expected expression, found '?'"), "got: {}", e.message());
    }

    #[test]
    fn precedence_of_arithmetic() {
        let (_interp, f) = compile("1 + 2 * 3;");
        assert_eq!(ops(f), vec!["CONST_INT 1", "CONST_INT 2", "CONST_INT 3", "MUL", "ADD", "HLT"]);
    }

    #[test]
    fn trailing_pop_kept_for_definitions() {
        let (_interp, f) = compile("let x = 1;");
        assert_eq!(ops(f), vec!["CONST_INT 1", "STORE GLOBAL 0", "POP", "HLT"]);
    }

    #[test]
    fn short_circuit_uses_chk() {
        let (_interp, f) = compile("true and false;");
        let ops = ops(f);
        assert_eq!(ops[0], "CONST_TRUE");
        assert!(ops[1].starts_with("CHK 0 "));
        assert_eq!(ops[2], "CONST_FALSE");
    }

    #[test]
    fn closures_capture_free_variables() {
        let (_interp, f) = compile("let mk = fun(x) { return fun() { return x; }; };");
        let ops = ops(f);
        assert!(ops[0].starts_with("CLOSURE "), "{ops:?}");
        assert!(ops[0].ends_with(" 0"));
    }

    #[test]
    fn named_function_fills_self_slot() {
        let (_interp, f) = compile("fun fact(n) { if (n < 2) { return 1; } return n * fact(n - 1); }");
        let ops = ops(f);
        assert_eq!(ops[0], "CONST_NULL");
        assert!(ops[1].starts_with("CLOSURE ") && ops[1].ends_with(" 1"));
        assert_eq!(ops[2], "SET_SELF 0");
    }

    #[test]
    fn break_and_continue_are_patched() {
        let (_interp, f) = compile("let i = 0; for (i < 10) { i = i + 1; if (i == 3) { continue; } break; }");
        let text = listing(f);
        assert!(text.contains("BREAK"));
        assert!(text.contains("CONTINUE"));
        assert!(!text.contains(&PLACEHOLDER.to_string()));
    }

    #[test]
    fn undefined_variable_reports_position() {
        let err = compile_err("let a = 1;\nlet b = c;");
        assert_eq!(err.kind, CompileErrorKind::UndefinedVariable("c".into()));
        assert_eq!((err.line, err.column), (2, 9));
        assert_eq!(err.code, "QL-C002");
    }

    #[test]
    fn duplicate_definition_is_an_error() {
        let err = compile_err("let a = 1; let a = 2;");
        assert_eq!(err.kind, CompileErrorKind::DuplicateDefinition("a".into()));
        let err = compile_err("let f = fun(a, a) { return a; };");
        assert_eq!(err.kind, CompileErrorKind::DuplicateDefinition("a".into()));
    }

    #[test]
    fn loop_control_outside_loop() {
        let err = compile_err("break;");
        assert_eq!(err.kind, CompileErrorKind::LoopControlOutsideLoop("break"));
    }

    #[test]
    fn reserved_words_are_rejected() {
        let err = compile_err("class Foo {}");
        assert!(matches!(err.kind, CompileErrorKind::Reserved(_)));
        let err = compile_err("let as = 1;");
        assert!(matches!(err.kind, CompileErrorKind::Reserved(_)));
    }

    #[test]
    fn invalid_assignment_targets() {
        let err = compile_err("1 + 2 = 3;");
        assert_eq!(err.kind, CompileErrorKind::InvalidAssignmentTarget);
        let err = compile_err("len = 3;");
        assert_eq!(err.kind, CompileErrorKind::InvalidAssignmentTarget);
    }

    #[test]
    fn options_are_applied_and_checked() {
        let (interp, _) = compile("#![DEBUG]\n#![GC_INITIAL_TRIGGER(64)]\n1;");
        assert!(interp.options.debug);
        assert_eq!(interp.options.gc_initial_trigger, 64);

        let err = compile_err("#![NOPE(1)]");
        assert_eq!(err.kind, CompileErrorKind::UnknownOption("NOPE".into()));
        let err = compile_err("#![VERSION(99)]");
        assert!(matches!(err.kind, CompileErrorKind::VersionTooOld { required: 99, .. }));
        let err = compile_err("#![GC_HEAP_GROW_FACTOR(\"fast\")]");
        assert!(matches!(err.kind, CompileErrorKind::InvalidOption(_)));
    }

    #[test]
    fn lexer_errors_become_compile_errors() {
        let err = compile_err("let s = \"abc");
        assert_eq!(err.kind, CompileErrorKind::UnterminatedString);
        let err = compile_err("let s = \"\\q\";");
        assert_eq!(err.kind, CompileErrorKind::InvalidEscape('q'));
    }

    #[test]
    fn symbols_are_restored_after_errors() {
        let mut interp = Interpreter::new();
        compile_program(&mut interp, "let f = fun() { return nope; };", "t.ql").unwrap_err();
        assert!(interp.symbols.is_root());
        assert!(interp.symbols.lookup_here("println").is_some());
    }

    #[test]
    fn unix_shebang_line_is_skipped() {
        let (_interp, f) = compile("#!/usr/bin/env quill\n7;");
        assert_eq!(ops(f), vec!["CONST_INT 7", "HLT"]);
    }

    #[test]
    fn large_integers_use_the_constant_pool() {
        let (interp, f) = compile("100000;");
        let ops = ops(f);
        assert!(ops[0].starts_with("CONST "));
        assert!(interp.constants.iter().any(|c| c.as_int() == Some(100000)));
    }

    #[test]
    fn identifiers_exclude_hidden_names() {
        assert!(is_identifier("value_1"));
        assert!(!is_identifier("@iter1"));
        assert!(!is_identifier("require:/tmp/x.ql"));
    }
}
