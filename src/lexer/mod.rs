use logos::Logos;

use crate::source::Span;

/// Why a piece of source text could not be turned into a token.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LexErrorKind {
    #[default]
    UnexpectedCharacter,
    UnterminatedString,
    InvalidEscape(char),
    InvalidNumber(String),
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(error = LexErrorKind)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
pub enum Token {
    // Reserved words
    #[token("let")]
    Let,
    #[token("fun")]
    Fun,
    #[token("native")]
    Native,
    #[token("return")]
    Return,
    #[token("class")]
    Class,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("require")]
    Require,
    #[token("global")]
    Global,
    #[token("as")]
    As,
    #[token("in")]
    In,
    #[token("defer")]
    Defer,
    #[token("not")]
    Not,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // Multi-character punctuation
    #[token("#!")]
    Shebang,
    #[token("...")]
    Ellipsis,
    #[token(":=")]
    Define,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token(">>")]
    ShiftRight,
    #[token("<<")]
    ShiftLeft,

    // Single-character punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Assign,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    /// Any other ASCII punctuation; the compiler rejects it in context.
    #[regex(r"[!#$?@\\^`~]", |lex| lex.slice().chars().next())]
    Punct(char),

    // Literals
    #[regex(r"[0-9][0-9A-Za-z_]*(\.[0-9][0-9_]*)?", number)]
    Number(Number),

    #[regex(r#""([^"\\]|\\.)*"?"#, string)]
    #[regex(r#"'([^'\\]|\\.)*'?"#, string)]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

/// A numeric literal as written in source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i64),
    Decimal(f64),
}

/// Decimal with `_` separators, `b` binary and `h` hex suffixes, a leading
/// `0` for octal, and a single `.` for decimals.
fn number(lex: &mut logos::Lexer<Token>) -> Result<Number, LexErrorKind> {
    let raw = lex.slice();
    let digits: String = raw.chars().filter(|c| *c != '_').collect();
    let invalid = || LexErrorKind::InvalidNumber(raw.to_string());

    if digits.contains('.') {
        return digits.parse::<f64>().map(Number::Decimal).map_err(|_| invalid());
    }
    let (body, radix) = if let Some(hex) = digits.strip_suffix('h') {
        (hex, 16)
    } else if let Some(bin) = digits.strip_suffix('b') {
        (bin, 2)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (&digits[1..], 8)
    } else {
        (digits.as_str(), 10)
    };
    if body.is_empty() {
        return Err(invalid());
    }
    i64::from_str_radix(body, radix).map(Number::Integer).map_err(|_| invalid())
}

fn string(lex: &mut logos::Lexer<Token>) -> Result<String, LexErrorKind> {
    let raw = lex.slice();
    let mut chars = raw.chars();
    let quote = chars.next().ok_or(LexErrorKind::UnterminatedString)?;
    let mut out = String::new();

    while let Some(c) = chars.next() {
        if c == quote {
            return Ok(out);
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        let esc = chars.next().ok_or(LexErrorKind::UnterminatedString)?;
        match esc {
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '0' => {
                let hi = chars.next().and_then(|c| c.to_digit(8));
                let lo = chars.next().and_then(|c| c.to_digit(8));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(char::from((hi * 8 + lo) as u8)),
                    _ => return Err(LexErrorKind::InvalidEscape('0')),
                }
            }
            other => return Err(LexErrorKind::InvalidEscape(other)),
        }
    }
    Err(LexErrorKind::UnterminatedString)
}

impl Token {
    /// Short human-readable form used in syntax error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Number(Number::Integer(n)) => format!("number {n}"),
            Token::Number(Number::Decimal(d)) => format!("number {d}"),
            Token::Str(s) => format!("string {s:?}"),
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Punct(c) => format!("'{c}'"),
            other => format!("'{}'", other.lexeme()),
        }
    }

    fn lexeme(&self) -> &'static str {
        match self {
            Token::Let => "let",
            Token::Fun => "fun",
            Token::Native => "native",
            Token::Return => "return",
            Token::Class => "class",
            Token::If => "if",
            Token::Else => "else",
            Token::For => "for",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Require => "require",
            Token::Global => "global",
            Token::As => "as",
            Token::In => "in",
            Token::Defer => "defer",
            Token::Not => "not",
            Token::And => "and",
            Token::Or => "or",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::Shebang => "#!",
            Token::Ellipsis => "...",
            Token::Define => ":=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::LessEq => "<=",
            Token::GreaterEq => ">=",
            Token::ShiftRight => ">>",
            Token::ShiftLeft => "<<",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Semicolon => ";",
            Token::Colon => ":",
            Token::Dot => ".",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Less => "<",
            Token::Greater => ">",
            Token::Assign => "=",
            Token::Amp => "&",
            Token::Pipe => "|",
            Token::Number(_) | Token::Str(_) | Token::Ident(_) | Token::Punct(_) => "literal",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LexError {
    pub code: &'static str,
    pub kind: LexErrorKind,
    pub span: Span,
    pub message: String,
}

impl LexError {
    fn new(kind: LexErrorKind, span: Span, snippet: &str) -> Self {
        let (code, message) = match &kind {
            LexErrorKind::UnexpectedCharacter => {
                ("QL-L001", format!("unexpected character(s) '{snippet}'"))
            }
            LexErrorKind::UnterminatedString => ("QL-L002", "unterminated string literal".to_string()),
            LexErrorKind::InvalidEscape(c) => ("QL-L003", format!("unknown escape sequence '\\{c}'")),
            LexErrorKind::InvalidNumber(raw) => ("QL-L004", format!("malformed number literal '{raw}'")),
        };
        LexError { code, kind, span, message }
    }
}

/// Lex source code into a stream of tokens with positions.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span = Span::from(lexer.span());
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(kind) => {
                let snippet = source.get(span.start..span.end).unwrap_or("");
                return Err(LexError::new(kind, span, snippet));
            }
        }
    }

    Ok(tokens)
}

/// Token cursor with one token of lookahead.
pub struct Lexer {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    eof: Span,
}

impl Lexer {
    pub fn new(source: &str) -> Result<Self, LexError> {
        let tokens = lex(source)?;
        let eof = Span::new(source.len(), source.len());
        Ok(Lexer { tokens, pos: 0, eof })
    }

    /// The current token, `None` at end of input.
    pub fn cur(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    /// The token after the current one.
    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|(t, _)| t)
    }

    pub fn span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(self.eof)
    }

    /// Span of the most recently eaten token.
    pub fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    /// Consume the current token and return it.
    pub fn eat(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}
