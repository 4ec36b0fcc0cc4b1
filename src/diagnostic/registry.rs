/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str,
    pub long: &'static str,
}

/// All stable error codes.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Lexer ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "QL-L001",
        short: "unexpected character",
        long: r#"## QL-L001: unexpected character

A character was found that does not start any token.

**Example:**

    let price = 3 $ 4;

`$` is not an operator. Remove it or replace it with a valid one.
"#,
    },
    ErrorEntry {
        code: "QL-L002",
        short: "unterminated string literal",
        long: r#"## QL-L002: unterminated string literal

A string opened with `"` was not closed before the end of the input.

**Example:**

    println("hello);

**Fix:**

    println("hello");
"#,
    },
    ErrorEntry {
        code: "QL-L003",
        short: "unknown escape sequence",
        long: r#"## QL-L003: unknown escape sequence

Inside a string literal a backslash must be followed by one of
`a`, `b`, `n`, `t`, `r`, `\`, `'`, `"`, or `0` with two octal digits.

**Example:**

    "C:\data"

**Fix:** escape the backslash: `"C:\\data"`.
"#,
    },
    ErrorEntry {
        code: "QL-L004",
        short: "malformed number literal",
        long: r#"## QL-L004: malformed number literal

A numeric literal could not be read as an integer or a decimal, for
example `0x` with no digits or a decimal with two exponents.
"#,
    },

    // ── Compiler ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "QL-C001",
        short: "syntax error",
        long: r#"## QL-C001: syntax error

The compiler expected a different token here. The message names what
was expected and what was found.

**Common causes:**
- a missing `;` after an expression or `let` statement
- an unbalanced `(`, `[` or `{`
"#,
    },
    ErrorEntry {
        code: "QL-C002",
        short: "undefined variable",
        long: r#"## QL-C002: undefined variable

A name was used that is not bound in the current scope, any enclosing
function, the globals, the builtins or the type names. Names resolve at
compile time, so a global must be defined before the code that uses it
is compiled.

**Example:**

    println(total);
    let total = 3;

**Fix:** move the `let` above the first use.
"#,
    },
    ErrorEntry {
        code: "QL-C003",
        short: "duplicate definition",
        long: r#"## QL-C003: duplicate definition

`let` was used twice for the same name in one scope. Blocks do not open
a new scope; only functions do.

**Example:**

    let n = 1;
    let n = 2;

**Fix:** assign instead: `n = 2;`
"#,
    },
    ErrorEntry {
        code: "QL-C004",
        short: "invalid option value",
        long: r#"## QL-C004: invalid option value

A `#![NAME(value)]` directive gave a value of the wrong type. Integer
options reject decimals, boolean options take `true` or `false`, and
`SEARCH_PATH` takes a string.
"#,
    },
    ErrorEntry {
        code: "QL-C005",
        short: "unknown option",
        long: r#"## QL-C005: unknown option

A `#![...]` directive named an option that does not exist. Known
options: `VERSION`, `SEARCH_PATH`, `GC_HEAP_GROW_FACTOR`,
`GC_INITIAL_TRIGGER`, `GC_MAX_HEAP`, `DEBUG`, `BREAK`.
"#,
    },
    ErrorEntry {
        code: "QL-C006",
        short: "language version too old",
        long: r#"## QL-C006: language version too old

`#![VERSION(n)]` asked for a newer language version than this
interpreter implements.
"#,
    },
    ErrorEntry {
        code: "QL-C007",
        short: "too many parameters",
        long: r#"## QL-C007: too many parameters

A function declared more parameters than an instruction operand can
count.
"#,
    },
    ErrorEntry {
        code: "QL-C008",
        short: "constant pool full",
        long: r#"## QL-C008: constant pool full

The interpreter-wide constant pool is indexed by 16-bit operands and
has run out of slots. Split the program or reuse literals.
"#,
    },
    ErrorEntry {
        code: "QL-C009",
        short: "module not found",
        long: r#"## QL-C009: module not found

`require("name")` looked for `name.ql` and then `name.qlc` in the
directory of the requiring file and in every root of `SEARCH_PATH`
(colon separated), and found neither.

**Fix:** set `QUILL_PATH`, pass `--search-path`, or add
`#![SEARCH_PATH("dir")]` at the top of the file.
"#,
    },
    ErrorEntry {
        code: "QL-C010",
        short: "cannot read source",
        long: r#"## QL-C010: cannot read source

A script or a required module exists but could not be read, usually
because of permissions or invalid UTF-8.
"#,
    },
    ErrorEntry {
        code: "QL-C011",
        short: "reserved word",
        long: r#"## QL-C011: reserved word

`class`, `native` and `as` are reserved and cannot be used as names or
start a construct.
"#,
    },
    ErrorEntry {
        code: "QL-C012",
        short: "invalid assignment target",
        long: r#"## QL-C012: invalid assignment target

Only names and index expressions can appear on the left of `=`.

**Example:**

    f() = 3;
"#,
    },
    ErrorEntry {
        code: "QL-C013",
        short: "jump too far",
        long: r#"## QL-C013: jump too far

A branch target lies beyond the 64 KiB a jump operand can address.
Split the function.
"#,
    },
    ErrorEntry {
        code: "QL-C014",
        short: "loop control outside a loop",
        long: r#"## QL-C014: loop control outside a loop

`break` and `continue` are only valid inside a `for` body of the same
function.
"#,
    },

    // ── Runtime ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "QL-R001",
        short: "unsupported operator",
        long: r#"## QL-R001: unsupported operator

An operator was applied to operand types it has no meaning for, such as
`[1] - 2` or `-"text"`. `+` concatenates when either side is a string.
"#,
    },
    ErrorEntry {
        code: "QL-R002",
        short: "wrong number of arguments",
        long: r#"## QL-R002: wrong number of arguments

A function was called with a different number of arguments than it
declares. A variadic function (`fun(a, rest...)`) needs at least its
fixed parameters.
"#,
    },
    ErrorEntry {
        code: "QL-R003",
        short: "index out of bounds",
        long: r#"## QL-R003: index out of bounds

An assignment through `x[i] = v` used an index past the end of a list
or string. Reads out of range yield `null` instead.
"#,
    },
    ErrorEntry {
        code: "QL-R004",
        short: "bad index or element",
        long: r#"## QL-R004: bad index or element

A value was indexed with a key of the wrong type, assigned an element
the container cannot hold, asked for the length of something without
one, or used a non-string map key.
"#,
    },
    ErrorEntry {
        code: "QL-R005",
        short: "value is not callable",
        long: r#"## QL-R005: value is not callable

Only closures, builtins, bounded pairs, type names and maps with a
`__call__` entry can be called.
"#,
    },
    ErrorEntry {
        code: "QL-R006",
        short: "division by zero",
        long: r#"## QL-R006: division by zero

Integer `/` or `%` with a zero divisor. Decimal division follows IEEE
754 and yields an infinity or NaN instead.
"#,
    },
    ErrorEntry {
        code: "QL-R007",
        short: "invalid conversion",
        long: r#"## QL-R007: invalid conversion

A type cast such as `Integer("abc")` could not convert its argument.
"#,
    },
    ErrorEntry {
        code: "QL-R008",
        short: "error raised by a builtin",
        long: r#"## QL-R008: error raised by a builtin

A builtin returned an Error value. The message comes from the builtin.
Script code can create Error values with `Error(...)` without raising
them.
"#,
    },
    ErrorEntry {
        code: "QL-R009",
        short: "heap exhausted",
        long: r#"## QL-R009: heap exhausted

A full collection left more live objects than `GC_MAX_HEAP` allows.
Raise the limit or drop references to data that is no longer needed.
"#,
    },
    ErrorEntry {
        code: "QL-R010",
        short: "stack overflow",
        long: r#"## QL-R010: stack overflow

Calls nested deeper than the frame limit, usually through unbounded
recursion.
"#,
    },
    ErrorEntry {
        code: "QL-R011",
        short: "invalid bytecode",
        long: r#"## QL-R011: invalid bytecode

The VM met an instruction it cannot execute. This points at a compiler
bug or a damaged module image.
"#,
    },
    ErrorEntry {
        code: "QL-R012",
        short: "module load failed",
        long: r#"## QL-R012: module load failed

A pre-built `.qlc` module could not be loaded at run time. The message
carries the underlying artifact error.
"#,
    },

    // ── Module images ────────────────────────────────────────────────────────
    ErrorEntry {
        code: "QL-A001",
        short: "cannot access module image",
        long: r#"## QL-A001: cannot access module image

Reading or writing a `.qlc` file failed at the operating system level.
"#,
    },
    ErrorEntry {
        code: "QL-A002",
        short: "corrupt module image",
        long: r#"## QL-A002: corrupt module image

A `.qlc` file is not valid JSON, or its instructions reference
constants, globals or functions it does not contain. Rebuild it with
`quill build`.
"#,
    },
    ErrorEntry {
        code: "QL-A003",
        short: "unsupported image format",
        long: r#"## QL-A003: unsupported image format

The image was written by a quill with a different image format
version. Rebuild it with this interpreter.
"#,
    },
    ErrorEntry {
        code: "QL-A004",
        short: "missing builtin",
        long: r#"## QL-A004: missing builtin

The image calls a builtin by name that the loading interpreter has not
registered. Register it before running code that requires the module.
"#,
    },
    ErrorEntry {
        code: "QL-A005",
        short: "constant cannot be stored",
        long: r#"## QL-A005: constant cannot be stored

Only integer, decimal, string and function constants can be written to
a module image.
"#,
    },
];

/// Look up an error entry by code (e.g. `"QL-C002"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileErrorKind;
    use crate::vm::RuntimeErrorKind;

    #[test]
    fn lookup_known_code() {
        let e = lookup("QL-C002").expect("QL-C002 should be in registry");
        assert_eq!(e.short, "undefined variable");
        assert!(e.long.contains("QL-C002"));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("QL-X999").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn all_codes_unique() {
        let mut codes: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        let len_before = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), len_before, "duplicate codes in registry");
    }

    #[test]
    fn all_codes_have_content() {
        for entry in REGISTRY {
            assert!(!entry.short.is_empty(), "{} missing short description", entry.code);
            assert!(entry.long.contains(entry.code), "{} long text lacks its heading", entry.code);
        }
    }

    #[test]
    fn error_kinds_map_to_registered_codes() {
        let compile = [
            CompileErrorKind::Syntax(String::new()),
            CompileErrorKind::UndefinedVariable(String::new()),
            CompileErrorKind::ModuleNotFound(String::new()),
            CompileErrorKind::LoopControlOutsideLoop("break"),
            CompileErrorKind::UnterminatedString,
        ];
        let runtime = [
            RuntimeErrorKind::DivisionByZero,
            RuntimeErrorKind::StackOverflow,
            RuntimeErrorKind::Raised(String::new()),
            RuntimeErrorKind::Module { path: String::new(), reason: String::new() },
        ];
        for code in compile.iter().map(|k| k.code()).chain(runtime.iter().map(|k| k.code())) {
            assert!(lookup(code).is_some(), "{code} is not registered");
        }
    }
}
