//! Instruction set, instruction buffer and line tables.
//!
//! Every instruction is one opcode byte followed by 0, 1 or 2 operand
//! slots. Each slot is a 16-bit little-endian word. Jump operands are
//! absolute byte offsets into the owning function's instructions.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::value::Function;

macro_rules! opcodes {
    ($($name:ident = $text:literal / $operands:literal,)*) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Op {
            $($name,)*
        }

        impl Op {
            const TABLE: &'static [Op] = &[$(Op::$name,)*];

            pub fn from_byte(byte: u8) -> Option<Op> {
                Op::TABLE.get(byte as usize).copied()
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$name => $text,)*
                }
            }

            /// Number of 16-bit operand slots following the opcode byte.
            pub fn operand_count(self) -> usize {
                match self {
                    $(Op::$name => $operands,)*
                }
            }
        }
    };
}

opcodes! {
    Neg = "NEG" / 0,
    Not = "NOT" / 0,
    Add = "ADD" / 0,
    Sub = "SUB" / 0,
    Mul = "MUL" / 0,
    Div = "DIV" / 0,
    Mod = "MOD" / 0,
    LShift = "LSHIFT" / 0,
    RShift = "RSHIFT" / 0,
    And = "AND" / 0,
    Or = "OR" / 0,
    LAnd = "LAND" / 0,
    LOr = "LOR" / 0,
    Eq = "EQ" / 0,
    Ne = "NE" / 0,
    Lt = "LT" / 0,
    Le = "LE" / 0,
    Gt = "GT" / 0,
    Ge = "GE" / 0,
    Const = "CONST" / 1,
    ConstInt = "CONST_INT" / 1,
    ConstTrue = "CONST_TRUE" / 0,
    ConstFalse = "CONST_FALSE" / 0,
    ConstNull = "CONST_NULL" / 0,
    Load = "LOAD" / 2,
    Store = "STORE" / 2,
    Pack = "PACK" / 1,
    Map = "MAP" / 1,
    Index = "INDEX" / 1,
    Set = "SET" / 0,
    Size = "SIZE" / 0,
    Jmp = "JMP" / 1,
    Jnz = "JNZ" / 1,
    Chk = "CHK" / 2,
    Break = "BREAK" / 1,
    Continue = "CONTINUE" / 1,
    Call = "CALL" / 1,
    Ret = "RET" / 0,
    Defer = "DEFER" / 0,
    Closure = "CLOSURE" / 2,
    SetSelf = "SET_SELF" / 1,
    Module = "MODULE" / 0,
    Pop = "POP" / 0,
    Hlt = "HLT" / 0,
}

impl Op {
    /// Encoded length in bytes, opcode included.
    pub fn width(self) -> usize {
        1 + 2 * self.operand_count()
    }
}

#[inline]
pub fn read_u16(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([code[at], code[at + 1]])
}

/// Filename plus the source line of every instruction byte.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    pub filename: String,
    pub lines: Vec<u32>,
}

impl DebugInfo {
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}

/// Append-only instruction buffer with a parallel line table.
#[derive(Debug, Clone, Default)]
pub struct Instructions {
    code: Vec<u8>,
    lines: Vec<u32>,
    last_op: Option<usize>,
    /// Highest offset some jump has been patched to target.
    last_label: Option<usize>,
}

impl Instructions {
    pub fn new() -> Self {
        Instructions::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Append one instruction; returns its offset.
    pub fn emit(&mut self, op: Op, operands: &[u16], line: u32) -> usize {
        debug_assert_eq!(operands.len(), op.operand_count(), "operand count for {}", op.name());
        let offset = self.code.len();
        self.code.push(op as u8);
        for operand in operands {
            self.code.extend_from_slice(&operand.to_le_bytes());
        }
        self.lines.resize(self.code.len(), line);
        self.last_op = Some(offset);
        offset
    }

    /// Overwrite operand `slot` of the instruction at `offset`.
    pub fn patch(&mut self, offset: usize, slot: usize, value: u16) {
        let at = offset + 1 + 2 * slot;
        self.code[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Record that control flow can arrive at the current end.
    pub fn mark_label(&mut self) {
        self.last_label = Some(self.code.len());
    }

    pub fn last_op(&self) -> Option<Op> {
        self.last_op.and_then(|at| Op::from_byte(self.code[at]))
    }

    /// True when the final instruction is `op` and no jump lands after it.
    pub fn ends_with(&self, op: Op) -> bool {
        match self.last_op {
            Some(at) => {
                self.code[at] == op as u8 && self.last_label.is_none_or(|label| label <= at)
            }
            None => false,
        }
    }

    /// Rewrite the trailing opcode in place (`POP` becomes `RET`).
    pub fn replace_last(&mut self, op: Op) {
        if let Some(at) = self.last_op {
            debug_assert_eq!(Op::from_byte(self.code[at]).map(Op::operand_count), Some(op.operand_count()));
            self.code[at] = op as u8;
        }
    }

    /// Drop the trailing instruction.
    pub fn remove_last(&mut self) {
        if let Some(at) = self.last_op.take() {
            self.code.truncate(at);
            self.lines.truncate(at);
        }
    }

    pub fn into_parts(self, filename: &str) -> (Vec<u8>, DebugInfo) {
        (self.code, DebugInfo { filename: filename.to_string(), lines: self.lines })
    }
}

/// Render one instruction; returns the text and the next offset.
pub fn disassemble_instruction(code: &[u8], offset: usize) -> (String, usize) {
    let Some(op) = Op::from_byte(code[offset]) else {
        return (format!("<bad opcode {}>", code[offset]), offset + 1);
    };
    let mut text = op.name().to_string();
    let end = offset + op.width();
    if end > code.len() {
        return (format!("{text} <truncated>"), code.len());
    }
    for slot in 0..op.operand_count() {
        let operand = read_u16(code, offset + 1 + 2 * slot);
        match (op, slot) {
            (Op::ConstInt, _) => write!(text, " {}", operand as i16),
            (Op::Load | Op::Store, 0) => write!(text, " {}", scope_name(operand)),
            _ => write!(text, " {operand}"),
        }
        .ok();
    }
    (text, end)
}

fn scope_name(code: u16) -> &'static str {
    crate::symbols::Scope::from_code(code).map(|s| s.name()).unwrap_or("?")
}

/// Full listing of a function: `offset line OPCODE operands`.
pub fn disassemble(function: &Function) -> String {
    let mut out = format!(
        "== {} ({}, params={}, locals={}{}) ==\n",
        function.display_name(),
        function.debug_info.filename,
        function.n_params,
        function.n_locals,
        if function.is_variadic { ", variadic" } else { "" },
    );
    let code = &function.instructions;
    let mut offset = 0;
    while offset < code.len() {
        let (text, next) = disassemble_instruction(code, offset);
        let _ = writeln!(out, "{offset:04} {:>4} {text}", function.line_at(offset));
        offset = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for &op in Op::TABLE {
            assert_eq!(Op::from_byte(op as u8), Some(op));
        }
        assert_eq!(Op::from_byte(250), None);
    }

    #[test]
    fn emit_and_patch_operands() {
        let mut ins = Instructions::new();
        ins.emit(Op::ConstInt, &[7], 1);
        let jump = ins.emit(Op::Jmp, &[0], 2);
        ins.emit(Op::Pop, &[], 2);
        ins.patch(jump, 0, 300);
        assert_eq!(read_u16(ins.code(), jump + 1), 300);
        assert_eq!(ins.len(), 3 + 3 + 1);
        let (_, debug) = ins.clone().into_parts("t.ql");
        assert_eq!(debug.line_at(0), 1);
        assert_eq!(debug.line_at(3), 2);
        assert_eq!(debug.lines.len(), ins.len());
    }

    #[test]
    fn trailing_pop_detection_respects_labels() {
        let mut ins = Instructions::new();
        ins.emit(Op::ConstNull, &[], 1);
        ins.emit(Op::Pop, &[], 1);
        assert!(ins.ends_with(Op::Pop));
        ins.mark_label();
        assert!(!ins.ends_with(Op::Pop));
    }

    #[test]
    fn replace_and_remove_last() {
        let mut ins = Instructions::new();
        ins.emit(Op::ConstTrue, &[], 1);
        ins.emit(Op::Pop, &[], 1);
        ins.replace_last(Op::Ret);
        assert_eq!(ins.last_op(), Some(Op::Ret));
        ins.remove_last();
        assert_eq!(ins.len(), 1);
    }

    #[test]
    fn disassemble_shows_signed_immediates() {
        let mut ins = Instructions::new();
        ins.emit(Op::ConstInt, &[(-5i16) as u16], 1);
        let (text, next) = disassemble_instruction(ins.code(), 0);
        assert_eq!(text, "CONST_INT -5");
        assert_eq!(next, 3);
    }
}
