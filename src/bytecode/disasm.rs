use std::fmt::Write;

use super::{decode_operands, FuncDef, Role};
use crate::gc::Heap;

/// One instruction as `MNEMONIC r1, k2, -3`: registers prefixed `r`,
/// constant indices prefixed `k`, immediates bare.
pub fn format_instruction(word: u32) -> String {
    let Some((op, operands)) = decode_operands(word) else {
        return format!("??? {word:#010x}");
    };
    let short = op.mnemonic().split('_').next().unwrap_or_default();
    let parts: Vec<String> = op
        .fields()
        .iter()
        .zip(operands)
        .map(|(f, v)| match f.role {
            Role::Reg => format!("r{v}"),
            Role::Const => format!("k{v}"),
            Role::Imm => v.to_string(),
        })
        .collect();
    if parts.is_empty() {
        short.to_string()
    } else {
        format!("{short:<7} {}", parts.join(", "))
    }
}

/// Listing of a whole function, with its constant pool.
pub fn disassemble(func: &FuncDef, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} [regs {}]", func.signature(heap), func.max_regs);
    if func.is_native() {
        let _ = writeln!(out, "  <native>");
        return out;
    }
    for (i, &c) in func.constants.iter().enumerate() {
        let _ = writeln!(out, "  k{i:<4} {}", heap.repr(c));
    }
    for (pc, &word) in func.code.iter().enumerate() {
        let _ = writeln!(out, "  {pc:04}  {}", format_instruction(word));
    }
    out
}
