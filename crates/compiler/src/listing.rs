//! Human-readable listing output.
//!
//! Written next to the hex image for debugging: the global slot table,
//! a disassembly of every live function (prologue included), and the
//! post-expansion program the code was generated from.

use crate::ast::SExpr;
use crate::bytecode::{immediate, mnemonic, opcode};
use crate::codegen::{CodeGen, SymbolKind};
use std::io::{self, Write};

/// Write the complete listing for a linked program.
pub fn write_listing<W: Write>(codegen: &CodeGen, program: &[SExpr], out: &mut W) -> io::Result<()> {
    writeln!(out, "Globals:")?;

    let mut globals: Vec<_> = codegen.globals.iter().collect();
    globals.sort_by(|a, b| a.0.cmp(b.0));
    for (name, &sym) in globals {
        let symbol = &codegen.symbols[sym];
        match symbol.kind {
            SymbolKind::Function => {
                let address = symbol
                    .function
                    .map(|fid| codegen.functions[fid].base_address)
                    .unwrap_or(0);
                writeln!(out, " {} function@{}", name, address)?;
            }
            _ => writeln!(out, " {} var@{}", name, symbol.index)?,
        }
    }

    for &fid in &codegen.live {
        let function = &codegen.functions[fid];
        match &function.name {
            Some(name) => writeln!(out, "\nfunction {} @{}", name, function.base_address)?,
            None => writeln!(out, "\nfunction @{}", function.base_address)?,
        }
        let words = function.prologue.iter().chain(function.instructions.iter());
        disassemble(out, words, function.base_address)?;
    }

    for expr in program {
        pretty_print(out, expr, 0)?;
    }
    writeln!(out)
}

fn disassemble<'a, W: Write>(
    out: &mut W,
    words: impl Iterator<Item = &'a u32>,
    base_address: usize,
) -> io::Result<()> {
    for (pc, &word) in words.enumerate() {
        write!(out, "{}", base_address + pc)?;
        match mnemonic(opcode(word)) {
            Some((name, true)) => writeln!(out, "\t{} {}", name, immediate(word))?,
            Some((name, false)) => writeln!(out, "\t{}", name)?,
            None => writeln!(out, "\t.word {:06x}", word)?,
        }
    }
    Ok(())
}

/// Indented rendering of one S-expression, one nesting level per line.
fn pretty_print<W: Write>(out: &mut W, expr: &SExpr, indent: usize) -> io::Result<()> {
    match expr.as_list() {
        Some(items) => {
            writeln!(out)?;
            write!(out, "{}(", "  ".repeat(indent))?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(out, " ")?;
                }
                pretty_print(out, item, indent + 1)?;
            }
            writeln!(out, ")")?;
            write!(out, "{}", "  ".repeat(indent.saturating_sub(1)))?;
            Ok(())
        }
        None => write!(out, "{}", expr),
    }
}
