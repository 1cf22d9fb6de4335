//! mlisp compiler library.
//!
//! Compiles mlisp source (a small Lisp dialect) into a hex image for a
//! 24-bit stack-machine VM. The pipeline is fixed:
//!
//! 1. read — tokenize and build S-expression trees ([`parser`])
//! 2. rewrite — expand `c[ad]+r` accessor shorthand ([`rewrite`])
//! 3. expand — interpret `defmacro` definitions ([`macros`])
//! 4. optimize — constant folding and strength reduction ([`optimizer`])
//! 5. generate — scopes, closures, emission, layout, fixups ([`codegen`])
//!
//! The runtime library (`runtime.lisp`) is ordinary input compiled ahead
//! of the user's files; dead-function elimination strips whatever the
//! program does not use. Outputs are `program.hex` (one instruction per
//! line, six hex digits) and a human-readable `program.lst`.
//!
//! ```rust,ignore
//! use mlispc::{CompilerConfig, compile_files};
//!
//! let config = CompilerConfig::new()
//!     .with_runtime_path("lib/runtime.lisp")
//!     .with_hex_path("program.hex");
//! compile_files(&[PathBuf::from("game.lisp")], &config)?;
//! ```

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod config;
pub mod error;
pub mod listing;
pub mod macros;
pub mod optimizer;
pub mod parser;
pub mod rewrite;

pub use ast::SExpr;
pub use codegen::CodeGen;
pub use config::CompilerConfig;
pub use error::CompileError;
pub use macros::MacroExpander;
pub use parser::Parser;

use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Compile the runtime library plus the given source files and write the
/// hex image and listing configured in `config`.
pub fn compile_files(inputs: &[PathBuf], config: &CompilerConfig) -> Result<(), CompileError> {
    let runtime = match &config.runtime_path {
        Some(path) => path.clone(),
        None => default_runtime_path()?,
    };

    let mut parser = Parser::new();
    parser.parse_file(&runtime)?;
    for path in inputs {
        parser.parse_file(path)?;
    }
    let program = parser.into_program();
    debug!(forms = program.len(), "sources parsed");

    let (image, codegen, program) = compile_program(program, config.optimize)?;

    write_hex(&image, &config.hex_path)?;
    let mut listing_out = BufWriter::new(File::create(&config.listing_path)?);
    listing::write_listing(&codegen, &program, &mut listing_out)?;
    debug!(
        words = image.len(),
        hex = %config.hex_path.display(),
        "image written"
    );
    Ok(())
}

/// Run the post-reader pipeline over a parsed program. Returns the flat
/// instruction stream, the code generator (for listings and inspection),
/// and the post-expansion program.
pub fn compile_program(
    program: Vec<SExpr>,
    optimize: bool,
) -> Result<(Vec<u32>, CodeGen, Vec<SExpr>), CompileError> {
    let program: Vec<SExpr> = program.iter().map(rewrite::rewrite).collect();
    let program = MacroExpander::new().expand_program(&program)?;
    let program: Vec<SExpr> = if optimize {
        program.iter().map(optimizer::fold_constants).collect()
    } else {
        program
    };

    let mut codegen = CodeGen::new();
    codegen.compile_program(&program)?;
    let image = codegen.link()?;
    Ok((image, codegen, program))
}

/// One 24-bit word per line, six lowercase hex digits.
fn write_hex(image: &[u32], path: &Path) -> Result<(), CompileError> {
    let mut out = BufWriter::new(File::create(path)?);
    for word in image {
        writeln!(out, "{:06x}", word)?;
    }
    Ok(())
}

/// `runtime.lisp` lives beside the compiler executable unless configured
/// otherwise.
fn default_runtime_path() -> Result<PathBuf, CompileError> {
    let exe = env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| CompileError::codegen("cannot locate the compiler directory"))?;
    Ok(dir.join("runtime.lisp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const RUNTIME: &str = "(function cons (a b) 0)\n(function printdec (n) n)\n(function halt () 0)\n";

    fn compile_in_temp(source: &str) -> (tempfile::TempDir, CompilerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("runtime.lisp");
        fs::write(&runtime, RUNTIME).unwrap();
        let input = dir.path().join("input.lisp");
        fs::write(&input, source).unwrap();
        let config = CompilerConfig::new()
            .with_runtime_path(&runtime)
            .with_hex_path(dir.path().join("program.hex"))
            .with_listing_path(dir.path().join("program.lst"));
        compile_files(&[input], &config).unwrap();
        (dir, config)
    }

    #[test]
    fn test_end_to_end_outputs() {
        let (_dir, config) = compile_in_temp("(function main () (printdec (+ 2 3))) (main)");
        let hex = fs::read_to_string(&config.hex_path).unwrap();
        assert!(!hex.is_empty());
        for line in hex.lines() {
            assert_eq!(line.len(), 6, "bad hex line: {:?}", line);
            assert!(line.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        }
        let listing = fs::read_to_string(&config.listing_path).unwrap();
        assert!(listing.starts_with("Globals:"));
    }

    #[test]
    fn test_constant_fold_reaches_the_image() {
        // (+ 2 3) folds, so a push of 5 lands in the image
        let (_dir, config) = compile_in_temp("(printdec (+ 2 3))");
        let hex = fs::read_to_string(&config.hex_path).unwrap();
        assert!(hex.lines().any(|l| l == "190005"), "no `push 5` in image:\n{}", hex);
    }

    #[test]
    fn test_deterministic_output() {
        let source =
            "(defmacro when (c b) `(if ,c ,b 0)) (function main () (when (= 1 1) (printdec 42))) (main)";
        let (_dir_a, config_a) = compile_in_temp(source);
        let (_dir_b, config_b) = compile_in_temp(source);
        let a = fs::read(&config_a.hex_path).unwrap();
        let b = fs::read(&config_b.hex_path).unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn test_optimizer_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("runtime.lisp");
        fs::write(&runtime, RUNTIME).unwrap();
        let input = dir.path().join("input.lisp");
        fs::write(&input, "(printdec (+ 2 3))").unwrap();
        let config = CompilerConfig::new()
            .with_runtime_path(&runtime)
            .with_hex_path(dir.path().join("program.hex"))
            .with_listing_path(dir.path().join("program.lst"))
            .with_optimize(false);
        compile_files(&[input], &config).unwrap();
        let hex = fs::read_to_string(&config.hex_path).unwrap();
        // unoptimized: 2 and 3 are pushed and added at run time
        assert!(hex.lines().any(|l| l == "190002"));
        assert!(hex.lines().any(|l| l == "190003"));
        assert!(!hex.lines().any(|l| l == "190005"));
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("runtime.lisp");
        fs::write(&runtime, RUNTIME).unwrap();
        let config = CompilerConfig::new()
            .with_runtime_path(&runtime)
            .with_hex_path(dir.path().join("program.hex"))
            .with_listing_path(dir.path().join("program.lst"));
        let err = compile_files(&[dir.path().join("nope.lisp")], &config).unwrap_err();
        assert!(err.to_string().contains("nope.lisp"));
    }

    #[test]
    fn test_compile_program_reports_macro_errors() {
        let mut parser = Parser::new();
        parser.parse_source("(defmacro bad (x) (mystery x)) (bad 1)").unwrap();
        let err = compile_program(parser.into_program(), true).unwrap_err();
        assert!(matches!(err, CompileError::Macro(_)));
    }
}
