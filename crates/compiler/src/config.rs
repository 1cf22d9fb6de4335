//! Compiler configuration.
//!
//! Everything the driver needs to know beyond the input file list:
//! where the runtime library lives, where the outputs go, and whether the
//! optimizer runs. Defaults match the classic surface (outputs in the
//! working directory, `runtime.lisp` beside the compiler executable).
//! A TOML file can override any of it:
//!
//! ```toml
//! [output]
//! hex = "build/program.hex"
//! listing = "build/program.lst"
//!
//! [compiler]
//! optimize = true
//! runtime = "lib/runtime.lisp"
//! ```

use crate::error::CompileError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Runtime library path; `None` means `runtime.lisp` in the directory
    /// containing the compiler executable.
    pub runtime_path: Option<PathBuf>,
    /// Hex image output path.
    pub hex_path: PathBuf,
    /// Listing output path.
    pub listing_path: PathBuf,
    /// Run constant folding and strength reduction.
    pub optimize: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            runtime_path: None,
            hex_path: PathBuf::from("program.hex"),
            listing_path: PathBuf::from("program.lst"),
            optimize: true,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_path = Some(path.into());
        self
    }

    pub fn with_hex_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hex_path = path.into();
        self
    }

    pub fn with_listing_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.listing_path = path.into();
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Parse a configuration file, with defaults for anything unset.
    pub fn from_toml(text: &str) -> Result<Self, CompileError> {
        let raw: RawConfig = toml::from_str(text).map_err(|e| CompileError::Config(e.to_string()))?;
        let mut config = CompilerConfig::default();
        if let Some(output) = raw.output {
            if let Some(hex) = output.hex {
                config.hex_path = hex;
            }
            if let Some(listing) = output.listing {
                config.listing_path = listing;
            }
        }
        if let Some(compiler) = raw.compiler {
            if let Some(optimize) = compiler.optimize {
                config.optimize = optimize;
            }
            if let Some(runtime) = compiler.runtime {
                config.runtime_path = Some(runtime);
            }
        }
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, CompileError> {
        let text = fs::read_to_string(path)
            .map_err(|e| CompileError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    output: Option<RawOutput>,
    compiler: Option<RawCompiler>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    hex: Option<PathBuf>,
    listing: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawCompiler {
    optimize: Option<bool>,
    runtime: Option<PathBuf>,
}
