//! Error type shared by every compilation stage.
//!
//! All user-visible failures funnel into [`CompileError`]; the CLI renders
//! them as a single `Compile error: <msg>` line and exits nonzero.

use std::fmt;
use std::io;

/// Error raised by the reader, macro expander, code generator or driver.
#[derive(Debug)]
pub enum CompileError {
    /// A tokenizer or reader error, with the line it was detected on.
    Syntax { message: String, line: usize },
    /// A failure while evaluating a macro body at expansion time.
    Macro(String),
    /// A code generation error (bad form, range overflow, unresolved global).
    Codegen(String),
    /// A malformed compiler configuration file.
    Config(String),
    /// An I/O failure reading sources or writing outputs.
    Io(io::Error),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Syntax { message, line } => write!(f, "line {}: {}", line, message),
            CompileError::Macro(msg) => write!(f, "{}", msg),
            CompileError::Codegen(msg) => write!(f, "{}", msg),
            CompileError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            CompileError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CompileError {
    fn from(e: io::Error) -> Self {
        CompileError::Io(e)
    }
}

impl CompileError {
    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        CompileError::Syntax {
            message: message.into(),
            line,
        }
    }

    pub fn codegen(message: impl Into<String>) -> Self {
        CompileError::Codegen(message.into())
    }
}
