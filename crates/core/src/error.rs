//! `LumenError`: the error type shared by the lexer, compiler, and VM.
//!
//! Grounded on `seq-compiler::codegen::error::CodeGenError`'s shape (a
//! small enum implementing `Display`/`std::error::Error`, with `From` impls
//! for the upstream failure types) rather than a stringly-typed
//! `Result<(), String>`. The CLI is responsible for turning these into the
//! exact wire-format text spec.md §7 mandates (`file:line: parse error at
//! '...': message`, etc.) and the matching exit code; this type only
//! carries the structured pieces needed to do that.

use std::fmt;

/// A single compile-time diagnostic (spec.md §7: lex and compile errors
/// share one surface: a lex error is just a compile error whose message
/// is the scanner's complaint, synchronized like any other).
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    /// `None` for an error reported at end-of-file.
    pub at: Option<String>,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.at {
            Some(lexeme) => write!(
                f,
                "{}: parse error at '{}': {}",
                self.line, lexeme, self.message
            ),
            None => write!(f, "{}: parse error at end: {}", self.line, self.message),
        }
    }
}

/// A runtime error: the message plus the call-frame traceback captured at
/// the moment it was raised (spec.md §4.5/§7).
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    /// Innermost frame first, matching the order `vm.rs`'s unwind walks.
    pub traceback: Vec<TraceFrame>,
}

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: runtime error: {}", self.line, self.message)?;
        for frame in &self.traceback {
            writeln!(f, "[line {}] in {}", frame.line, frame.name)?;
        }
        Ok(())
    }
}

/// The top-level error produced by compiling or running Lumen source.
#[derive(Debug, Clone)]
pub enum LumenError {
    /// One or more parse/lex errors; compilation keeps going after the
    /// first to surface as many as it can (spec.md §7), so this is a `Vec`.
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl fmt::Display for LumenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LumenError::Compile(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
            LumenError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LumenError {}

impl From<RuntimeError> for LumenError {
    fn from(e: RuntimeError) -> Self {
        LumenError::Runtime(e)
    }
}

impl From<Vec<CompileError>> for LumenError {
    fn from(errors: Vec<CompileError>) -> Self {
        LumenError::Compile(errors)
    }
}
