//! Lumen Compiler: the lexer and single-pass Pratt compiler that turn
//! source text into bytecode (spec.md §4.3, §4.4), plus the bytecode
//! disassembler used by the CLI's `-s` flag.
//!
//! # Modules
//!
//! - `lexer`: token stream (spec.md §4.3's contract-level scanner).
//! - `compiler`: the Pratt parser that emits bytecode directly, no AST.
//! - `disassembler`: renders a [`lumen_core::Chunk`] as mnemonic text.

pub mod compiler;
pub mod disassembler;
pub mod lexer;

pub use compiler::compile;
pub use disassembler::disassemble_chunk;
pub use lexer::{Lexer, Token, TokenKind};
