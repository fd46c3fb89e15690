//! Crate root: wires together the compilation pipeline.
//!
//! The stages are small and composable:
//! - `lexer` turns source text into a flat token stream.
//! - `parser` owns all syntactic knowledge and builds the AST.
//! - `codegen` walks the AST and emits 32-bit x86 AT&T assembly, threading
//!   GC metadata into every function prologue.
//! - `gc` is the runtime half of the contract: the semispace collector the
//!   emitted program reaches through `allocate`.
//! - `printer` renders an AST back to canonical source.
//! - `symtab` and `error` are shared by the stages above.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod gc;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod symtab;
pub mod token;

pub use error::{CompileError, CompileResult};

/// Compile L2 source text into AT&T assembly lines.
pub fn compile(source: &str) -> CompileResult<Vec<String>> {
    let tokens = lexer::tokenize(source)?;
    let program = parser::parse(tokens)?;
    Ok(codegen::generate(&program)?)
}
