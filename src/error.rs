//! Compile-time error types shared across the pipeline.
//!
//! Every stage has its own error enum; `CompileError` is the umbrella the
//! driver reports. All compile errors are fatal and carry a human-readable
//! message; there is no recovery and no partial output.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

/// Lexical error with source position.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("lexical error at line {line}, column {col}: {message}"))]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

/// Raised by the parser on the first token that does not fit the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ParseError {
    #[snafu(display("expected {expected} but found {found}"))]
    UnexpectedToken { expected: String, found: String },

    #[snafu(display("expected {expected} but reached the end of the program"))]
    UnexpectedEnd { expected: String },

    #[snafu(display("'int' cannot be created with 'new'"))]
    NewInt,

    #[snafu(display("'int' cannot be redefined as a struct"))]
    StructInt,
}

/// Raised while walking the AST; names and arities are checked here since
/// there is no separate type checker in front of the code generator.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum CodeGenError {
    #[snafu(display("function {name} is defined more than once"))]
    DuplicateFunction { name: String },

    #[snafu(display("type {name} is already defined"))]
    DuplicateType { name: String },

    #[snafu(display("{name} is already defined in the same scope"))]
    DuplicateVariable { name: String },

    #[snafu(display("reference to undefined variable {name}"))]
    UndefinedVariable { name: String },

    #[snafu(display("trying to use undefined function {name}"))]
    UndefinedFunction { name: String },

    #[snafu(display("type {name} is not defined"))]
    UndefinedType { name: String },

    #[snafu(display("field {field} is not found in struct {type_name}"))]
    UndefinedField { field: String, type_name: String },

    #[snafu(display("{name} has no fields to access"))]
    NotARecord { name: String },

    #[snafu(display(
        "the function {name} expects {expected} arguments but {given} arguments are given"
    ))]
    ArityMismatch {
        name: String,
        expected: usize,
        given: usize,
    },

    #[snafu(display("local variables in inner scopes are not allowed in L2"))]
    InnerScopeLocals,

    #[snafu(display(
        "{name} declares more than 32 slots; a frame bitmap cannot describe it"
    ))]
    TooManyLocals { name: String },

    #[snafu(display(
        "struct {name} cannot be described to the garbage collector: \
         reference fields must be among the first 23 fields and a struct \
         is limited to 255 fields"
    ))]
    UntraceableLayout { name: String },
}

/// Umbrella error reported by the driver.
#[derive(Debug, Snafu)]
pub enum CompileError {
    #[snafu(context(false), display("{source}"))]
    Lex { source: LexError },

    #[snafu(context(false), display("parse error: {source}"))]
    Parse { source: ParseError },

    #[snafu(context(false), display("code generation error: {source}"))]
    CodeGen { source: CodeGenError },
}
