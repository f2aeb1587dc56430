//! Line-oriented script target for the strand backend, and a VM that runs
//! its output on the reference scheduler.
//!
//! The target exists so generated state machines can be executed end to
//! end: [`compile`] renders a program with [`ScriptTarget`], [`Vm::load`]
//! parses the text back and runs frames through [`strand_rt::Scheduler`].

pub mod builtins;
pub mod ops;
pub mod syntax;
pub mod target;
pub mod value;
pub mod vm;

use strand_codegen::{CodegenError, GenConfig, GeneratedProgram, generate_program};
use strand_ir::Program;
use strand_rt::RuntimeError;

pub use target::ScriptTarget;
pub use value::Value;
pub use vm::{Flow, Vm, VmConfig, VmFrame};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("expected {expected}, found {found}")]
    Type { expected: &'static str, found: String },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// Run-time panic raised by generated code; becomes a task panic.
    #[error("runtime error: {0}")]
    Fault(RuntimeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("in `{function}` at line {line}: {source}")]
    Frame {
        function: String,
        line: usize,
        #[source]
        source: Box<ScriptError>,
    },
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{0}` is not available in this program")]
    Placeholder(String),
    #[error("synchronous call from `{function}` did not complete in one run")]
    SyncSuspend { function: String },
    #[error("`{function}` resumed at pseudo-block {addr}, which has no resume point")]
    Stub { function: String, addr: i64 },
    #[error("`{function}` has no entry point for {label}")]
    NoLabel { function: String, label: String },
    #[error("`{function}` ran past the end of its code")]
    FellThrough { function: String },
    #[error("register {0} read before it was written")]
    UnsetRegister(String),
    #[error("bad operand: {0}")]
    Operand(String),
    #[error("gave up after {0} scheduling rounds")]
    RoundLimit(usize),
}

impl ScriptError {
    pub(crate) fn fault(error: RuntimeError) -> Self {
        ScriptError::Fault(error)
    }

    /// The error with any frame context removed.
    pub fn root(&self) -> &ScriptError {
        match self {
            ScriptError::Frame { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Generate `program` for the script target.
pub fn compile(program: &Program, config: &GenConfig) -> Result<GeneratedProgram, CodegenError> {
    generate_program(program, &ScriptTarget::default(), config)
}
