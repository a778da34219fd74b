use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod asm;
pub mod ast;
pub mod cfg;
pub mod instr;
pub mod opcode;
pub mod reconstruct;
pub mod render;
pub mod scope;
pub mod symbols;
pub mod types;

pub use asm::{AsmInstr, Assembly, InstanceRef, LabelKey, assemble};
pub use ast::{Expression, Statement};
pub use cfg::{BranchType, ControlFlowGraph};
pub use instr::{Instr, Operand, PushValue, VarRef, decode, encode};
pub use opcode::{Dialect, OpCode, OpCodePair};
pub use symbols::{SymbolKind, SymbolRef, SymbolTable, Symbols};
pub use types::{ComparisonType, DataType, InstanceType, VariableType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompileOptions {
    pub dialect: Dialect,
    pub lenient_stack: bool,
    pub labels: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::F,
            lenient_stack: false,
            labels: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum DegmlError {
    #[error("unexpected end of input")]
    Eof,

    #[error("invalid opcode 0x{op:02x} at {offset:#x}")]
    InvalidOpcode { offset: u32, op: u8 },

    #[error("invalid data type nibble {nibble:#x} at {offset:#x}")]
    InvalidDataType { offset: u32, nibble: u8 },

    #[error("invalid variable type 0x{tag:02x} at {offset:#x}")]
    InvalidVariableType { offset: u32, tag: u8 },

    #[error("branch at {offset:#x} points before the start of the code")]
    BranchOutOfRange { offset: u32 },

    #[error("branch at {offset:#x} to {target:#x} is not word aligned")]
    MisalignedBranch { offset: u32, target: u32 },

    #[error("instruction at {offset:#x} runs past the end of the offset space")]
    OffsetOverflow { offset: u32 },

    #[error("branch at {offset:#x} targets {target:#x}, which is not an instruction boundary")]
    BadBranchTarget { offset: u32, target: u32 },

    #[error("operand stack underflow at {offset:#x}")]
    StackUnderflow { offset: u32 },

    #[error("unbalanced pushenv/popenv at {offset:#x}")]
    UnbalancedScope { offset: u32 },

    #[error("literal of type {expected} holds a {found} value")]
    TypeMismatch { expected: DataType, found: &'static str },

    #[error("unknown label: {label}")]
    UnknownLabel { label: String },

    #[error("invalid symbol index: {0}")]
    UnknownSymbol(u32),

    #[error("invalid string index: {0}")]
    UnknownString(u32),

    #[error("name not in symbol table: {name}")]
    UnknownName { name: String },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// Coarse classification of a [`DegmlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BadBranchTarget,
    StackUnderflow,
    UnbalancedScope,
    TypeMismatch,
    UnknownLabel,
    Decode,
    Symbol,
    Syntax,
}

impl DegmlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DegmlError::BadBranchTarget { .. } => ErrorKind::BadBranchTarget,
            DegmlError::StackUnderflow { .. } => ErrorKind::StackUnderflow,
            DegmlError::UnbalancedScope { .. } => ErrorKind::UnbalancedScope,
            DegmlError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            DegmlError::UnknownLabel { .. } => ErrorKind::UnknownLabel,
            DegmlError::Eof
            | DegmlError::InvalidOpcode { .. }
            | DegmlError::InvalidDataType { .. }
            | DegmlError::InvalidVariableType { .. }
            | DegmlError::BranchOutOfRange { .. }
            | DegmlError::MisalignedBranch { .. }
            | DegmlError::OffsetOverflow { .. } => ErrorKind::Decode,
            DegmlError::UnknownSymbol(_) | DegmlError::UnknownString(_) | DegmlError::UnknownName { .. } => ErrorKind::Symbol,
            DegmlError::Syntax { .. } => ErrorKind::Syntax,
        }
    }

    /// Byte offset of the faulting instruction, when known.
    pub fn offset(&self) -> Option<u32> {
        match self {
            DegmlError::InvalidOpcode { offset, .. }
            | DegmlError::InvalidDataType { offset, .. }
            | DegmlError::InvalidVariableType { offset, .. }
            | DegmlError::BranchOutOfRange { offset }
            | DegmlError::MisalignedBranch { offset, .. }
            | DegmlError::OffsetOverflow { offset }
            | DegmlError::BadBranchTarget { offset, .. }
            | DegmlError::StackUnderflow { offset }
            | DegmlError::UnbalancedScope { offset } => Some(*offset),
            _ => None,
        }
    }
}

/// A fault raised while decompiling one function of a batch.
#[derive(Debug, Error)]
#[error("{function}: {error}")]
pub struct FunctionError {
    pub function: String,
    #[source]
    pub error: DegmlError,
}

/// One function's instruction table, as handed over by the container reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBody {
    pub name: String,
    pub instrs: Vec<Instr>,
}

/// Builds the control-flow graph of `instrs`, reconstructs each vertex and
/// folds environment pairs into scoped blocks.
pub fn decompile_function(instrs: &[Instr], symbols: &dyn SymbolTable, options: DecompileOptions) -> Result<Vec<Statement>, DegmlError> {
    let graph = ControlFlowGraph::build(instrs)?;
    let blocks = reconstruct::reconstruct_graph(&graph, symbols, options.lenient_stack)?;

    // Branches folded into conditional values no longer need their labels.
    let targets: BTreeSet<u32> = blocks
        .iter()
        .flatten()
        .filter_map(|s| match s {
            Statement::Branch { target, .. } => Some(*target),
            _ => None,
        })
        .collect();

    let mut stmts = Vec::new();
    for (vertex, block) in graph.vertices().iter().zip(blocks) {
        if options.labels && targets.contains(&vertex.start) {
            stmts.push(Statement::Label(vertex.start));
        }
        stmts.extend(block);
    }
    if options.labels && targets.contains(&graph.end()) {
        stmts.push(Statement::Label(graph.end()));
    }

    let stmts = scope::reconcile(stmts)?;
    debug!(vertices = graph.vertices().len(), statements = stmts.len(), "decompiled function");
    Ok(stmts)
}

pub fn render_function(name: &str, stmts: &[Statement]) -> Result<String, DegmlError> {
    render::function(name, stmts)
}

/// Decompiles every body independently; one failure never aborts the rest.
pub fn decompile_functions(bodies: &[FunctionBody], symbols: &dyn SymbolTable, options: DecompileOptions) -> Vec<Result<String, FunctionError>> {
    bodies
        .iter()
        .map(|b| {
            decompile_function(&b.instrs, symbols, options)
                .and_then(|stmts| render_function(&b.name, &stmts))
                .map_err(|error| FunctionError { function: b.name.clone(), error })
        })
        .collect()
}

pub fn decompile_to_string(bodies: &[FunctionBody], symbols: &dyn SymbolTable, options: DecompileOptions) -> String {
    let mut out = String::new();
    for r in decompile_functions(bodies, symbols, options) {
        let s = match r {
            Ok(s) => s,
            Err(e) => {
                debug!(function = %e.function, kind = ?e.error.kind(), "function failed");
                format!("// {e}\n")
            }
        };
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&s);
    }
    out
}

/// Decodes one code blob with the configured dialect and decompiles it.
pub fn decompile_code(bytes: &[u8], symbols: &dyn SymbolTable, options: DecompileOptions) -> Result<Vec<Statement>, DegmlError> {
    let instrs = decode(bytes, options.dialect)?;
    decompile_function(&instrs, symbols, options)
}
