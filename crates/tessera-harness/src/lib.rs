//! Reference interpreter for tessera bytecode.
//!
//! The code generator only produces programs; this crate runs them against
//! an in-memory database so that tests can check what a program *does*
//! rather than what it looks like. B-trees are ordered maps, table records
//! are stored in their encoded form, and every opcode is interpreted
//! directly.

pub mod database;
pub mod engine;
pub mod storage;

pub use database::{ForeignKey, MemDatabase, QueryResult};
pub use engine::{Engine, ExecStats, Execution};
pub use storage::{IndexKey, Tree};

use tessera_error::TesseraError;
use tessera_types::opcode::Opcode;

/// Failures while compiling or running a program in the harness.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The statement did not compile, or a record failed to decode.
    #[error(transparent)]
    Tessera(#[from] TesseraError),

    /// A cursor was used before it was opened.
    #[error("cursor {cursor} is not open at pc {pc}")]
    CursorNotOpen { cursor: i32, pc: usize },

    /// An open instruction named a b-tree the database does not have.
    #[error("no b-tree with root page {root}")]
    NoSuchRoot { root: i32 },

    /// A column or rowid was read from a cursor with no current row.
    #[error("cursor {cursor} has no current row at pc {pc}")]
    NoCurrentRow { cursor: i32, pc: usize },

    /// An instruction found an operand of the wrong kind.
    #[error("{opcode:?} at pc {pc}: {detail}")]
    BadOperand {
        opcode: Opcode,
        pc: usize,
        detail: String,
    },

    /// `MustBeInt` without a fallback jump saw a non-integer.
    #[error("datatype mismatch: expected integer, got {actual}")]
    TypeMismatch { actual: &'static str },

    /// `FkCheck` found child rows still referencing the row being deleted.
    #[error("FOREIGN KEY constraint failed: {child} references {parent} row {rowid}")]
    ForeignKeyViolation {
        parent: String,
        child: String,
        rowid: i64,
    },

    /// The program ran longer than the configured step limit.
    #[error("step limit of {limit} exceeded")]
    StepLimit { limit: u64 },

    /// Control reached an address outside the program.
    #[error("jump to {target} is outside the program")]
    BadJump { target: i64 },
}

pub type Result<T> = std::result::Result<T, EngineError>;
