// error.rs - Error types for graph edits and the command buffer pass
//
// Front-end problems (lexing, parsing, name resolution) are reported as
// `diag::Diagnostic`s and never reach these types. Everything here is fatal
// for the operation that returned it.

use thiserror::Error;

use crate::id::{CompId, InstrId};

/// A graph edit that the module refused to perform.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("instruction {0} does not exist or was removed")]
    UnknownInstruction(InstrId),

    #[error("computation {0} does not exist")]
    UnknownComputation(CompId),

    #[error("instructions '{from}' and '{to}' belong to different computations")]
    CrossComputationEdge { from: String, to: String },

    #[error("instruction '{0}' cannot be its own control predecessor")]
    SelfControlEdge(String),

    #[error("cannot remove '{name}': still used by {users:?}")]
    HasUsers { name: String, users: Vec<String> },

    #[error("cannot remove '{0}': it is the root of its computation")]
    RemovesRoot(String),

    #[error("computation '{0}' has no instructions")]
    EmptyComputation(String),

    #[error("local instruction {index} referenced before it was added (computation '{computation}')")]
    ForwardLocalReference { computation: String, index: usize },
}

/// Failure of the command buffer scheduling pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PassError {
    /// Input precondition: the module carries no schedule at all.
    #[error("module '{0}' is not scheduled")]
    MissingSchedule(String),

    /// Input precondition: the schedule is incomplete or contradicts an edge.
    #[error("invalid schedule for computation '{computation}': {reason}")]
    InvalidSchedule { computation: String, reason: String },

    /// Internal consistency error: the pass could not keep a dependency.
    #[error("invariant violation in computation '{computation}': {message}")]
    InvariantViolation { computation: String, message: String },

    #[error(transparent)]
    Graph(#[from] IrError),
}

impl PassError {
    pub fn invariant(computation: impl Into<String>, message: impl Into<String>) -> Self {
        PassError::InvariantViolation {
            computation: computation.into(),
            message: message.into(),
        }
    }
}
