//! Fatal analysis error kinds.

use thiserror::Error;

use crate::cfg::BlockIdx;
use crate::label::Label;
use crate::ssa::Var;

/// Errors surfaced by the analysis core. All of these are fatal: they
/// indicate either a malformed CFG, a wasm feature outside the supported
/// subset, or a broken internal invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// A block index was looked up but is not part of the CFG.
    #[error("block {0} not found in CFG")]
    BlockNotFound(BlockIdx),

    /// An instruction label was looked up but is not in the instruction map.
    #[error("instruction {0} not found in CFG")]
    InstrNotFound(Label),

    /// A variable is used but never defined (SSA violation).
    #[error("use of {0} without a definition")]
    UseWithoutDef(Var),

    /// The instruction uses a wasm feature outside the supported subset.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Two var stacks of differing lengths were merged outside the
    /// entry-vs-exit special case.
    #[error("cannot merge value stacks of lengths {left} and {right}")]
    MergeMismatch { left: usize, right: usize },

    /// Re-annotating a sliced CFG failed; the slicer broke the stack
    /// invariant somewhere.
    #[error("sliced CFG failed validation: {0}")]
    SliceValidation(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

impl AnalysisError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        AnalysisError::Unsupported(what.into())
    }
}
