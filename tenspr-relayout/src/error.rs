//! Failure taxonomy of rematerialization and loop hoisting.

use crate::ir::{Encoding, Op, Type, Value};
use thiserror::Error;

/// Why a rewrite was not (or could not be) applied.
///
/// Every variant except [`Error::ResidualTypeMismatch`] is recoverable: the
/// caller keeps (or inserts) an explicit layout conversion and the program
/// stays correct.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The operation kind has no rule mapping a result encoding back to its operands.
    #[error("{op} ({kind}) cannot produce {target} by changing its operand layouts")]
    InversionUnsupported { op: Op, kind: &'static str, target: Encoding },

    /// The traversal reached an operation too costly to duplicate under the target layout.
    #[error("{op} ({kind}) is too expensive to rematerialize in {target}")]
    CostRejected { op: Op, kind: &'static str, target: Encoding },

    /// One value is needed in two different layouts by the same cone.
    #[error("{value} is required both in {first} and in {second}")]
    ConflictingRequirement { value: Value, first: Encoding, second: Encoding },

    /// The traversal reached a region argument, which has no defining operation to clone.
    #[error("{value} is a region argument")]
    CrossRegion { value: Value },

    /// The cone touches more distinct layouts than allowed.
    #[error("rematerialization touches {count} layouts, the limit is {limit}")]
    TooManyLayouts { count: usize, limit: usize },

    /// The cone needs more clones than allowed.
    #[error("rematerialization needs {cost} clones, the limit is {limit}")]
    OverBudget { cost: usize, limit: usize },

    /// Applying the plan would not lower the number of conversions.
    #[error("rematerialization adds {added} conversions and removes {removed}")]
    Unprofitable { removed: usize, added: usize },

    /// A conversion of a loop-carried value cannot be moved above its loop.
    #[error("conversion of {value} cannot leave its loop: {reason}")]
    LoopInvariant { value: Value, reason: String },

    /// A loop-carried value disagrees with its incoming value and no conversion can fix it.
    #[error("{op} carries {arg} in slot {index} but receives {incoming}")]
    ResidualTypeMismatch { op: Op, index: usize, arg: Type, incoming: Type },

    #[error("cannot infer the result type of {kind}: {reason}")]
    TypeInference { kind: &'static str, reason: String },

    #[error("{op} is not a layout conversion")]
    NotAConversion { op: Op },

    #[error("{op} is not placed in any region")]
    NotPlaced { op: Op },

    #[error("{op} cannot be erased while its results are used")]
    OpInUse { op: Op },

    #[error("evaluation failed: {0}")]
    Eval(String),
}

impl Error {
    /// A fatal error means the graph was left in a state that violates a correctness invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ResidualTypeMismatch { .. })
    }
}

/// A convenient alias for a `Result` that uses [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
