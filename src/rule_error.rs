//! RuleMeshError: unified error type for rule-mesh public APIs
//!
//! Every fallible public operation in this crate returns
//! `Result<_, RuleMeshError>`. The taxonomy is deliberately fail-fast:
//! structural shortfalls that the scheduler can work around (a constraint a
//! rule cannot fully supply) are *not* errors — they are `warn!` diagnostics
//! and scheduling continues on the achievable subset. Everything below
//! aborts plan generation or execution.

use thiserror::Error;

/// Unified error type for rule-mesh operations.
#[derive(Debug, Error)]
pub enum RuleMeshError {
    /// A variable was requested (directly or through a rule chain) but no
    /// reachable rule can produce any of the requested entities.
    #[error("variable `{var}` is requested over {missing} entities no rule can produce")]
    UnproducibleVariable { var: String, missing: usize },

    /// Deletion of a variable was scheduled while a later rule still reads it.
    #[error("variable `{var}` would be freed before rule `{rule}` reads it")]
    PrematureDelete { var: String, rule: String },

    /// A name was looked up in the variable registry and is not interned.
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    /// A rule id fell outside the rule database.
    #[error("unknown rule id {0}")]
    UnknownRule(i32),

    /// The dependency graph contains a cycle that is not a bounded temporal
    /// recurrence (no time-advance edge closes it).
    #[error("cycle through `{0}` is not a temporal recurrence; graphs must be acyclic outside loops")]
    CycleOutsideLoop(String),

    /// A distributed-only operation was invoked on a fact store with no
    /// ownership/partition table.
    #[error("operation `{0}` requires a distributed fact store (no distribute_info present)")]
    NotDistributed(&'static str),

    /// Point-to-point or collective communication did not complete.
    #[error("communication failure with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A container packed or unpacked a different number of bytes than its
    /// declared `pack_size`.
    #[error("pack size mismatch for `{var}`: declared {declared} bytes, moved {moved}")]
    PackSizeMismatch {
        var: String,
        declared: usize,
        moved: usize,
    },

    /// A fact lookup failed: the variable has no container allocated.
    #[error("no fact allocated for variable `{0}`")]
    MissingFact(String),

    /// A mapping variable used in a clause chain is not a relation.
    #[error("variable `{0}` appears in a mapping chain but is not a map")]
    NotAMap(String),

    /// Thread partitioning was asked to split an empty execution set.
    #[error("cannot partition an empty entity set for rule `{0}`")]
    EmptyPartition(String),

    /// A supernode id referenced a slot outside the multi-level graph arena.
    #[error("supernode index {0} out of bounds")]
    BadSupernode(usize),

    /// Invariant guard tripped; carries rule/variable context for debugging.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl RuleMeshError {
    /// Shorthand for a boxed-source communication error.
    pub fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        RuleMeshError::CommError {
            neighbor,
            source: msg.into().into(),
        }
    }
}
