//! stagedattn error types

use crate::memory::{MatrixId, Tier};

/// stagedattn result type
pub type Result<T> = std::result::Result<T, Error>;

/// stagedattn errors
///
/// Every variant is fatal for a run: the engine never retries a step.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Operand dimensions incompatible with the requested operation
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// Operation that rejected the operands
        op: &'static str,
        /// Shape of the first operand
        lhs: (usize, usize),
        /// Shape of the second operand (or the expected shape)
        rhs: (usize, usize),
    },

    /// Operand not resident in the tier the operation requires
    #[error("tier violation in {op}: '{label}' is in {actual}, expected {expected}")]
    TierViolation {
        /// Operation that rejected the operand
        op: &'static str,
        /// Debug label of the operand
        label: String,
        /// Tier the operation requires
        expected: Tier,
        /// Tier the operand is resident in
        actual: Tier,
    },

    /// Operation issued against a released (or never allocated) handle
    #[error("use after release in {op}: {id}")]
    UseAfterRelease {
        /// Operation that touched the handle
        op: &'static str,
        /// The stale handle
        id: MatrixId,
    },

    /// Handle released twice
    #[error("double release of {id} ('{label}')")]
    DoubleRelease {
        /// The handle
        id: MatrixId,
        /// Debug label recorded at allocation
        label: String,
    },

    /// Scratch tier capacity would be exceeded
    #[error("scratch capacity exceeded: requested {requested} elements, {in_use} in use, capacity {capacity}")]
    CapacityExceeded {
        /// Elements the operation wanted to place in scratch
        requested: usize,
        /// Elements already resident in scratch
        in_use: usize,
        /// Configured scratch capacity in elements
        capacity: usize,
    },

    /// Handles still live after a run
    #[error("resource leak: {count} live handle(s): {labels:?}")]
    ResourceLeak {
        /// Number of leaked handles
        count: usize,
        /// Debug labels of the leaked handles
        labels: Vec<String>,
    },

    /// Operand allocated but never written
    #[error("{op}: matrix '{label}' holds no data")]
    EmptyMatrix {
        /// Operation that read the operand
        op: &'static str,
        /// Debug label of the operand
        label: String,
    },

    /// Host-side access attempted before pending instructions were synchronized
    #[error("{op}: {pending} instruction(s) pending, call synchronize first")]
    PendingWork {
        /// Host operation
        op: &'static str,
        /// Queue length at the time of the call
        pending: usize,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Configuration error
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },

    /// Query source / answer sink error
    #[error("oracle error: {reason}")]
    OracleError {
        /// Description of what went wrong
        reason: String,
    },
}
