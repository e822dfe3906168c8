//! Error taxonomy for the arbitrage core.
//!
//! Mirrors spec.md §7: transient vs. permanent venue errors, invariant
//! violations, and the rollback-failure critical path. Nothing here is used
//! for steady-state non-entry (see `entry::RejectReason`, which is not an
//! error).

use thiserror::Error;

/// Errors a `VenueAdapter` call can return. The distinction between
/// `Transient` and `Permanent` drives retry behavior in `executor` and
/// `risk`: transient errors get exponential backoff, permanent ones never
/// retry.
#[derive(Debug, Error, Clone)]
pub enum VenueError {
    #[error("{venue}: transient error: {message}")]
    Transient { venue: String, message: String },

    #[error("{venue}: permanent error: {message}")]
    Permanent { venue: String, message: String },

    #[error("{venue}: call timed out after {elapsed_ms}ms")]
    Timeout { venue: String, elapsed_ms: u64 },

    #[error("no adapter registered for venue {venue}")]
    UnknownVenue { venue: String },
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient { .. } | VenueError::Timeout { .. })
    }

    pub fn venue(&self) -> &str {
        match self {
            VenueError::Transient { venue, .. }
            | VenueError::Permanent { venue, .. }
            | VenueError::Timeout { venue, .. }
            | VenueError::UnknownVenue { venue } => venue,
        }
    }
}

/// A condition that is never supposed to happen and is never swallowed: the
/// pair transitions to `Error` and a `critical` notification is emitted.
#[derive(Debug, Error, Clone)]
pub enum CriticalFault {
    #[error("pair {pair_id}: invariant violated: {detail}")]
    InvariantViolation { pair_id: String, detail: String },

    #[error("pair {pair_id}: rollback of the filled leg failed: {detail}")]
    RollbackFailed { pair_id: String, detail: String },

    #[error("pair {pair_id}: emergency close after liquidation failed: {detail}")]
    EmergencyCloseFailed { pair_id: String, detail: String },
}

/// Outcome of the two-leg executor, distinct from `VenueError` because a
/// single-leg failure with a successful rollback is not an error condition
/// for the caller — it is reported, not propagated.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("both legs failed: long={long_err}, short={short_err}")]
    BothLegsFailed {
        long_err: String,
        short_err: String,
    },

    #[error("{failed_side} leg failed, {rolled_back_side} leg rolled back: {detail}")]
    SecondLegFailed {
        failed_side: &'static str,
        rolled_back_side: &'static str,
        detail: String,
    },

    #[error("{failed_side} leg failed and rollback of {rolled_back_side} also failed: {detail}")]
    RollbackFailed {
        failed_side: &'static str,
        rolled_back_side: &'static str,
        detail: String,
    },

    #[error("execution deadline expired before both legs confirmed")]
    Timeout,

    #[error("venue adapter missing: {0}")]
    AdapterMissing(String),
}
