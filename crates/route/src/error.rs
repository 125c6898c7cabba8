//! Router Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Kinds here are deliberately `Clone`: when concurrent callers attach to one
//! in-flight synthesis, every follower receives its own copy of the leader's
//! outcome.

use derive_more::{Display, Error};

/// A routing error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Clone, Debug, Display, Error)]
pub enum ErrorKind {
    /// All concurrency permits for the backend are taken. Retry shortly.
    #[display("backend busy: no free synthesis permits")]
    Busy,
    /// The backend call exceeded its timeout. The attempt was abandoned;
    /// retrying starts fresh.
    #[display("synthesis timed out")]
    Timeout,
    /// Synthesis failed even after the retry budget. May succeed later.
    #[display("synthesis failed: {_0}")]
    SynthesisFailed(#[error(not(source))] String),
    /// The backend cannot serve this voice until somebody remediates
    /// (download or reload the model). Not retryable as-is.
    #[display("backend unavailable: {_0}")]
    BackendUnavailable(#[error(not(source))] String),
    /// The engine exhausted memory and unloading an idle model didn't help.
    #[display("backend out of memory")]
    ResourceExhausted,
    /// The text cannot be synthesized; retrying the same input is pointless.
    #[display("invalid synthesis input: {_0}")]
    InvalidInput(#[error(not(source))] String),
    /// No backend registered under the requested id.
    #[display("unknown backend: {_0}")]
    UnknownBackend(#[error(not(source))] String),
    /// The request's cancellation handle fired. Not a failure; resolve
    /// silently and discard partial work.
    #[display("synthesis cancelled")]
    Cancelled,
    /// The cache layer failed underneath the router.
    #[display("cache error: {_0}")]
    Cache(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::Timeout | Self::SynthesisFailed(_))
    }

    /// Cancellation resolves silently; it is not a failure to report.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
