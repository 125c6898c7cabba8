//! Synthesis Backend Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use crate::key::VoiceId;
use derive_more::{Display, Error};

/// A backend error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories, mirroring what a neural synthesis engine can
/// report back.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The voice model is not installed; remediation is a download, not a retry.
    #[display("voice model missing: {_0}")]
    ModelMissing(#[error(not(source))] VoiceId),
    /// The voice model exists but failed integrity checks or could not load.
    #[display("voice model corrupted: {_0}")]
    ModelCorrupted(#[error(not(source))] VoiceId),
    /// A one-shot inference failure. Retrying once often succeeds.
    #[display("inference failed: {_0}")]
    InferenceFailed(#[error(not(source))] String),
    /// The engine ran out of memory. Unloading an idle model may free enough.
    #[display("backend out of memory")]
    OutOfMemory,
    /// The text cannot be synthesized (empty after normalization, unsupported
    /// script, over the engine's length limit).
    #[display("invalid synthesis input: {_0}")]
    InvalidInput(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InferenceFailed(_))
    }
}
