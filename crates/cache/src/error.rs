//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Underlying I/O error reading or writing an artifact.
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Artifact bytes could not be (de)compressed.
    #[display("compression error on {}", _0.display())]
    Compression(#[error(not(source))] PathBuf),
    /// Serialization/deserialization error in the metadata snapshot.
    #[display("invalid cache metadata")]
    InvalidData,
    /// The cache root is unusable (not a directory, not creatable).
    #[display("invalid cache root: {}", _0.display())]
    InvalidRoot(#[error(not(source))] PathBuf),
}

impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
