//! Prefetch Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A prefetch error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for prefetch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong while preparing or scheduling playback audio.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A blocking pre-synthesis call failed; playback cannot start on this
    /// segment. Background failures never surface this way.
    #[display("could not prepare segment {index} for playback: {reason}")]
    PrepareFailed {
        index: u32,
        #[error(not(source))]
        reason: String,
    },
    /// The requested voice cannot synthesize until remediated; carries the
    /// backend's hint (download or load the model).
    #[display("voice not ready: {_0}")]
    VoiceNotReady(#[error(not(source))] String),
    /// An operation needed a live prefetch context and none is installed.
    #[display("no live prefetch context")]
    NoContext,
    /// The requested start segment does not exist in the chapter.
    #[display("segment index {_0} out of range for chapter")]
    SegmentOutOfRange(#[error(not(source))] u32),
    /// Routing layer failure that the scheduler could not absorb.
    #[display("synthesis routing failed: {_0}")]
    Route(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PrepareFailed { .. } | Self::Route(_))
    }
}
