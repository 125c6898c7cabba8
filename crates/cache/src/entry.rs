//! Cache entry metadata.
//!
//! One [`CacheEntry`] per stored artifact. The entry index is the cache's
//! in-memory source of truth; [`snapshot`](crate::AudioCache::snapshot) and
//! [`restore`](crate::AudioCache::restore) serialize these shapes for
//! whatever persistence layer the host application provides.

use aloud_synth::ContentKey;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

/// Identifies one book in the user's library.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(String);

impl BookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BookId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// On-disk representation state of one artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionState {
    /// Plain WAV, ready to play.
    #[default]
    Raw,
    /// The sweep is rewriting this artifact right now.
    Compressing,
    /// Stored compressed; lookup decompresses transparently.
    Compressed,
    /// Compression failed; the raw artifact is still intact. Cleared on the
    /// next access so a later sweep may try again.
    Failed,
}

/// Where a segment sits within the library, recorded so eviction scoring can
/// reason about reading position and book progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLocation {
    pub book: BookId,
    pub chapter_index: u32,
    pub segment_index: u32,
}

/// Metadata for one cached artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ContentKey,
    /// Artifact filename relative to the cache root. Carries a compression
    /// suffix (`.gz`/`.zst`) when the state is [`CompressionState::Compressed`].
    pub artifact: PathBuf,
    pub size_bytes: u64,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub last_accessed_at: OffsetDateTime,
    pub access_count: u32,
    pub location: SegmentLocation,
    pub audio_duration_ms: u64,
    pub compression: CompressionState,
}

impl CacheEntry {
    pub fn audio_duration(&self) -> Duration {
        Duration::from_millis(self.audio_duration_ms)
    }

    /// Record an access: bump the counter and reset the hot window.
    pub(crate) fn touch(&mut self, now: OffsetDateTime) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
        if self.compression == CompressionState::Failed {
            self.compression = CompressionState::Raw;
        }
    }

    /// Hours since the last access, for recency scoring. Clock skew can make
    /// this negative; clamp instead of scoring into the future.
    pub(crate) fn idle_hours(&self, now: OffsetDateTime) -> f64 {
        ((now - self.last_accessed_at).as_seconds_f64() / 3600.0).max(0.0)
    }
}
