//! Content identity for synthesized audio.
//!
//! A [`ContentKey`] deterministically names one unit of synthesizable text:
//! equal keys always address the same artifact, across processes and across
//! restarts. Playback rate is deliberately *not* part of the key — synthesis
//! always runs at rate 1.0 and the player applies tempo at play time, so one
//! cached artifact serves every playback rate.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Synthesis always runs at this rate; see the module docs for why.
pub const SYNTHESIS_RATE: f32 = 1.0;

static WHITESPACE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Identifies one synthesis backend (one engine implementation).
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BackendId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifies one voice model within a backend.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoiceId(String);

impl VoiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VoiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Collapse all runs of Unicode whitespace to single spaces and trim.
///
/// Segments that differ only in line wrapping or indentation read identically
/// aloud, so they should share one cached artifact.
pub fn normalize_text(raw: &str) -> String {
    WHITESPACE.replace_all(raw.trim(), " ").into_owned()
}

/// Deterministic identity of a synthesizable text unit at fixed synthesis
/// rate: (backend, voice, normalized text).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    pub backend: BackendId,
    pub voice: VoiceId,
    normalized_text: String,
}

impl ContentKey {
    /// Build a key from raw segment text; normalization happens here, so two
    /// keys built from visually identical text always compare equal.
    pub fn new(backend: BackendId, voice: VoiceId, raw_text: &str) -> Self {
        Self { backend, voice, normalized_text: normalize_text(raw_text) }
    }

    pub fn text(&self) -> &str {
        &self.normalized_text
    }

    /// Content-addressed artifact filename: the BLAKE3 hex digest of the
    /// canonical key rendering. Any two equal-content requests collide
    /// deterministically onto the same file.
    pub fn artifact_name(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.backend.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.voice.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(format!("{SYNTHESIS_RATE:.2}").as_bytes());
        hasher.update(b"\n");
        hasher.update(self.normalized_text.as_bytes());
        format!("{}.wav", hasher.finalize().to_hex())
    }
}
