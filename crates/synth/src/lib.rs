//! Synthesis backend abstraction for the aloud engine.
//!
//! This crate owns the identity layer (backends, voices, [`ContentKey`]s),
//! the [`SynthesisBackend`] seam behind which opaque neural engines live,
//! and device engine profiling ([`DeviceEngineProfile`]) used to classify
//! how fast an engine runs on this device.
//!
//! Enable the `mock` feature in dev-dependencies to get [`MockBackend`],
//! a scriptable in-memory engine for tests.

mod backend;
pub mod error;
mod key;
mod profile;

#[cfg(any(test, feature = "mock"))]
pub use crate::backend::{MockBackend, MockOutcome};
pub use crate::backend::{SynthOutput, SynthesisBackend, VoiceStatus};
pub use crate::key::{BackendId, ContentKey, SYNTHESIS_RATE, VoiceId, normalize_text};
pub use crate::profile::{DeviceEngineProfile, EngineTier};
