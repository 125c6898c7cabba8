//! Device engine profiling.
//!
//! A [`DeviceEngineProfile`] records how fast a backend synthesizes on *this*
//! device, as a real-time factor (wall-clock time per second of produced
//! audio). The playback-preparation strategy picks its window sizes from the
//! derived [`EngineTier`]. Profiles are produced by timing one real synthesis
//! of a calibration sentence and persisted externally, keyed by backend id.

use crate::backend::SynthesisBackend;
use crate::error::Result;
use crate::key::{BackendId, VoiceId};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use time::OffsetDateTime;
use tracing::info;

/// Discrete device/engine speed class, derived from measured RTF.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineTier {
    /// RTF < 0.35: synthesis far outpaces playback.
    Flagship,
    /// RTF < 0.7: comfortable headroom.
    MidRange,
    /// RTF < 1.0: keeps up, barely.
    Budget,
    /// RTF ≥ 1.0: slower than real time; standard prefetch cannot keep pace.
    Legacy,
}

impl EngineTier {
    pub fn from_rtf(rtf: f64) -> Self {
        match rtf {
            r if r < 0.35 => Self::Flagship,
            r if r < 0.7 => Self::MidRange,
            r if r < 1.0 => Self::Budget,
            _ => Self::Legacy,
        }
    }

    /// How many prefetch synthesis calls may run in parallel on this tier.
    /// Slower tiers stay sequential; parallelism there only adds contention.
    pub fn parallel_slots(self) -> usize {
        match self {
            Self::Flagship => 3,
            Self::MidRange => 2,
            Self::Budget | Self::Legacy => 1,
        }
    }
}

/// Measured synthesis performance of one backend on this device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceEngineProfile {
    pub backend: BackendId,
    /// Wall-clock synthesis time divided by produced audio duration.
    pub measured_rtf: f64,
    pub tier: EngineTier,
    #[serde(with = "time::serde::timestamp")]
    pub tuned_at: OffsetDateTime,
}

impl DeviceEngineProfile {
    /// Sentence long enough to amortize model warm-up into a stable reading.
    pub const CALIBRATION_TEXT: &'static str =
        "The quick brown fox jumps over the lazy dog while the narrator reads on at a steady, even pace.";

    /// Profile a backend by timing one real synthesis call.
    pub async fn measure(backend: &dyn SynthesisBackend, voice: &VoiceId) -> Result<Self> {
        let started = Instant::now();
        let output = backend.synthesize(voice, Self::CALIBRATION_TEXT).await?;
        let elapsed = started.elapsed();
        let audio_secs = output.audio_duration.as_secs_f64().max(f64::EPSILON);
        let measured_rtf = elapsed.as_secs_f64() / audio_secs;
        let profile = Self {
            backend: BackendId::new(backend.id()),
            measured_rtf,
            tier: EngineTier::from_rtf(measured_rtf),
            tuned_at: OffsetDateTime::now_utc(),
        };
        info!(backend = %profile.backend, rtf = measured_rtf, tier = ?profile.tier, "profiled synthesis backend");
        Ok(profile)
    }

    /// A profile assumed rather than measured, for first launch before any
    /// calibration pass has run.
    pub fn assumed(backend: BackendId, rtf: f64) -> Self {
        Self { backend, measured_rtf: rtf, tier: EngineTier::from_rtf(rtf), tuned_at: OffsetDateTime::now_utc() }
    }

    /// Whether synthesis is slower than playback on this device.
    pub fn slower_than_real_time(&self) -> bool {
        self.measured_rtf >= 1.0
    }
}
