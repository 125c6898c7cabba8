//! Layered settings for the synthesis engine.
//!
//! Defaults ⊕ optional TOML file ⊕ `ALOUD_`-prefixed environment variables,
//! in increasing order of precedence. Every tunable the engine exposes lives
//! here so the rest of the workspace never hardcodes a threshold.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const MB: u64 = 1024 * 1024;

/// Rough class of how much storage the device has to spare, used to pick a
/// sensible default cache quota when the user hasn't configured one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStorageClass {
    /// Low-end devices with little free space (500 MB quota).
    Compact,
    /// The common case (1 GB quota).
    #[default]
    Standard,
    /// Plenty of room (2 GB quota).
    Large,
    /// Effectively unconstrained (5 GB quota).
    Expansive,
}

impl DeviceStorageClass {
    /// Default cache byte budget for this storage class.
    pub fn default_quota_bytes(self) -> u64 {
        match self {
            Self::Compact => 500 * MB,
            Self::Standard => 1024 * MB,
            Self::Large => 2 * 1024 * MB,
            Self::Expansive => 5 * 1024 * MB,
        }
    }
}

/// Audio cache tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Byte budget for cached artifacts. `None` means "derive from
    /// [`storage_class`](Self::storage_class)".
    pub quota_bytes: Option<u64>,
    pub storage_class: DeviceStorageClass,
    /// Entries untouched for longer than this are candidates for the
    /// background compression sweep.
    pub hot_window_secs: u64,
    /// How often the compression sweep wakes up.
    pub sweep_interval_secs: u64,
    /// Zstd compression level used by the sweep.
    pub compression_level: i32,
    /// Smallest artifact considered valid on lookup. Anything shorter than
    /// one WAV header is garbage from an interrupted write.
    pub min_artifact_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            storage_class: DeviceStorageClass::default(),
            hot_window_secs: 3600,
            sweep_interval_secs: 300,
            compression_level: 3,
            min_artifact_bytes: 44,
        }
    }
}

impl CacheSettings {
    /// The effective byte budget: explicit quota, or the storage-class default.
    pub fn effective_quota(&self) -> u64 {
        self.quota_bytes.unwrap_or_else(|| self.storage_class.default_quota_bytes())
    }

    pub fn hot_window(&self) -> Duration {
        Duration::from_secs(self.hot_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Synthesis router tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Fixed concurrency permits per backend. Excess callers fail fast with
    /// a retryable `Busy` instead of queueing unboundedly.
    pub permits_per_backend: usize,
    /// How many times a transient failure (inference error, timeout) is
    /// retried. Once, no backoff.
    pub transient_retries: u32,
    /// Timeout attached to every backend call.
    pub synthesis_timeout_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self { permits_per_backend: 4, transient_retries: 1, synthesis_timeout_secs: 60 }
    }
}

impl RouterSettings {
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}

/// Buffer scheduler tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Buffered-ahead duration below which a prefetch pass starts.
    pub low_watermark_secs: u64,
    /// Buffered-ahead duration at which a prefetch pass stops.
    pub high_watermark_secs: u64,
    /// Hard cap on segments prefetched ahead regardless of duration.
    pub max_prefetch_segments: usize,
    /// Per-segment synthesis timeout inside a prefetch run. A timeout skips
    /// the segment, it never stalls the run.
    pub segment_timeout_secs: u64,
    /// Heuristic speaking rate used to estimate audio duration for segments
    /// that haven't been synthesized yet.
    pub chars_per_second: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            low_watermark_secs: 10,
            high_watermark_secs: 30,
            max_prefetch_segments: 15,
            segment_timeout_secs: 60,
            chars_per_second: 15.0,
        }
    }
}

impl SchedulerSettings {
    pub fn low_watermark(&self) -> Duration {
        Duration::from_secs(self.low_watermark_secs)
    }

    pub fn high_watermark(&self) -> Duration {
        Duration::from_secs(self.high_watermark_secs)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }

    /// Estimated spoken duration of a text segment at the configured rate.
    pub fn estimate_duration(&self, text: &str) -> Duration {
        Duration::from_secs_f64(text.chars().count() as f64 / self.chars_per_second)
    }
}

/// Edge-case coordinator tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Debounce window for playback-rate changes.
    pub rate_debounce_ms: u64,
    /// A single rate change of at least this delta skips the debounce and
    /// cancels prefetch immediately.
    pub rate_step_threshold: f64,
    /// Quiet period with no renewed memory pressure before synthesis resumes.
    pub pressure_recovery_secs: u64,
    /// Multiplier applied to the prefetch window (high watermark and segment
    /// cap) while under memory pressure.
    pub pressure_window_factor: f64,
    /// Auto-tune rolls back when the underrun rate rises by this factor over
    /// the recorded baseline.
    pub autotune_underrun_factor: f64,
    /// Auto-tune rolls back when the synthesis failure rate exceeds this
    /// absolute ceiling, regardless of baseline.
    pub autotune_failure_ceiling: f64,
    /// Length of the auto-tune monitoring window.
    pub autotune_window_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            rate_debounce_ms: 500,
            rate_step_threshold: 0.5,
            pressure_recovery_secs: 10,
            pressure_window_factor: 0.5,
            autotune_underrun_factor: 1.5,
            autotune_failure_ceiling: 0.2,
            autotune_window_secs: 120,
        }
    }
}

impl CoordinatorSettings {
    pub fn rate_debounce(&self) -> Duration {
        Duration::from_millis(self.rate_debounce_ms)
    }

    pub fn pressure_recovery(&self) -> Duration {
        Duration::from_secs(self.pressure_recovery_secs)
    }

    pub fn autotune_window(&self) -> Duration {
        Duration::from_secs(self.autotune_window_secs)
    }
}

/// Top-level engine settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub router: RouterSettings,
    pub scheduler: SchedulerSettings,
    pub coordinators: CoordinatorSettings,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and `ALOUD_`
    /// environment variables (highest precedence). Nested keys use a double
    /// underscore: `ALOUD_SCHEDULER__LOW_WATERMARK_SECS=5`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            debug!(path = %path.display(), "merging configuration file");
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings =
            figment.merge(Env::prefixed("ALOUD_").split("__")).extract().or_raise(|| ErrorKind::Load)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Platform-appropriate directory for the default configuration file.
    pub fn default_config_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "aloud").ok_or_else(|| ErrorKind::NoConfigDir)?;
        Ok(dirs.config_dir().to_path_buf())
    }

    /// Reject value combinations that would misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.low_watermark_secs >= self.scheduler.high_watermark_secs {
            exn::bail!(ErrorKind::Invalid(format!(
                "low watermark ({}s) must be below high watermark ({}s)",
                self.scheduler.low_watermark_secs, self.scheduler.high_watermark_secs
            )));
        }
        if self.scheduler.max_prefetch_segments == 0 {
            exn::bail!(ErrorKind::Invalid("max_prefetch_segments must be at least 1".into()));
        }
        if self.router.permits_per_backend == 0 {
            exn::bail!(ErrorKind::Invalid("permits_per_backend must be at least 1".into()));
        }
        if self.cache.effective_quota() == 0 {
            exn::bail!(ErrorKind::Invalid("cache quota must be non-zero".into()));
        }
        if !(self.scheduler.chars_per_second > 0.0) {
            exn::bail!(ErrorKind::Invalid("chars_per_second must be positive".into()));
        }
        if !(self.coordinators.pressure_window_factor > 0.0
            && self.coordinators.pressure_window_factor <= 1.0)
        {
            exn::bail!(ErrorKind::Invalid("pressure_window_factor must be in (0, 1]".into()));
        }
        Ok(())
    }
}
