//! Edge-case coordinators.
//!
//! Each coordinator reacts to exactly one signal (rate change, voice change,
//! memory pressure, auto-tune drift) and emits effects from one shared
//! vocabulary instead of calling into the scheduler directly. A single
//! dispatcher consumes the effects, which keeps every handler testable
//! against a recording sink.

use crate::context::{ContextKey, ContextSlot, PrefetchContext};
use crate::error::{ErrorKind, Result};
use crate::readiness::ReadinessIndex;
use crate::scheduler::Segment;
use aloud_cache::{ArtifactHandle, SegmentLocation};
use aloud_config::CoordinatorSettings;
use aloud_route::{Priority, SynthesisRequest, SynthesisRouter};
use aloud_synth::{BackendId, ContentKey, VoiceId};
use exn::OptionExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// The full vocabulary of things a coordinator may ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    CancelPrefetch,
    RestartPrefetch,
    InvalidateContext,
    PauseSynthesis,
    ResumeSynthesis,
    TrimCache,
    ShrinkPrefetchWindow,
    RestorePrefetchWindow,
}

/// Consumer of coordinator effects. The orchestrator is the real sink; tests
/// use [`RecordingSink`].
pub trait EffectSink: Send + Sync {
    fn apply(&self, effect: Effect);
}

#[cfg(any(test, feature = "mock"))]
pub use self::recording::RecordingSink;

#[cfg(any(test, feature = "mock"))]
mod recording {
    use super::{Effect, EffectSink};
    use std::sync::Mutex;

    /// Collects effects instead of acting on them.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        effects: Mutex<Vec<Effect>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn take(&self) -> Vec<Effect> {
            std::mem::take(&mut self.effects.lock().expect("recording sink poisoned"))
        }
    }

    impl EffectSink for RecordingSink {
        fn apply(&self, effect: Effect) {
            self.effects.lock().expect("recording sink poisoned").push(effect);
        }
    }
}

fn dispatch(sink: &dyn EffectSink, effects: &[Effect]) {
    for effect in effects {
        sink.apply(*effect);
    }
}

// ---------------------------------------------------------------------------
// Rate change
// ---------------------------------------------------------------------------

/// Debounces playback-rate scrubbing.
///
/// Users drag the rate slider through many intermediate values; reacting to
/// each would cancel and restart prefetch dozens of times. Small deltas are
/// held for a debounce window and only the settled value is applied. A
/// single step at or past the threshold applies immediately. The restart is
/// usually pure cache hits, since synthesis happens at a fixed rate.
pub struct RateChangeCoordinator {
    settings: CoordinatorSettings,
    state: Mutex<RateState>,
}

struct RateState {
    applied: f64,
    pending: Option<(f64, Instant)>,
}

impl RateChangeCoordinator {
    pub fn new(settings: CoordinatorSettings, initial_rate: f64) -> Self {
        Self { settings, state: Mutex::new(RateState { applied: initial_rate, pending: None }) }
    }

    fn apply_effects() -> Vec<Effect> {
        vec![Effect::CancelPrefetch, Effect::InvalidateContext, Effect::RestartPrefetch]
    }

    /// Record a new rate. Returns effects to dispatch now; an empty list
    /// means the change is being debounced (see [`Self::poll`]).
    pub fn on_rate_change(&self, new_rate: f64, now: Instant) -> Vec<Effect> {
        let mut state = self.state.lock().expect("rate state poisoned");
        if (new_rate - state.applied).abs() >= self.settings.rate_step_threshold {
            info!(from = state.applied, to = new_rate, "rate step past threshold, applying immediately");
            state.applied = new_rate;
            state.pending = None;
            return Self::apply_effects();
        }
        state.pending = Some((new_rate, now));
        Vec::new()
    }

    /// Flush a debounced change once it has settled.
    pub fn poll(&self, now: Instant) -> Vec<Effect> {
        let mut state = self.state.lock().expect("rate state poisoned");
        match state.pending {
            Some((rate, at)) if now.duration_since(at) >= self.settings.rate_debounce() => {
                state.applied = rate;
                state.pending = None;
                Self::apply_effects()
            }
            _ => Vec::new(),
        }
    }

    pub fn applied_rate(&self) -> f64 {
        self.state.lock().expect("rate state poisoned").applied
    }
}

// ---------------------------------------------------------------------------
// Voice change
// ---------------------------------------------------------------------------

/// Switches the narration voice mid-playback.
///
/// Cancels in-flight prefetch, invalidates the readiness index (it is keyed
/// without the voice and would otherwise lie), and resynthesizes the current
/// segment under the new voice. On failure the previous voice is restored
/// atomically: the listener keeps hearing something rather than nothing.
pub struct VoiceChangeCoordinator {
    router: Arc<SynthesisRouter>,
    slot: Arc<ContextSlot>,
    readiness: Arc<ReadinessIndex>,
    timeout: Duration,
}

impl VoiceChangeCoordinator {
    pub fn new(
        router: Arc<SynthesisRouter>,
        slot: Arc<ContextSlot>,
        readiness: Arc<ReadinessIndex>,
        timeout: Duration,
    ) -> Self {
        Self { router, slot, readiness, timeout }
    }

    async fn reindex(&self, voice: &VoiceId) {
        self.readiness.invalidate();
        self.readiness.rebuild_from_cache(self.router.cache(), voice).await;
    }

    async fn synthesize_current(
        &self,
        ctx: &Arc<PrefetchContext>,
        backend: &BackendId,
        segment: &Segment,
    ) -> aloud_route::error::Result<ArtifactHandle> {
        let request = SynthesisRequest::new(
            ContentKey::new(backend.clone(), ctx.key.voice.clone(), &segment.text),
            SegmentLocation {
                book: ctx.key.book.clone(),
                chapter_index: ctx.key.chapter_index,
                segment_index: segment.index,
            },
            Priority::Immediate,
            "voice change",
            ctx.cancel.child_token(),
            self.timeout,
        );
        self.router.synthesize(&request).await
    }

    /// Switch to `new_voice`, returning the fresh context and the current
    /// segment's artifact under it. On failure the old voice's context is
    /// reinstalled and the error propagates.
    pub async fn change_voice(
        &self,
        sink: &dyn EffectSink,
        backend: &BackendId,
        current_segment: &Segment,
        new_voice: VoiceId,
    ) -> Result<(Arc<PrefetchContext>, ArtifactHandle)> {
        let old = self.slot.live().ok_or_raise(|| ErrorKind::NoContext)?;
        let old_key = old.key.clone();
        dispatch(sink, &[Effect::CancelPrefetch, Effect::InvalidateContext]);

        let fresh = self.slot.install(ContextKey { voice: new_voice.clone(), ..old_key.clone() });
        self.reindex(&new_voice).await;

        match self.synthesize_current(&fresh, backend, current_segment).await {
            Ok(handle) => {
                dispatch(sink, &[Effect::RestartPrefetch]);
                Ok((fresh, handle))
            }
            Err(err) => {
                warn!(voice = %new_voice, error = %err, "voice change failed, restoring previous voice");
                let restored_voice = old_key.voice.clone();
                self.slot.install(old_key);
                self.reindex(&restored_voice).await;
                dispatch(sink, &[Effect::RestartPrefetch]);
                Err(exn::Exn::from(ErrorKind::VoiceNotReady(err.to_string())))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Memory pressure
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    None,
    Moderate,
    Critical,
}

/// Sheds load under memory pressure and restores it after a quiet period.
pub struct MemoryPressureCoordinator {
    settings: CoordinatorSettings,
    state: Mutex<PressureState>,
}

struct PressureState {
    level: PressureLevel,
    last_pressure_at: Option<Instant>,
    paused: bool,
}

impl MemoryPressureCoordinator {
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(PressureState {
                level: PressureLevel::None,
                last_pressure_at: None,
                paused: false,
            }),
        }
    }

    pub fn level(&self) -> PressureLevel {
        self.state.lock().expect("pressure state poisoned").level
    }

    /// Shrink factor for the prefetch window while under pressure.
    pub fn window_factor(&self) -> f64 {
        match self.level() {
            PressureLevel::None => 1.0,
            PressureLevel::Moderate | PressureLevel::Critical => {
                self.settings.pressure_window_factor
            }
        }
    }

    pub fn on_pressure(&self, level: PressureLevel, now: Instant) -> Vec<Effect> {
        let mut state = self.state.lock().expect("pressure state poisoned");
        if level == PressureLevel::None {
            return Vec::new();
        }
        state.last_pressure_at = Some(now);
        let first = state.level == PressureLevel::None;
        let escalated = level > state.level;
        state.level = state.level.max(level);

        let mut effects = vec![Effect::TrimCache];
        if first {
            effects.push(Effect::ShrinkPrefetchWindow);
        }
        if state.level == PressureLevel::Critical && !state.paused {
            state.paused = true;
            effects.push(Effect::PauseSynthesis);
        }
        if escalated {
            info!(?level, "memory pressure, shedding load");
        }
        effects
    }

    /// Emit recovery effects once the quiet period has elapsed with no
    /// renewed pressure.
    pub fn poll_recovery(&self, now: Instant) -> Vec<Effect> {
        let mut state = self.state.lock().expect("pressure state poisoned");
        let Some(at) = state.last_pressure_at else { return Vec::new() };
        if state.level == PressureLevel::None
            || now.duration_since(at) < self.settings.pressure_recovery()
        {
            return Vec::new();
        }

        info!("memory pressure cleared, restoring prefetch");
        let was_paused = state.paused;
        state.level = PressureLevel::None;
        state.last_pressure_at = None;
        state.paused = false;

        let mut effects = vec![Effect::RestorePrefetchWindow];
        if was_paused {
            effects.push(Effect::ResumeSynthesis);
        }
        effects.push(Effect::RestartPrefetch);
        effects
    }
}

// ---------------------------------------------------------------------------
// Auto-tune rollback
// ---------------------------------------------------------------------------

/// Baseline rates recorded before a calibration takes effect.
#[derive(Clone, Copy, Debug)]
pub struct TuneBaseline {
    /// Buffer underruns per second of monitored playback.
    pub underrun_rate: f64,
    /// Fraction of synthesis attempts that failed.
    pub failure_rate: f64,
}

#[derive(Debug, PartialEq)]
pub enum TuneVerdict {
    /// The monitoring window is still open.
    Pending,
    /// The new tuning held up; keep it.
    Keep,
    /// The new tuning regressed; revert to this snapshot.
    Revert(aloud_config::SchedulerSettings),
}

/// Watches a freshly calibrated configuration and reverts it when playback
/// regresses against the recorded baseline.
pub struct AutoTuneGuard {
    settings: CoordinatorSettings,
    state: Mutex<Option<Trial>>,
}

struct Trial {
    snapshot: aloud_config::SchedulerSettings,
    baseline: TuneBaseline,
    started: Instant,
    underruns: u32,
    attempts: u32,
    failures: u32,
}

impl AutoTuneGuard {
    pub fn new(settings: CoordinatorSettings) -> Self {
        Self { settings, state: Mutex::new(None) }
    }

    /// Start monitoring a new tuning. `snapshot` is the configuration to
    /// restore on rollback.
    pub fn begin(
        &self,
        snapshot: aloud_config::SchedulerSettings,
        baseline: TuneBaseline,
        now: Instant,
    ) {
        *self.state.lock().expect("autotune state poisoned") = Some(Trial {
            snapshot,
            baseline,
            started: now,
            underruns: 0,
            attempts: 0,
            failures: 0,
        });
    }

    pub fn record_underrun(&self) {
        if let Some(trial) = self.state.lock().expect("autotune state poisoned").as_mut() {
            trial.underruns += 1;
        }
    }

    pub fn record_synthesis(&self, ok: bool) {
        if let Some(trial) = self.state.lock().expect("autotune state poisoned").as_mut() {
            trial.attempts += 1;
            if !ok {
                trial.failures += 1;
            }
        }
    }

    /// Compare the trial against its baseline once the window closes.
    pub fn evaluate(&self, now: Instant) -> TuneVerdict {
        let mut state = self.state.lock().expect("autotune state poisoned");
        let Some(trial) = state.as_ref() else { return TuneVerdict::Keep };

        let elapsed = now.duration_since(trial.started);
        if elapsed < self.settings.autotune_window() {
            return TuneVerdict::Pending;
        }

        let underrun_rate = f64::from(trial.underruns) / elapsed.as_secs_f64();
        let failure_rate = if trial.attempts == 0 {
            0.0
        } else {
            f64::from(trial.failures) / f64::from(trial.attempts)
        };

        let underruns_regressed =
            underrun_rate > trial.baseline.underrun_rate * self.settings.autotune_underrun_factor;
        let failures_excessive = failure_rate > self.settings.autotune_failure_ceiling;

        let snapshot = trial.snapshot.clone();
        *state = None;
        if underruns_regressed || failures_excessive {
            warn!(underrun_rate, failure_rate, "tuned configuration regressed, rolling back");
            TuneVerdict::Revert(snapshot)
        } else {
            TuneVerdict::Keep
        }
    }
}
