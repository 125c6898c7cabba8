//! The engine's front door for the playback layer.
//!
//! The orchestrator owns the live session: it profiles the engine, runs the
//! preparation strategy, pins whatever is currently audible, keeps the
//! background scheduler fed as playback advances, and dispatches coordinator
//! effects against the real machinery.

use crate::context::{ContextKey, ContextSlot, PrefetchContext};
use crate::coordinators::{Effect, EffectSink, TuneVerdict};
use crate::error::{ErrorKind, Result};
use crate::readiness::ReadinessIndex;
use crate::resource::{Aggressiveness, PowerSource};
use crate::scheduler::{BufferScheduler, Segment};
use crate::strategy::{PlaybackPrep, PrepMode, PrepReport};
use aloud_cache::{BookId, ScoreContext, SegmentLocation};
use aloud_config::Settings;
use aloud_route::SynthesisRouter;
use aloud_synth::{BackendId, ContentKey, DeviceEngineProfile, VoiceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Session {
    ctx: Arc<PrefetchContext>,
    backend: BackendId,
    segments: Vec<Segment>,
    position: u32,
    pinned: Option<ContentKey>,
}

pub struct PrefetchOrchestrator {
    router: Arc<SynthesisRouter>,
    scheduler: Arc<BufferScheduler>,
    prep: PlaybackPrep,
    slot: Arc<ContextSlot>,
    readiness: Arc<ReadinessIndex>,
    power: Arc<dyn PowerSource>,
    pressure_window_factor: f64,
    profiles: Mutex<HashMap<BackendId, DeviceEngineProfile>>,
    session: Mutex<Option<Session>>,
    rate_epoch: AtomicU64,
    paused: AtomicBool,
}

impl PrefetchOrchestrator {
    pub fn new(router: Arc<SynthesisRouter>, settings: &Settings, power: Arc<dyn PowerSource>) -> Self {
        let slot = Arc::new(ContextSlot::new());
        let readiness = Arc::new(ReadinessIndex::new());
        let scheduler = Arc::new(BufferScheduler::new(
            Arc::clone(&router),
            settings.scheduler.clone(),
            Arc::clone(&slot),
            Arc::clone(&readiness),
        ));
        let prep = PlaybackPrep::new(Arc::clone(&router), settings.scheduler.segment_timeout());
        Self {
            router,
            scheduler,
            prep,
            slot,
            readiness,
            power,
            pressure_window_factor: settings.coordinators.pressure_window_factor,
            profiles: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            rate_epoch: AtomicU64::new(0),
            paused: AtomicBool::new(false),
        }
    }

    pub fn scheduler(&self) -> &Arc<BufferScheduler> {
        &self.scheduler
    }

    pub fn readiness(&self) -> &Arc<ReadinessIndex> {
        &self.readiness
    }

    pub fn slot(&self) -> &Arc<ContextSlot> {
        &self.slot
    }

    async fn profile_for(&self, backend: &BackendId, voice: &VoiceId) -> Result<DeviceEngineProfile> {
        if let Some(profile) = self.profiles.lock().expect("profiles poisoned").get(backend) {
            return Ok(profile.clone());
        }
        let profile = self
            .router
            .profile_backend(backend, voice)
            .await
            .map_err(|err| exn::Exn::from(ErrorKind::Route(err.to_string())))?;
        info!(backend = %backend, rtf = profile.measured_rtf, tier = ?profile.tier, "engine profiled");
        self.profiles.lock().expect("profiles poisoned").insert(backend.clone(), profile.clone());
        Ok(profile)
    }

    fn apply_resource_policy(&self, profile: &DeviceEngineProfile) {
        let aggressiveness = Aggressiveness::from_power(self.power.as_ref());
        let slots = profile.tier.parallel_slots().min(aggressiveness.parallel_cap());
        debug!(%aggressiveness, slots, "resource policy applied");
        self.scheduler.set_parallel_slots(slots);
    }

    /// Prepare `start_index` of a chapter for playback: profile the engine,
    /// run the preparation strategy, pin the start artifact and start
    /// background prefetch. The report surfaces the chosen [`PrepMode`]; a
    /// `BulkPrepare` caller knows the whole unit was synthesized up front.
    pub async fn request_playback_ready(
        self: &Arc<Self>,
        book: BookId,
        chapter_index: u32,
        backend: BackendId,
        voice: VoiceId,
        segments: Vec<Segment>,
        start_index: u32,
    ) -> Result<PrepReport> {
        let profile = self.profile_for(&backend, &voice).await?;
        self.apply_resource_policy(&profile);
        let mode = PrepMode::plan(&profile);

        let ctx = self.slot.install(ContextKey {
            book: book.clone(),
            chapter_index,
            voice,
            rate_epoch: self.rate_epoch.load(Ordering::Relaxed),
        });
        self.scheduler.reset();

        let report =
            self.prep.prepare_for_playback(mode, &ctx, &backend, &segments, start_index).await?;

        self.router.cache().pin(&report.first.key).await;
        self.slot.advance(&ctx, i64::from(start_index));
        self.readiness.mark_ready(&book, chapter_index, start_index);

        let previous = {
            let mut session = self.session.lock().expect("session poisoned");
            session
                .replace(Session {
                    ctx,
                    backend,
                    segments,
                    position: start_index,
                    pinned: Some(report.first.key.clone()),
                })
                .and_then(|old| old.pinned)
        };
        if let Some(key) = previous {
            self.router.cache().unpin(&key).await;
        }

        self.spawn_background_pass();
        Ok(report)
    }

    /// Playback of the current segment has confirmably begun; fire the
    /// immediate-next request.
    pub async fn notify_playback_started(&self) {
        let Some((ctx, backend, segments, position)) = self.session_view() else { return };
        let _ = self.scheduler.fetch_immediate_next(&ctx, &backend, &segments, position).await;
    }

    /// The listener moved to `index`. Re-pins the audible artifact and
    /// re-checks the watermarks.
    pub async fn notify_playback_advanced(self: &Arc<Self>, index: u32) {
        let (previous, current) = {
            let mut session = self.session.lock().expect("session poisoned");
            let Some(session) = session.as_mut() else { return };
            session.position = index;
            let current = session.segments.iter().find(|segment| segment.index == index).map(
                |segment| {
                    ContentKey::new(
                        session.backend.clone(),
                        session.ctx.key.voice.clone(),
                        &segment.text,
                    )
                },
            );
            let previous = session.pinned.take();
            session.pinned = current.clone();
            (previous, current)
        };

        if let Some(key) = current {
            self.router.cache().pin(&key).await;
        }
        if let Some(key) = previous {
            self.router.cache().unpin(&key).await;
        }
        self.spawn_background_pass();
    }

    /// A new listening context (book, chapter or voice). Installs a fresh
    /// [`PrefetchContext`]; everything in flight under the old one is stale.
    pub async fn notify_context_changed(
        self: &Arc<Self>,
        book: BookId,
        chapter_index: u32,
        backend: BackendId,
        voice: VoiceId,
        segments: Vec<Segment>,
        position: u32,
    ) {
        let voice_changed = self
            .slot
            .live()
            .is_some_and(|old| old.key.voice != voice);
        let ctx = self.slot.install(ContextKey {
            book,
            chapter_index,
            voice: voice.clone(),
            rate_epoch: self.rate_epoch.load(Ordering::Relaxed),
        });
        self.scheduler.reset();
        if voice_changed {
            self.readiness.invalidate();
            self.readiness.rebuild_from_cache(self.router.cache(), &voice).await;
        }

        let previous = {
            let mut session = self.session.lock().expect("session poisoned");
            session
                .replace(Session { ctx, backend, segments, position, pinned: None })
                .and_then(|old| old.pinned)
        };
        if let Some(key) = previous {
            self.router.cache().unpin(&key).await;
        }
        self.spawn_background_pass();
    }

    /// Stop everything: cancel the live context and release the pin.
    pub async fn cancel_all(&self) {
        self.slot.clear();
        let pinned = {
            let mut session = self.session.lock().expect("session poisoned");
            session.take().and_then(|session| session.pinned)
        };
        if let Some(key) = pinned {
            self.router.cache().unpin(&key).await;
        }
        self.scheduler.reset();
    }

    fn session_view(&self) -> Option<(Arc<PrefetchContext>, BackendId, Vec<Segment>, u32)> {
        let session = self.session.lock().expect("session poisoned");
        session.as_ref().map(|session| {
            (
                Arc::clone(&session.ctx),
                session.backend.clone(),
                session.segments.clone(),
                session.position,
            )
        })
    }

    fn spawn_background_pass(self: &Arc<Self>) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }
        let Some((ctx, backend, segments, position)) = self.session_view() else { return };
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            let report = scheduler.run_pass(&ctx, &backend, &segments, position).await;
            if report.failures > 0 {
                warn!(failures = report.failures, "background pass skipped failing segments");
            }
        });
    }

    fn score_context(&self) -> ScoreContext {
        let session = self.session.lock().expect("session poisoned");
        let (position, current_voice) = session
            .as_ref()
            .map(|session| {
                (
                    Some(SegmentLocation {
                        book: session.ctx.key.book.clone(),
                        chapter_index: session.ctx.key.chapter_index,
                        segment_index: session.position,
                    }),
                    Some(session.ctx.key.voice.clone()),
                )
            })
            .unwrap_or((None, None));
        ScoreContext { now: None, position, current_voice, book_progress: HashMap::new() }
    }

    /// Consume coordinator effects against the real machinery. This is the
    /// single dispatcher; coordinators never touch the scheduler directly.
    pub async fn dispatch_effects(self: &Arc<Self>, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::CancelPrefetch => {
                    if let Some(ctx) = self.slot.live() {
                        ctx.cancel.cancel();
                    }
                }
                Effect::InvalidateContext => {
                    self.scheduler.reset();
                    let voice = self.slot.live().map(|ctx| ctx.key.voice.clone());
                    self.readiness.invalidate();
                    if let Some(voice) = voice {
                        self.readiness.rebuild_from_cache(self.router.cache(), &voice).await;
                    }
                }
                Effect::RestartPrefetch => {
                    // Reinstall the same key with a fresh token; the cancelled
                    // context cannot be reused.
                    let reinstalled = self.slot.live().map(|old| {
                        self.rate_epoch.fetch_add(1, Ordering::Relaxed);
                        self.slot.install(ContextKey {
                            rate_epoch: self.rate_epoch.load(Ordering::Relaxed),
                            ..old.key.clone()
                        })
                    });
                    if let Some(ctx) = reinstalled {
                        let mut session = self.session.lock().expect("session poisoned");
                        if let Some(session) = session.as_mut() {
                            session.ctx = ctx;
                        }
                    }
                    self.spawn_background_pass();
                }
                Effect::PauseSynthesis => {
                    self.paused.store(true, Ordering::Relaxed);
                    if let Some(ctx) = self.slot.live() {
                        ctx.cancel.cancel();
                    }
                }
                Effect::ResumeSynthesis => {
                    self.paused.store(false, Ordering::Relaxed);
                }
                Effect::TrimCache => {
                    let target = self.router.cache().quota_bytes() / 2;
                    let ctx = self.score_context();
                    if let Err(err) = self.router.cache().evict_to_target(target, &ctx).await {
                        warn!(error = %err, "cache trim failed");
                    }
                }
                Effect::ShrinkPrefetchWindow => {
                    self.scheduler.set_window_factor(self.pressure_window_factor);
                }
                Effect::RestorePrefetchWindow => {
                    self.scheduler.set_window_factor(1.0);
                }
            }
        }
    }

    /// Act on an auto-tune verdict. A rollback swaps the snapshot back into
    /// the scheduler and restarts prefetch so in-flight work under the bad
    /// tuning is abandoned.
    pub async fn apply_tune_verdict(self: &Arc<Self>, verdict: TuneVerdict) {
        match verdict {
            TuneVerdict::Pending | TuneVerdict::Keep => {}
            TuneVerdict::Revert(snapshot) => {
                self.scheduler.apply_settings(snapshot);
                self.dispatch_effects(&[Effect::CancelPrefetch, Effect::RestartPrefetch]).await;
            }
        }
    }

    /// Spawn the periodic compression sweeper. Each tick defers to the power
    /// policy; on battery saver the sweep waits rather than burning CPU.
    /// Runs until the token is cancelled.
    pub fn spawn_cache_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly opened
            // cache isn't swept before anything is cold.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let aggressiveness =
                            Aggressiveness::from_power(orchestrator.power.as_ref());
                        if aggressiveness.defer_compression() {
                            debug!(%aggressiveness, "compression sweep deferred");
                            continue;
                        }
                        match orchestrator.router.cache().run_sweep_once().await {
                            Ok(report) if report.compressed > 0 => {
                                debug!(?report, "compression sweep finished");
                            },
                            Ok(_) => {},
                            Err(err) => warn!(error = %err, "compression sweep errored"),
                        }
                    },
                }
            }
        })
    }
}

/// Queue-based sink for use from synchronous coordinator call sites; drained
/// into [`PrefetchOrchestrator::dispatch_effects`].
#[derive(Debug, Default)]
pub struct EffectQueue {
    effects: Mutex<Vec<Effect>>,
}

impl EffectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Effect> {
        std::mem::take(&mut self.effects.lock().expect("effect queue poisoned"))
    }
}

impl EffectSink for EffectQueue {
    fn apply(&self, effect: Effect) {
        self.effects.lock().expect("effect queue poisoned").push(effect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinators::{AutoTuneGuard, TuneBaseline};
    use crate::resource::MockPowerSource;
    use aloud_cache::{AudioCache, CompressionState};
    use aloud_config::SchedulerSettings;
    use aloud_synth::{MockBackend, SynthesisBackend};
    use tokio::time::Instant;

    struct Harness {
        orchestrator: Arc<PrefetchOrchestrator>,
        backend: Arc<MockBackend>,
        power: Arc<MockPowerSource>,
        cache: Arc<AudioCache>,
        _dir: tempfile::TempDir,
    }

    fn harness(mock: MockBackend, settings: Settings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AudioCache::open(dir.path(), &settings.cache).unwrap());
        let backend = Arc::new(mock);
        let router = Arc::new(
            SynthesisRouter::new(Arc::clone(&cache), settings.router.clone())
                .with_backend(Arc::clone(&backend) as Arc<dyn SynthesisBackend>),
        );
        let power = Arc::new(MockPowerSource::new(100, true));
        let orchestrator =
            Arc::new(PrefetchOrchestrator::new(router, &settings, Arc::clone(&power) as _));
        Harness { orchestrator, backend, power, cache, _dir: dir }
    }

    fn chapter(count: u32) -> Vec<Segment> {
        (0..count)
            .map(|index| {
                let mut text = format!("segment {index} ");
                text.push_str(&"x".repeat(150 - text.len()));
                Segment { index, text }
            })
            .collect()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn playback_ready_prepares_pins_and_prefetches() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        let report = h
            .orchestrator
            .request_playback_ready(
                BookId::new("book-1"),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(8),
                0,
            )
            .await
            .unwrap();

        // An unloaded mock synthesizes instantly, so the engine profiles as
        // fast and only the start segment blocks.
        assert_eq!(report.mode, PrepMode::Sprint);
        assert!(report.errors.is_empty());
        let book = BookId::new("book-1");
        assert!(h.orchestrator.readiness().is_ready(&book, 0, 0));

        // The background pass catches up to the high watermark.
        let ctx = h.orchestrator.slot().live().unwrap();
        wait_until(|| ctx.prefetched_through() >= 3).await;
    }

    #[tokio::test]
    async fn playback_start_fires_the_immediate_next_segment() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        let book = BookId::new("book-1");
        h.orchestrator
            .request_playback_ready(
                book.clone(),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(4),
                0,
            )
            .await
            .unwrap();

        h.orchestrator.notify_playback_started().await;
        assert!(h.orchestrator.readiness().is_ready(&book, 0, 1));
    }

    #[tokio::test]
    async fn context_change_installs_a_fresh_context() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        h.orchestrator
            .request_playback_ready(
                BookId::new("book-1"),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(4),
                0,
            )
            .await
            .unwrap();
        let old = h.orchestrator.slot().live().unwrap();

        h.orchestrator
            .notify_context_changed(
                BookId::new("book-1"),
                1,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(4),
                0,
            )
            .await;

        assert!(old.cancel.is_cancelled());
        let fresh = h.orchestrator.slot().live().unwrap();
        assert_eq!(fresh.key.chapter_index, 1);
        assert_eq!(fresh.prefetched_through(), -1);
    }

    #[tokio::test]
    async fn voice_change_in_context_invalidates_readiness() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        let book = BookId::new("book-1");
        h.orchestrator
            .request_playback_ready(
                book.clone(),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(4),
                0,
            )
            .await
            .unwrap();
        assert!(h.orchestrator.readiness().is_ready(&book, 0, 0));

        h.orchestrator
            .notify_context_changed(
                book.clone(),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-bob"),
                chapter(4),
                0,
            )
            .await;

        // Segment 0 was cached under alice; under bob it is rebuilt from the
        // cache and correctly reported as not ready.
        assert!(!h.orchestrator.readiness().is_ready(&book, 0, 0));
    }

    #[tokio::test]
    async fn cancel_all_clears_the_session() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        h.orchestrator
            .request_playback_ready(
                BookId::new("book-1"),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(4),
                0,
            )
            .await
            .unwrap();
        let ctx = h.orchestrator.slot().live().unwrap();

        h.orchestrator.cancel_all().await;
        assert!(ctx.cancel.is_cancelled());
        assert!(h.orchestrator.slot().live().is_none());
    }

    #[tokio::test]
    async fn pause_and_resume_gate_background_passes() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        h.orchestrator
            .request_playback_ready(
                BookId::new("book-1"),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(12),
                0,
            )
            .await
            .unwrap();
        let ctx = h.orchestrator.slot().live().unwrap();
        wait_until(|| ctx.prefetched_through() >= 3).await;

        h.orchestrator.dispatch_effects(&[Effect::PauseSynthesis]).await;
        let paused_at = h.backend.invocations();
        h.orchestrator.notify_playback_advanced(3).await;
        tokio::task::yield_now().await;
        assert_eq!(h.backend.invocations(), paused_at, "synthesis ran while paused");

        h.orchestrator
            .dispatch_effects(&[Effect::ResumeSynthesis, Effect::RestartPrefetch])
            .await;
        let ctx = h.orchestrator.slot().live().unwrap();
        wait_until(|| ctx.prefetched_through() >= 6).await;
    }

    #[tokio::test]
    async fn queued_effects_dispatch_against_the_live_session() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        h.orchestrator
            .request_playback_ready(
                BookId::new("book-1"),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(4),
                0,
            )
            .await
            .unwrap();
        let old = h.orchestrator.slot().live().unwrap();

        let queue = EffectQueue::new();
        queue.apply(Effect::CancelPrefetch);
        queue.apply(Effect::RestartPrefetch);
        h.orchestrator.dispatch_effects(&queue.drain()).await;

        assert!(old.cancel.is_cancelled());
        let fresh = h.orchestrator.slot().live().unwrap();
        assert!(fresh.key.rate_epoch > old.key.rate_epoch);
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn pressure_effects_shrink_and_restore_the_window() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        assert_eq!(h.orchestrator.scheduler().window_factor(), 1.0);

        h.orchestrator.dispatch_effects(&[Effect::ShrinkPrefetchWindow]).await;
        assert_eq!(h.orchestrator.scheduler().window_factor(), 0.5);

        h.orchestrator.dispatch_effects(&[Effect::RestorePrefetchWindow]).await;
        assert_eq!(h.orchestrator.scheduler().window_factor(), 1.0);
    }

    #[tokio::test]
    async fn tune_rollback_restores_the_scheduler_snapshot() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        h.orchestrator
            .request_playback_ready(
                BookId::new("book-1"),
                0,
                BackendId::new("mock"),
                VoiceId::new("en-alice"),
                chapter(4),
                0,
            )
            .await
            .unwrap();
        let old = h.orchestrator.slot().live().unwrap();

        // Try a tighter low watermark, keeping the old configuration as the
        // rollback snapshot.
        let snapshot = h.orchestrator.scheduler().settings();
        let trial = SchedulerSettings { low_watermark_secs: 25, ..snapshot.clone() };
        h.orchestrator.scheduler().apply_settings(trial);
        let guard = AutoTuneGuard::new(Settings::default().coordinators);
        let baseline = TuneBaseline { underrun_rate: 0.01, failure_rate: 0.0 };
        let begun = Instant::now();
        guard.begin(snapshot.clone(), baseline, begun);

        for _ in 0..20 {
            guard.record_underrun();
        }
        let verdict = guard.evaluate(begun + Duration::from_secs(121));
        assert!(matches!(verdict, TuneVerdict::Revert(_)));

        h.orchestrator.apply_tune_verdict(verdict).await;
        assert_eq!(h.orchestrator.scheduler().settings(), snapshot);
        assert!(old.cancel.is_cancelled());
        let fresh = h.orchestrator.slot().live().unwrap();
        assert!(fresh.key.rate_epoch > old.key.rate_epoch);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweeper_defers_compression_until_power_allows() {
        let mut settings = Settings::default();
        // Everything stored is immediately cold.
        settings.cache.hot_window_secs = 0;
        let h = harness(MockBackend::new("mock"), settings);
        h.power.set_battery(10);
        h.power.set_charging(false);

        let key = ContentKey::new("mock".into(), "en-alice".into(), "segment 0");
        let location =
            SegmentLocation { book: BookId::new("book-1"), chapter_index: 0, segment_index: 0 };
        h.cache.store(key, &vec![0u8; 10_000], location, Duration::from_secs(5)).await.unwrap();

        let cancel = CancellationToken::new();
        let handle =
            h.orchestrator.spawn_cache_sweeper(Duration::from_millis(50), cancel.clone());

        // Several ticks pass on battery saver; the entry stays raw.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = h.cache.snapshot().await;
        assert_eq!(snapshot[0].compression, CompressionState::Raw, "swept on battery saver");

        h.power.set_charging(true);
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let snapshot = h.cache.snapshot().await;
                if snapshot[0].compression == CompressionState::Compressed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("sweep never ran after power returned");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn profiles_are_measured_once_per_backend() {
        let h = harness(MockBackend::new("mock"), Settings::default());
        for _ in 0..2 {
            h.orchestrator
                .request_playback_ready(
                    BookId::new("book-1"),
                    0,
                    BackendId::new("mock"),
                    VoiceId::new("en-alice"),
                    chapter(1),
                    0,
                )
                .await
                .unwrap();
        }
        // One calibration call plus one synthesis of segment 0; the second
        // round reuses both the profile and the cached artifact.
        assert_eq!(h.backend.invocations(), 2);
    }
}
