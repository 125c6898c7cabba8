//! Buffer scheduler.
//!
//! Keeps a rolling window of synthesized audio ahead of the playback
//! position. A pass moves `Idle → CheckingBuffer → (UrgentFetch |
//! NormalFetch | Buffered) → Idle`: when the buffered-ahead estimate falls
//! below the low watermark the scheduler walks forward from the prefetch
//! index, skipping cache hits and synthesizing misses, until the high
//! watermark or the segment cap binds.
//!
//! Two paths feed the buffer. The immediate-next path fires one
//! top-priority request for exactly the next segment once playback has
//! confirmably started; the background path is the watermark-driven walk.
//! Both commit through [`ContextSlot::advance`], so a result produced under
//! a stale context is never applied.

use crate::context::{ContextSlot, PrefetchContext};
use crate::readiness::ReadinessIndex;
use aloud_cache::{ArtifactHandle, SegmentLocation};
use aloud_config::SchedulerSettings;
use aloud_route::{Priority, SynthesisRequest, SynthesisRouter};
use aloud_synth::{BackendId, ContentKey};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// One synthesizable unit of chapter text, as delivered by segmentation.
#[derive(Clone, Debug)]
pub struct Segment {
    pub index: u32,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    CheckingBuffer,
    UrgentFetch,
    NormalFetch,
    Buffered,
}

/// What one background pass did.
#[derive(Debug)]
pub struct FetchPassReport {
    /// The fetch state the pass entered after checking the buffer.
    pub entered: SchedulerState,
    pub buffered_ahead: Duration,
    pub synthesized: usize,
    pub cache_hits: usize,
    /// Segments skipped after a failure or timeout; the walk advances past
    /// them rather than stalling.
    pub failures: usize,
}

enum StepOutcome {
    Ready { handle: ArtifactHandle, from_cache: bool },
    Failed,
    Cancelled,
}

pub struct BufferScheduler {
    router: Arc<SynthesisRouter>,
    settings: Mutex<SchedulerSettings>,
    slot: Arc<ContextSlot>,
    readiness: Arc<ReadinessIndex>,
    /// Known audio durations by segment index, for the live context only.
    durations: Mutex<HashMap<u32, Duration>>,
    parallel_slots: AtomicUsize,
    /// Multiplier on the high watermark and segment cap, stored as `f64`
    /// bits. Shrunk under memory pressure, restored on recovery.
    window_factor: AtomicU64,
    state: Mutex<SchedulerState>,
}

impl BufferScheduler {
    pub fn new(
        router: Arc<SynthesisRouter>,
        settings: SchedulerSettings,
        slot: Arc<ContextSlot>,
        readiness: Arc<ReadinessIndex>,
    ) -> Self {
        Self {
            router,
            settings: Mutex::new(settings),
            slot,
            readiness,
            durations: Mutex::new(HashMap::new()),
            parallel_slots: AtomicUsize::new(1),
            window_factor: AtomicU64::new(1.0f64.to_bits()),
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().expect("scheduler state poisoned")
    }

    /// Snapshot of the active tunables.
    pub fn settings(&self) -> SchedulerSettings {
        self.settings.lock().expect("scheduler settings poisoned").clone()
    }

    /// Swap in a new configuration; the next pass runs under it. Used by
    /// auto-tune application and rollback.
    pub fn apply_settings(&self, settings: SchedulerSettings) {
        *self.settings.lock().expect("scheduler settings poisoned") = settings;
    }

    /// Scale the prefetch window. `1.0` is the full configured window; memory
    /// pressure shrinks it without touching the configuration itself.
    pub fn set_window_factor(&self, factor: f64) {
        let factor = if factor.is_finite() { factor.clamp(0.1, 1.0) } else { 1.0 };
        self.window_factor.store(factor.to_bits(), Ordering::Relaxed);
    }

    pub fn window_factor(&self) -> f64 {
        f64::from_bits(self.window_factor.load(Ordering::Relaxed))
    }

    fn enter(&self, state: SchedulerState) {
        *self.state.lock().expect("scheduler state poisoned") = state;
    }

    /// How many synthesis steps may run concurrently during an urgent pass.
    /// Set from the engine tier capped by the resource aggressiveness.
    pub fn set_parallel_slots(&self, slots: usize) {
        self.parallel_slots.store(slots.max(1), Ordering::Relaxed);
    }

    /// Forget learned durations. Call when the context changes; the indices
    /// refer to a chapter that is no longer playing.
    pub fn reset(&self) {
        self.durations.lock().expect("scheduler durations poisoned").clear();
    }

    fn note_duration(&self, index: u32, duration: Duration) {
        self.durations.lock().expect("scheduler durations poisoned").insert(index, duration);
    }

    fn segment_duration(&self, segment: &Segment) -> Duration {
        self.durations
            .lock()
            .expect("scheduler durations poisoned")
            .get(&segment.index)
            .copied()
            .unwrap_or_else(|| self.settings().estimate_duration(&segment.text))
    }

    /// Sum of audio durations from just after the playback position through
    /// the prefetch index. Known durations come from synthesis results;
    /// unknown ones use the chars-per-second heuristic.
    pub fn buffered_ahead(&self, segments: &[Segment], position: u32, through: i64) -> Duration {
        segments
            .iter()
            .filter(|segment| i64::from(segment.index) <= through && segment.index > position)
            .map(|segment| self.segment_duration(segment))
            .sum()
    }

    fn content_key(&self, ctx: &PrefetchContext, backend: &BackendId, segment: &Segment) -> ContentKey {
        ContentKey::new(backend.clone(), ctx.key.voice.clone(), &segment.text)
    }

    fn location(&self, ctx: &PrefetchContext, index: u32) -> SegmentLocation {
        SegmentLocation {
            book: ctx.key.book.clone(),
            chapter_index: ctx.key.chapter_index,
            segment_index: index,
        }
    }

    async fn step(
        &self,
        ctx: &PrefetchContext,
        backend: &BackendId,
        segment: &Segment,
        priority: Priority,
        reason: &'static str,
    ) -> StepOutcome {
        let key = self.content_key(ctx, backend, segment);

        // Hits are served without touching the router's flight table.
        match self.router.cache().lookup(&key).await {
            Ok(Some(handle)) => return StepOutcome::Ready { handle, from_cache: true },
            Ok(None) => {}
            Err(err) => {
                warn!(segment = segment.index, error = %err, "cache lookup failed, treating as miss");
            }
        }

        let request = SynthesisRequest::new(
            key,
            self.location(ctx, segment.index),
            priority,
            reason,
            ctx.cancel.child_token(),
            self.settings().segment_timeout(),
        );
        match self.router.synthesize(&request).await {
            Ok(handle) => StepOutcome::Ready { handle, from_cache: false },
            Err(err) if err.is_cancellation() => StepOutcome::Cancelled,
            Err(err) => {
                warn!(segment = segment.index, error = %err, "synthesis failed, advancing past segment");
                StepOutcome::Failed
            }
        }
    }

    /// Fire the single top-priority request for the segment right after the
    /// playback position. Called once playback start is confirmed.
    pub async fn fetch_immediate_next(
        &self,
        ctx: &Arc<PrefetchContext>,
        backend: &BackendId,
        segments: &[Segment],
        position: u32,
    ) -> Option<ArtifactHandle> {
        let next = position.checked_add(1)?;
        let segment = segments.iter().find(|segment| segment.index == next)?;
        if ctx.cancel.is_cancelled() {
            return None;
        }
        let outcome = self.step(ctx, backend, segment, Priority::Immediate, "immediate-next").await;
        match outcome {
            StepOutcome::Ready { handle, .. } => {
                // Late check: the context may have moved while we awaited.
                if !self.slot.advance(ctx, i64::from(next)) {
                    return None;
                }
                self.note_duration(next, handle.audio_duration);
                self.readiness.mark_ready(&ctx.key.book, ctx.key.chapter_index, next);
                Some(handle)
            }
            StepOutcome::Failed | StepOutcome::Cancelled => None,
        }
    }

    /// Run one background pass: check the buffer and, if it is below the low
    /// watermark, walk forward until the high watermark or segment cap binds.
    pub async fn run_pass(
        &self,
        ctx: &Arc<PrefetchContext>,
        backend: &BackendId,
        segments: &[Segment],
        position: u32,
    ) -> FetchPassReport {
        self.enter(SchedulerState::CheckingBuffer);
        let settings = self.settings();
        let through = ctx.prefetched_through();
        let buffered = self.buffered_ahead(segments, position, through);

        let mut report = FetchPassReport {
            entered: SchedulerState::Buffered,
            buffered_ahead: buffered,
            synthesized: 0,
            cache_hits: 0,
            failures: 0,
        };

        if buffered >= settings.low_watermark() || ctx.cancel.is_cancelled() {
            self.enter(SchedulerState::Buffered);
            self.enter(SchedulerState::Idle);
            return report;
        }

        let urgent = buffered < settings.low_watermark() / 2;
        report.entered = if urgent { SchedulerState::UrgentFetch } else { SchedulerState::NormalFetch };
        self.enter(report.entered);
        debug!(
            buffered_ms = buffered.as_millis() as u64,
            urgent, position, through, "buffer below low watermark, fetching"
        );

        let priority = if urgent { Priority::Immediate } else { Priority::Medium };
        let window = if urgent { self.parallel_slots.load(Ordering::Relaxed) } else { 1 };

        // Under memory pressure the window factor shrinks both fetch limits.
        let factor = self.window_factor();
        let high_target = settings.high_watermark().mul_f64(factor);
        let segment_cap =
            ((settings.max_prefetch_segments as f64 * factor).ceil() as usize).max(1);

        let start = (through + 1).max(i64::from(position) + 1);
        let mut projected = buffered;
        let mut launched = 0usize;
        let mut upcoming = segments
            .iter()
            .filter(|segment| i64::from(segment.index) >= start)
            .collect::<Vec<_>>();
        upcoming.sort_by_key(|segment| segment.index);
        let mut queue = upcoming.into_iter();

        let mut pending = FuturesUnordered::new();
        let mut completed: BTreeMap<u32, StepOutcome> = BTreeMap::new();
        let mut next_commit = start;

        'pass: loop {
            while pending.len() < window && launched < segment_cap && projected < high_target {
                let Some(segment) = queue.next() else { break };
                if ctx.cancel.is_cancelled() {
                    break 'pass;
                }
                projected += self.segment_duration(segment);
                launched += 1;
                let index = segment.index;
                pending.push(async move {
                    (index, self.step(ctx, backend, segment, priority, "background prefetch").await)
                });
            }

            let Some((index, outcome)) = pending.next().await else { break };
            if ctx.cancel.is_cancelled() || matches!(outcome, StepOutcome::Cancelled) {
                break;
            }
            completed.insert(index, outcome);

            // Commit strictly in order so the index never jumps a gap.
            while let Some(outcome) = completed.remove(&(next_commit as u32)) {
                if !self.slot.advance(ctx, next_commit) {
                    debug!(index = next_commit, "context changed mid-pass, discarding results");
                    break 'pass;
                }
                match outcome {
                    StepOutcome::Ready { handle, from_cache } => {
                        self.note_duration(next_commit as u32, handle.audio_duration);
                        self.readiness.mark_ready(
                            &ctx.key.book,
                            ctx.key.chapter_index,
                            next_commit as u32,
                        );
                        if from_cache {
                            report.cache_hits += 1;
                        } else {
                            report.synthesized += 1;
                        }
                    }
                    StepOutcome::Failed => report.failures += 1,
                    StepOutcome::Cancelled => break 'pass,
                }
                next_commit += 1;
            }
        }

        report.buffered_ahead =
            self.buffered_ahead(segments, position, ctx.prefetched_through());
        self.enter(SchedulerState::Idle);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextKey;
    use aloud_cache::{AudioCache, BookId};
    use aloud_config::{CacheSettings, RouterSettings};
    use aloud_synth::{MockBackend, SynthesisBackend, VoiceId};
    use std::sync::Arc;

    struct Harness {
        scheduler: Arc<BufferScheduler>,
        backend: Arc<MockBackend>,
        slot: Arc<ContextSlot>,
        readiness: Arc<ReadinessIndex>,
        router: Arc<SynthesisRouter>,
        _dir: tempfile::TempDir,
    }

    fn harness(mock: MockBackend, settings: SchedulerSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AudioCache::open(dir.path(), &CacheSettings::default()).unwrap());
        let backend = Arc::new(mock);
        let router = Arc::new(
            SynthesisRouter::new(cache, RouterSettings::default())
                .with_backend(Arc::clone(&backend) as Arc<dyn SynthesisBackend>),
        );
        let slot = Arc::new(ContextSlot::new());
        let readiness = Arc::new(ReadinessIndex::new());
        let scheduler = Arc::new(BufferScheduler::new(
            Arc::clone(&router),
            settings,
            Arc::clone(&slot),
            Arc::clone(&readiness),
        ));
        Harness { scheduler, backend, slot, readiness, router, _dir: dir }
    }

    fn context_key() -> ContextKey {
        ContextKey {
            book: BookId::new("book-1"),
            chapter_index: 0,
            voice: VoiceId::new("en-alice"),
            rate_epoch: 0,
        }
    }

    /// `count` segments of roughly `chars` characters each. At the default
    /// 15 chars/sec heuristic, 150 chars estimates to 10 s of audio.
    fn chapter(count: u32, chars: usize) -> Vec<Segment> {
        (0..count)
            .map(|index| {
                let mut text = format!("segment {index} ");
                let pad = chars.saturating_sub(text.len());
                text.push_str(&"x".repeat(pad));
                Segment { index, text }
            })
            .collect()
    }

    #[tokio::test]
    async fn buffered_pass_does_nothing() {
        let h = harness(MockBackend::new("mock"), SchedulerSettings::default());
        let ctx = h.slot.install(context_key());
        let segments = chapter(4, 300); // 20 s each by estimate
        h.slot.advance(&ctx, 1);

        let report = h.scheduler.run_pass(&ctx, &"mock".into(), &segments, 0).await;
        assert_eq!(report.entered, SchedulerState::Buffered);
        assert_eq!(h.backend.invocations(), 0);
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn empty_buffer_fills_to_the_high_watermark() {
        let h = harness(MockBackend::new("mock"), SchedulerSettings::default());
        let ctx = h.slot.install(context_key());
        let segments = chapter(8, 150); // 10 s each

        let report = h.scheduler.run_pass(&ctx, &"mock".into(), &segments, 0).await;
        assert_eq!(report.entered, SchedulerState::UrgentFetch);
        // 3 x 10 s reaches the 30 s high watermark; the walk starts after
        // the playing segment.
        assert_eq!(report.synthesized, 3);
        assert_eq!(ctx.prefetched_through(), 3);
        assert!(report.buffered_ahead >= h.scheduler.settings().high_watermark());
        let book = BookId::new("book-1");
        for index in 1..=3 {
            assert!(h.readiness.is_ready(&book, 0, index));
        }
    }

    #[tokio::test]
    async fn pressure_window_factor_halves_the_fetch_target() {
        let h = harness(MockBackend::new("mock"), SchedulerSettings::default());
        let ctx = h.slot.install(context_key());
        let segments = chapter(8, 150); // 10 s each

        h.scheduler.set_window_factor(0.5);
        let report = h.scheduler.run_pass(&ctx, &"mock".into(), &segments, 0).await;
        // The high watermark scales from 30 s to 15 s, so the pass stops
        // after two segments instead of three.
        assert_eq!(report.synthesized, 2);
        assert_eq!(ctx.prefetched_through(), 2);

        // Recovery restores the full window: with playback caught up to the
        // buffered segments, the next pass fills the whole 30 s again.
        h.scheduler.set_window_factor(1.0);
        let report = h.scheduler.run_pass(&ctx, &"mock".into(), &segments, 2).await;
        assert_eq!(report.synthesized, 3);
        assert_eq!(ctx.prefetched_through(), 5);
    }

    #[tokio::test]
    async fn swapped_settings_govern_the_next_pass() {
        let h = harness(MockBackend::new("mock"), SchedulerSettings::default());
        let ctx = h.slot.install(context_key());
        let segments = chapter(8, 150); // 10 s each

        let tuned = SchedulerSettings {
            low_watermark_secs: 5,
            high_watermark_secs: 10,
            ..SchedulerSettings::default()
        };
        h.scheduler.apply_settings(tuned.clone());
        assert_eq!(h.scheduler.settings(), tuned);

        let report = h.scheduler.run_pass(&ctx, &"mock".into(), &segments, 0).await;
        // A single 10 s segment reaches the lowered high watermark.
        assert_eq!(report.synthesized, 1);
        assert_eq!(ctx.prefetched_through(), 1);
    }

    #[tokio::test]
    async fn cache_hits_advance_the_index_without_the_backend() {
        let h = harness(MockBackend::new("mock"), SchedulerSettings::default());
        let ctx = h.slot.install(context_key());
        let segments = chapter(8, 150);

        // Segments 1 and 2 already have artifacts under this voice.
        for segment in &segments[1..=2] {
            let key = ContentKey::new("mock".into(), "en-alice".into(), &segment.text);
            let location = SegmentLocation {
                book: BookId::new("book-1"),
                chapter_index: 0,
                segment_index: segment.index,
            };
            h.router
                .cache()
                .store(key, &vec![0u8; 64], location, Duration::from_secs(10))
                .await
                .unwrap();
        }

        let report = h.scheduler.run_pass(&ctx, &"mock".into(), &segments, 0).await;
        assert_eq!(report.cache_hits, 2);
        assert_eq!(report.synthesized, 1);
        assert_eq!(h.backend.invocations(), 1);
        assert_eq!(ctx.prefetched_through(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn context_change_mid_pass_discards_in_flight_results() {
        let h = harness(
            MockBackend::new("mock").with_latency(Duration::from_secs(3)),
            SchedulerSettings::default(),
        );
        let old = h.slot.install(context_key());
        let segments = chapter(4, 150);

        let pass = {
            let scheduler = Arc::clone(&h.scheduler);
            let ctx = Arc::clone(&old);
            let segments = segments.clone();
            tokio::spawn(async move { scheduler.run_pass(&ctx, &"mock".into(), &segments, 0).await })
        };
        tokio::task::yield_now().await;

        // Chapter change while a request is in flight.
        let fresh = h.slot.install(ContextKey { chapter_index: 1, ..context_key() });
        let report = pass.await.unwrap();

        assert_eq!(report.synthesized, 0, "stale results were applied");
        assert_eq!(old.prefetched_through(), -1);
        assert_eq!(fresh.prefetched_through(), -1, "new context must start clean");
    }

    #[tokio::test]
    async fn immediate_next_fetches_exactly_the_next_segment() {
        let h = harness(MockBackend::new("mock"), SchedulerSettings::default());
        let ctx = h.slot.install(context_key());
        let segments = chapter(4, 150);

        let handle = h
            .scheduler
            .fetch_immediate_next(&ctx, &"mock".into(), &segments, 0)
            .await
            .unwrap();
        assert_eq!(h.backend.invocations(), 1);
        assert_eq!(ctx.prefetched_through(), 1);
        assert!(handle.audio_duration > Duration::ZERO);
        assert!(h.readiness.is_ready(&BookId::new("book-1"), 0, 1));
    }

    #[tokio::test]
    async fn immediate_next_past_chapter_end_is_none() {
        let h = harness(MockBackend::new("mock"), SchedulerSettings::default());
        let ctx = h.slot.install(context_key());
        let segments = chapter(2, 150);

        assert!(h.scheduler.fetch_immediate_next(&ctx, &"mock".into(), &segments, 1).await.is_none());
        assert_eq!(h.backend.invocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_advances_past_the_segment_instead_of_stalling() {
        let settings = SchedulerSettings { segment_timeout_secs: 1, ..SchedulerSettings::default() };
        let h = harness(MockBackend::new("mock").with_latency(Duration::from_secs(30)), settings);
        let ctx = h.slot.install(context_key());
        let segments = chapter(4, 150);

        let report = h.scheduler.run_pass(&ctx, &"mock".into(), &segments, 0).await;
        assert!(report.failures > 0);
        assert_eq!(report.synthesized, 0);
        // The walk moved past the timed-out segments; nothing is stuck.
        assert!(ctx.prefetched_through() > 0);
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }
}
