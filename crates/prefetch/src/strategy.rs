//! Playback preparation strategy.
//!
//! How much synthesis must happen before playback starts depends on how the
//! engine's real-time factor compares to playback speed. A fast engine only
//! needs the first segment; a borderline engine also fires the second
//! segment immediately (not waiting for playback to start, which is what
//! opens the segment-1 buffering gap); an engine slower than real time can
//! never keep up mid-playback, so the whole unit is prepared up front and
//! the mode is surfaced to the caller instead of silently degrading.

use crate::context::PrefetchContext;
use crate::error::{ErrorKind, Result};
use crate::scheduler::Segment;
use aloud_cache::{ArtifactHandle, SegmentLocation};
use aloud_route::{Priority, SynthesisRequest, SynthesisRouter};
use aloud_synth::{BackendId, ContentKey, DeviceEngineProfile};
use exn::OptionExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How playback preparation behaves for a given engine profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepMode {
    /// RTF comfortably below 1.0: block on the start segment only, the
    /// background prefetch stays ahead unaided.
    Sprint,
    /// Borderline RTF: block on the start segment, then immediately begin
    /// the next one without waiting for playback to start.
    Relay,
    /// RTF at or above 1.0: prefetch cannot keep pace by construction.
    /// The whole unit is synthesized before playback starts.
    BulkPrepare,
}

impl PrepMode {
    pub fn plan(profile: &DeviceEngineProfile) -> Self {
        if profile.slower_than_real_time() {
            Self::BulkPrepare
        } else if profile.measured_rtf >= 0.7 {
            Self::Relay
        } else {
            Self::Sprint
        }
    }
}

/// Outcome of [`PlaybackPrep::prepare_for_playback`].
#[derive(Debug)]
pub struct PrepReport {
    pub mode: PrepMode,
    /// The ready-to-play artifact for the start segment.
    pub first: ArtifactHandle,
    /// Per-segment failures during bulk preparation. The start segment is
    /// never in here; its failure aborts preparation instead.
    pub errors: Vec<(u32, String)>,
}

pub struct PlaybackPrep {
    router: Arc<SynthesisRouter>,
    timeout: Duration,
}

impl PlaybackPrep {
    pub fn new(router: Arc<SynthesisRouter>, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    fn request(
        &self,
        ctx: &PrefetchContext,
        backend: &BackendId,
        segment: &Segment,
        priority: Priority,
        reason: &'static str,
    ) -> SynthesisRequest {
        SynthesisRequest::new(
            ContentKey::new(backend.clone(), ctx.key.voice.clone(), &segment.text),
            SegmentLocation {
                book: ctx.key.book.clone(),
                chapter_index: ctx.key.chapter_index,
                segment_index: segment.index,
            },
            priority,
            reason,
            ctx.cancel.child_token(),
            self.timeout,
        )
    }

    /// Synthesize whatever `mode` requires before playback may begin and
    /// return the start segment's artifact.
    pub async fn prepare_for_playback(
        &self,
        mode: PrepMode,
        ctx: &Arc<PrefetchContext>,
        backend: &BackendId,
        segments: &[Segment],
        start: u32,
    ) -> Result<PrepReport> {
        let first_segment = segments
            .iter()
            .find(|segment| segment.index == start)
            .ok_or_raise(|| ErrorKind::SegmentOutOfRange(start))?;

        let request = self.request(ctx, backend, first_segment, Priority::Immediate, "playback start");
        let first = self.router.synthesize(&request).await.map_err(|err| {
            exn::Exn::from(ErrorKind::PrepareFailed { index: start, reason: err.to_string() })
        })?;

        let mut errors = Vec::new();
        match mode {
            PrepMode::Sprint => {}
            PrepMode::Relay => {
                // Fire-and-forget: segment start+1 begins now, so it is ready
                // even if prefetch would otherwise wait for playback to start.
                if let Some(next) = segments.iter().find(|segment| segment.index == start + 1) {
                    let request = self.request(ctx, backend, next, Priority::High, "relay handoff");
                    let router = Arc::clone(&self.router);
                    let index = next.index;
                    tokio::spawn(async move {
                        if let Err(err) = router.synthesize(&request).await {
                            if !err.is_cancellation() {
                                warn!(segment = index, error = %err, "relay segment failed");
                            }
                        }
                    });
                }
            }
            PrepMode::BulkPrepare => {
                errors = self.prepare_unit(ctx, backend, segments, start + 1).await;
            }
        }

        debug!(?mode, start, errors = errors.len(), "playback preparation complete");
        Ok(PrepReport { mode, first, errors })
    }

    /// Synthesize every segment from `from` to the end of the unit,
    /// sequentially, collecting per-segment failures instead of aborting.
    pub async fn prepare_unit(
        &self,
        ctx: &Arc<PrefetchContext>,
        backend: &BackendId,
        segments: &[Segment],
        from: u32,
    ) -> Vec<(u32, String)> {
        let mut errors = Vec::new();
        for segment in segments.iter().filter(|segment| segment.index >= from) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let request = self.request(ctx, backend, segment, Priority::High, "bulk prepare");
            match self.router.synthesize(&request).await {
                Ok(_) => {}
                Err(err) if err.is_cancellation() => break,
                Err(err) => {
                    warn!(segment = segment.index, error = %err, "bulk preparation failed for segment");
                    errors.push((segment.index, err.to_string()));
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextKey, ContextSlot};
    use aloud_cache::{AudioCache, BookId};
    use aloud_config::{CacheSettings, RouterSettings};
    use aloud_synth::{MockBackend, SynthesisBackend, VoiceId};
    use rstest::rstest;

    #[rstest]
    #[case(0.2, PrepMode::Sprint)]
    #[case(0.69, PrepMode::Sprint)]
    #[case(0.7, PrepMode::Relay)]
    #[case(0.95, PrepMode::Relay)]
    #[case(1.0, PrepMode::BulkPrepare)]
    #[case(1.8, PrepMode::BulkPrepare)]
    fn plan_follows_the_real_time_factor(#[case] rtf: f64, #[case] expected: PrepMode) {
        let profile = DeviceEngineProfile::assumed(BackendId::new("mock"), rtf);
        assert_eq!(PrepMode::plan(&profile), expected);
    }

    fn harness(mock: MockBackend) -> (PlaybackPrep, Arc<MockBackend>, Arc<ContextSlot>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AudioCache::open(dir.path(), &CacheSettings::default()).unwrap());
        let backend = Arc::new(mock);
        let router = Arc::new(
            SynthesisRouter::new(cache, RouterSettings::default())
                .with_backend(Arc::clone(&backend) as Arc<dyn SynthesisBackend>),
        );
        let prep = PlaybackPrep::new(router, Duration::from_secs(60));
        (prep, backend, Arc::new(ContextSlot::new()), dir)
    }

    fn context_key() -> ContextKey {
        ContextKey {
            book: BookId::new("book-1"),
            chapter_index: 0,
            voice: VoiceId::new("en-alice"),
            rate_epoch: 0,
        }
    }

    fn chapter(count: u32) -> Vec<Segment> {
        (0..count)
            .map(|index| Segment { index, text: format!("the text of segment number {index}") })
            .collect()
    }

    #[tokio::test]
    async fn sprint_blocks_on_the_start_segment_only() {
        let (prep, backend, slot, _dir) = harness(MockBackend::new("mock"));
        let ctx = slot.install(context_key());
        let report = prep
            .prepare_for_playback(PrepMode::Sprint, &ctx, &"mock".into(), &chapter(5), 0)
            .await
            .unwrap();
        assert_eq!(report.mode, PrepMode::Sprint);
        assert!(report.errors.is_empty());
        assert_eq!(backend.invocations(), 1);
    }

    #[tokio::test]
    async fn relay_also_fires_the_following_segment() {
        let (prep, backend, slot, _dir) = harness(MockBackend::new("mock"));
        let ctx = slot.install(context_key());
        prep.prepare_for_playback(PrepMode::Relay, &ctx, &"mock".into(), &chapter(5), 0)
            .await
            .unwrap();
        // The relay task is fire-and-forget; wait for it to land.
        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.invocations() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("relay segment was never synthesized");
    }

    #[tokio::test]
    async fn slow_engine_selects_bulk_preparation() {
        let (prep, backend, slot, _dir) = harness(MockBackend::new("mock"));
        let ctx = slot.install(context_key());
        let profile = DeviceEngineProfile::assumed(BackendId::new("mock"), 1.8);
        let mode = PrepMode::plan(&profile);
        assert_eq!(mode, PrepMode::BulkPrepare);

        let report = prep
            .prepare_for_playback(mode, &ctx, &"mock".into(), &chapter(4), 0)
            .await
            .unwrap();
        assert_eq!(report.mode, PrepMode::BulkPrepare);
        // The whole unit was synthesized before playback.
        assert_eq!(backend.invocations(), 4);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn bulk_preparation_collects_failures_without_aborting() {
        let (prep, backend, slot, _dir) = harness(MockBackend::new("mock"));
        let ctx = slot.install(context_key());
        // Segment 0 succeeds; one later segment fails past the retry budget.
        backend.script_next(aloud_synth::MockOutcome::Succeed);
        backend.script_next(aloud_synth::MockOutcome::FailOnce(
            aloud_synth::error::ErrorKind::InferenceFailed("bad luck".into()),
        ));
        backend.script_next(aloud_synth::MockOutcome::FailOnce(
            aloud_synth::error::ErrorKind::InferenceFailed("bad luck again".into()),
        ));

        let report = prep
            .prepare_for_playback(PrepMode::BulkPrepare, &ctx, &"mock".into(), &chapter(3), 0)
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, 1);
    }

    #[tokio::test]
    async fn failing_start_segment_aborts_preparation() {
        let (prep, backend, slot, _dir) = harness(MockBackend::new("mock"));
        let ctx = slot.install(context_key());
        backend.script_next(aloud_synth::MockOutcome::FailOnce(
            aloud_synth::error::ErrorKind::ModelMissing("en-alice".into()),
        ));
        let err = prep
            .prepare_for_playback(PrepMode::Sprint, &ctx, &"mock".into(), &chapter(3), 0)
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::PrepareFailed { index: 0, .. }));
    }

    #[tokio::test]
    async fn missing_start_segment_is_out_of_range() {
        let (prep, _backend, slot, _dir) = harness(MockBackend::new("mock"));
        let ctx = slot.install(context_key());
        let err = prep
            .prepare_for_playback(PrepMode::Sprint, &ctx, &"mock".into(), &chapter(2), 9)
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::SegmentOutOfRange(9)));
    }
}
