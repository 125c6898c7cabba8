//! Synthesis request envelope.

use aloud_cache::SegmentLocation;
use aloud_synth::ContentKey;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// How urgently a request must be served. Variant order matters: earlier
/// variants compare smaller, so `Immediate < Low` — sort ascending to pop
/// the most urgent first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// The listener is waiting on this artifact right now.
    Immediate,
    /// The next segment after the one playing.
    High,
    /// Ordinary background prefetch.
    Medium,
    /// Opportunistic warm-up.
    Low,
}

/// One attempt to obtain an artifact. Owned by its submitter until resolved,
/// timed out or cancelled; a retry is a *new* request.
#[derive(Clone, Debug)]
pub struct SynthesisRequest {
    pub operation_id: u64,
    pub key: ContentKey,
    pub location: SegmentLocation,
    pub priority: Priority,
    /// Why this request exists, for log correlation.
    pub reason: &'static str,
    pub created_at: OffsetDateTime,
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

impl SynthesisRequest {
    pub fn new(
        key: ContentKey,
        location: SegmentLocation,
        priority: Priority,
        reason: &'static str,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            operation_id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            location,
            priority,
            reason,
            created_at: OffsetDateTime::now_utc(),
            cancel,
            timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aloud_cache::BookId;

    #[test]
    fn priorities_sort_most_urgent_first() {
        let mut priorities = vec![Priority::Low, Priority::Immediate, Priority::Medium, Priority::High];
        priorities.sort();
        assert_eq!(priorities, vec![Priority::Immediate, Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn operation_ids_are_unique() {
        let location = SegmentLocation { book: BookId::new("b"), chapter_index: 0, segment_index: 0 };
        let key = ContentKey::new("piper".into(), "en-alice".into(), "text");
        let a = SynthesisRequest::new(
            key.clone(),
            location.clone(),
            Priority::Medium,
            "test",
            CancellationToken::new(),
            Duration::from_secs(60),
        );
        let b =
            SynthesisRequest::new(key, location, Priority::Medium, "test", CancellationToken::new(), Duration::from_secs(60));
        assert_ne!(a.operation_id, b.operation_id);
    }
}
