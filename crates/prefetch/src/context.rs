//! Prefetch context identity and cooperative cancellation.
//!
//! A [`PrefetchContext`] names "what is currently being listened to". Any
//! change of book, chapter, voice or rate epoch installs a fresh context and
//! cancels the old one; results produced under a stale context are discarded,
//! never applied. The rate participates only as an epoch: changing playback
//! rate re-keys the context (in-flight work is stale) without re-keying the
//! cache, since synthesis happens at a fixed rate.

use aloud_cache::BookId;
use aloud_synth::VoiceId;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Identity of one listening session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextKey {
    pub book: BookId,
    pub chapter_index: u32,
    pub voice: VoiceId,
    /// Bumped on every playback-rate change. Not part of any cache key.
    pub rate_epoch: u64,
}

/// The live prefetch state for one [`ContextKey`].
///
/// `prefetched_through` is the highest segment index known to have audio
/// ready, `-1` meaning none. It only ever moves forward, and only while this
/// context is still the live one (see [`ContextSlot::advance`]).
#[derive(Debug)]
pub struct PrefetchContext {
    pub key: ContextKey,
    prefetched_through: Mutex<i64>,
    pub cancel: CancellationToken,
}

impl PrefetchContext {
    fn new(key: ContextKey) -> Self {
        Self { key, prefetched_through: Mutex::new(-1), cancel: CancellationToken::new() }
    }

    pub fn prefetched_through(&self) -> i64 {
        *self.prefetched_through.lock().expect("prefetch index poisoned")
    }
}

/// Holder of the live context.
///
/// Installation replaces the `Arc` wholesale and cancels the previous token;
/// the old context is never mutated, so stale holders observe cancellation
/// rather than racing on shared fields. The slot's lock is the single
/// critical section ordering immediate-next and background index commits.
#[derive(Debug, Default)]
pub struct ContextSlot {
    live: Mutex<Option<Arc<PrefetchContext>>>,
}

impl ContextSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh context for `key`, cancelling whatever was live.
    pub fn install(&self, key: ContextKey) -> Arc<PrefetchContext> {
        let fresh = Arc::new(PrefetchContext::new(key));
        let mut live = self.live.lock().expect("context slot poisoned");
        if let Some(old) = live.replace(Arc::clone(&fresh)) {
            old.cancel.cancel();
        }
        fresh
    }

    /// Cancel and drop the live context, if any.
    pub fn clear(&self) {
        let mut live = self.live.lock().expect("context slot poisoned");
        if let Some(old) = live.take() {
            old.cancel.cancel();
        }
    }

    pub fn live(&self) -> Option<Arc<PrefetchContext>> {
        self.live.lock().expect("context slot poisoned").clone()
    }

    /// Commit `index` as prefetched, but only if `ctx` is still the live
    /// context. Returns `false` when the result is stale and must be
    /// discarded. Commits are monotonic: an index at or below the current
    /// one is a no-op (still `true` — the work was not wasted, just late).
    pub fn advance(&self, ctx: &Arc<PrefetchContext>, index: i64) -> bool {
        let live = self.live.lock().expect("context slot poisoned");
        match live.as_ref() {
            Some(current) if Arc::ptr_eq(current, ctx) => {
                let mut through =
                    ctx.prefetched_through.lock().expect("prefetch index poisoned");
                if index > *through {
                    *through = index;
                }
                true
            }
            _ => false,
        }
    }
}
