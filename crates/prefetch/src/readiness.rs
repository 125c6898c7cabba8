//! Segment readiness index.
//!
//! Answers "does this reading position have audio ready?" per (book,
//! chapter). Deliberately keyed *without* the voice, unlike the cache: the
//! reading UI asks about positions, not voices. The two can therefore
//! diverge, so every voice change must invalidate this index and re-derive
//! it from the cache under the new voice.

use aloud_cache::{AudioCache, BookId};
use aloud_synth::VoiceId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ReadinessIndex {
    ready: Mutex<HashMap<(BookId, u32), BTreeSet<u32>>>,
}

impl ReadinessIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self, book: &BookId, chapter_index: u32, segment_index: u32) {
        let mut ready = self.ready.lock().expect("readiness index poisoned");
        ready.entry((book.clone(), chapter_index)).or_default().insert(segment_index);
    }

    pub fn is_ready(&self, book: &BookId, chapter_index: u32, segment_index: u32) -> bool {
        let ready = self.ready.lock().expect("readiness index poisoned");
        ready
            .get(&(book.clone(), chapter_index))
            .is_some_and(|segments| segments.contains(&segment_index))
    }

    /// Count of ready segments in one chapter.
    pub fn ready_count(&self, book: &BookId, chapter_index: u32) -> usize {
        let ready = self.ready.lock().expect("readiness index poisoned");
        ready.get(&(book.clone(), chapter_index)).map_or(0, BTreeSet::len)
    }

    /// Drop everything. Callers must re-derive before trusting the index
    /// again; see [`ReadinessIndex::rebuild_from_cache`].
    pub fn invalidate(&self) {
        self.ready.lock().expect("readiness index poisoned").clear();
    }

    /// Re-derive readiness from the cache, counting only artifacts
    /// synthesized under `voice`. Replaces the whole index.
    pub async fn rebuild_from_cache(&self, cache: &AudioCache, voice: &VoiceId) {
        let mut fresh: HashMap<(BookId, u32), BTreeSet<u32>> = HashMap::new();
        let mut kept = 0usize;
        for entry in cache.snapshot().await {
            if entry.key.voice != *voice {
                continue;
            }
            kept += 1;
            fresh
                .entry((entry.location.book.clone(), entry.location.chapter_index))
                .or_default()
                .insert(entry.location.segment_index);
        }
        debug!(voice = %voice, segments = kept, "readiness index rebuilt from cache");
        *self.ready.lock().expect("readiness index poisoned") = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aloud_config::CacheSettings;
    use aloud_synth::ContentKey;
    use aloud_cache::SegmentLocation;

    #[test]
    fn marks_and_queries_per_chapter() {
        let index = ReadinessIndex::new();
        let book = BookId::new("book-1");
        index.mark_ready(&book, 0, 3);
        assert!(index.is_ready(&book, 0, 3));
        assert!(!index.is_ready(&book, 0, 4));
        assert!(!index.is_ready(&book, 1, 3));
        assert_eq!(index.ready_count(&book, 0), 1);
    }

    #[tokio::test]
    async fn voice_change_rebuild_reflects_only_the_new_voice() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), &CacheSettings::default()).unwrap();
        let book = BookId::new("book-1");
        let wav = vec![0u8; 44];

        let at = |segment| SegmentLocation {
            book: book.clone(),
            chapter_index: 0,
            segment_index: segment,
        };
        let alice = ContentKey::new("piper".into(), "en-alice".into(), "segment zero");
        let bob = ContentKey::new("piper".into(), "en-bob".into(), "segment one");
        cache.store(alice, &wav, at(0), std::time::Duration::from_secs(2)).await.unwrap();
        cache.store(bob, &wav, at(1), std::time::Duration::from_secs(2)).await.unwrap();

        let index = ReadinessIndex::new();
        index.mark_ready(&book, 0, 0);
        index.mark_ready(&book, 0, 1);

        index.invalidate();
        index.rebuild_from_cache(&cache, &VoiceId::new("en-bob")).await;
        assert!(!index.is_ready(&book, 0, 0), "old voice's segment survived the rebuild");
        assert!(index.is_ready(&book, 0, 1));
    }
}
