//! Content-addressed artifact store.
//!
//! Artifacts live as flat files under one root directory, named by the
//! BLAKE3 digest of their [`ContentKey`] — two equal-content requests
//! collide deterministically onto the same file. Writes go to a `.part`
//! sibling first and are renamed into place, so readers never observe a
//! partial artifact. Entry metadata lives in an in-memory index behind an
//! async `RwLock`; writes take the exclusive lock, `contains` only reads.

use crate::compress::Compression;
use crate::entry::{CacheEntry, CompressionState, SegmentLocation};
use crate::error::{ErrorKind, Result};
use crate::score::{ScoreContext, retention_score};
use aloud_config::CacheSettings;
use aloud_synth::ContentKey;
use exn::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Suffix for in-progress writes. Leftovers from a crash are swept away the
/// next time the cache is opened.
const PARTIAL_SUFFIX: &str = "part";

/// A playable artifact returned by the cache. The path stays valid while the
/// entry remains in the cache; pin it for the duration of playback.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    pub key: ContentKey,
    /// Absolute path to a raw WAV file.
    pub path: PathBuf,
    pub audio_duration: Duration,
    pub size_bytes: u64,
}

/// What [`AudioCache::evict_if_over_budget`] did.
#[derive(Debug, Default)]
pub struct EvictionReport {
    pub evicted: Vec<ContentKey>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
    /// Entries that would have been evicted but were pinned.
    pub skipped_pinned: usize,
}

pub(crate) struct CacheIndex {
    pub(crate) entries: HashMap<ContentKey, CacheEntry>,
    pub(crate) pins: HashMap<ContentKey, usize>,
    pub(crate) total_bytes: u64,
}

impl CacheIndex {
    fn remove(&mut self, key: &ContentKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    pub(crate) fn is_pinned(&self, key: &ContentKey) -> bool {
        self.pins.get(key).is_some_and(|count| *count > 0)
    }
}

/// Content-addressed store for synthesized audio.
pub struct AudioCache {
    root: PathBuf,
    quota_bytes: u64,
    min_artifact_bytes: u64,
    pub(crate) hot_window: Duration,
    pub(crate) compression_level: i32,
    pub(crate) index: RwLock<CacheIndex>,
}

impl AudioCache {
    /// Open (or create) a cache rooted at `root`.
    ///
    /// Removes stale `.part` files left behind by an interrupted write.
    pub fn open(root: impl AsRef<Path>, settings: &CacheSettings) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidRoot(root));
            }
        } else {
            // Non-async on purpose; this happens once at startup and isn't
            // worth an async constructor.
            sync_create_dir(&root).or_raise(|| ErrorKind::InvalidRoot(root.clone()))?;
        }
        for dir_entry in std::fs::read_dir(&root).map_err(ErrorKind::Io)? {
            let path = dir_entry.map_err(ErrorKind::Io)?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(PARTIAL_SUFFIX) {
                warn!(path = %path.display(), "removing stale partial artifact");
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(Self {
            root,
            quota_bytes: settings.effective_quota(),
            min_artifact_bytes: settings.min_artifact_bytes,
            hot_window: settings.hot_window(),
            compression_level: settings.compression_level,
            index: RwLock::new(CacheIndex { entries: HashMap::new(), pins: HashMap::new(), total_bytes: 0 }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub async fn total_bytes(&self) -> u64 {
        self.index.read().await.total_bytes
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.entries.is_empty()
    }

    /// Metadata-only hit check for the prefetch walk: no disk access, no
    /// access-count bump.
    pub async fn contains(&self, key: &ContentKey) -> bool {
        self.index.read().await.entries.contains_key(key)
    }

    /// Store an artifact under its content key, atomically.
    ///
    /// Storing an existing key replaces the previous artifact (including a
    /// compressed variant left by the sweep).
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn store(
        &self,
        key: ContentKey,
        bytes: &[u8],
        location: SegmentLocation,
        audio_duration: Duration,
    ) -> Result<CacheEntry> {
        let artifact = PathBuf::from(key.artifact_name());
        let target = self.root.join(&artifact);
        let partial = self.partial_path(&artifact);

        fs::write(&partial, bytes).await.map_err(ErrorKind::Io)?;
        fs::rename(&partial, &target).await.map_err(ErrorKind::Io)?;

        let now = OffsetDateTime::now_utc();
        let entry = CacheEntry {
            key: key.clone(),
            artifact: artifact.clone(),
            size_bytes: bytes.len() as u64,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            location,
            audio_duration_ms: u64::try_from(audio_duration.as_millis()).unwrap_or(u64::MAX),
            compression: CompressionState::Raw,
        };

        let mut index = self.index.write().await;
        if let Some(old) = index.remove(&key) {
            // A replaced entry may point at a compressed variant with a
            // different filename; don't leave it orphaned on disk.
            if old.artifact != artifact {
                let _ = fs::remove_file(self.root.join(&old.artifact)).await;
            }
        }
        index.total_bytes += entry.size_bytes;
        index.entries.insert(key, entry.clone());
        debug!(total = index.total_bytes, "stored artifact");
        Ok(entry)
    }

    /// Look up an artifact, validating it still exists on disk and is at
    /// least one WAV header long. Invalid entries are purged and reported as
    /// a miss rather than handed to the player. Compressed entries are
    /// transparently decompressed back to raw and re-enter the hot window.
    #[instrument(skip(self, key))]
    pub async fn lookup(&self, key: &ContentKey) -> Result<Option<ArtifactHandle>> {
        let mut index = self.index.write().await;
        let Some(entry) = index.entries.get(key) else {
            return Ok(None);
        };
        let compression = entry.compression;
        let artifact = entry.artifact.clone();
        let absolute = self.root.join(&artifact);

        let valid = match fs::metadata(&absolute).await {
            Ok(meta) if compression == CompressionState::Compressed => meta.len() > 0,
            Ok(meta) => meta.len() >= self.min_artifact_bytes,
            Err(_) => false,
        };
        if !valid {
            warn!(artifact = %artifact.display(), "purging stale cache entry");
            index.remove(key);
            drop(index);
            let _ = fs::remove_file(&absolute).await;
            return Ok(None);
        }

        if compression == CompressionState::Compressed {
            self.rehydrate(&mut index, key, &artifact).await?;
        }

        let now = OffsetDateTime::now_utc();
        let entry = index.entries.get_mut(key).ok_or_raise(|| ErrorKind::InvalidData)?;
        entry.touch(now);
        Ok(Some(ArtifactHandle {
            key: key.clone(),
            path: self.root.join(&entry.artifact),
            audio_duration: entry.audio_duration(),
            size_bytes: entry.size_bytes,
        }))
    }

    /// Decompress a swept artifact back to raw WAV, atomically, updating the
    /// entry in place. Called with the index write lock held.
    async fn rehydrate(&self, index: &mut CacheIndex, key: &ContentKey, artifact: &Path) -> Result<()> {
        let absolute = self.root.join(artifact);
        let format = Compression::from_path(artifact);
        let compressed = fs::read(&absolute).await.map_err(ErrorKind::Io)?;
        let raw = tokio::task::spawn_blocking(move || format.decompress(&compressed))
            .await
            .or_raise(|| ErrorKind::Compression(absolute.clone()))?
            .or_raise(|| ErrorKind::Compression(absolute.clone()))?;

        let raw_name = PathBuf::from(key.artifact_name());
        let partial = self.partial_path(&raw_name);
        fs::write(&partial, &raw).await.map_err(ErrorKind::Io)?;
        fs::rename(&partial, self.root.join(&raw_name)).await.map_err(ErrorKind::Io)?;
        let _ = fs::remove_file(&absolute).await;

        let entry = index.entries.get_mut(key).ok_or_raise(|| ErrorKind::InvalidData)?;
        index.total_bytes = index.total_bytes.saturating_sub(entry.size_bytes) + raw.len() as u64;
        entry.artifact = raw_name;
        entry.size_bytes = raw.len() as u64;
        entry.compression = CompressionState::Raw;
        debug!(key = %entry.artifact.display(), "rehydrated compressed artifact");
        Ok(())
    }

    /// Exempt an entry from eviction while an artifact is in use. Refcounted;
    /// returns `false` when the key isn't cached.
    pub async fn pin(&self, key: &ContentKey) -> bool {
        let mut index = self.index.write().await;
        if !index.entries.contains_key(key) {
            return false;
        }
        *index.pins.entry(key.clone()).or_insert(0) += 1;
        true
    }

    /// Release one pin. The entry becomes evictable again when the count
    /// reaches zero.
    pub async fn unpin(&self, key: &ContentKey) {
        let mut index = self.index.write().await;
        if let Some(count) = index.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                index.pins.remove(key);
            }
        }
    }

    /// Evict lowest-retention-score entries until total size fits the quota.
    /// Pinned entries are never evicted, even if that leaves the cache over
    /// budget.
    pub async fn evict_if_over_budget(&self, ctx: &ScoreContext) -> Result<EvictionReport> {
        self.evict_to_target(self.quota_bytes, ctx).await
    }

    /// Emergency eviction down to an arbitrary target (memory pressure, low
    /// storage). Same scoring and pinning rules as the quota path.
    #[instrument(skip(self, ctx))]
    pub async fn evict_to_target(&self, target_bytes: u64, ctx: &ScoreContext) -> Result<EvictionReport> {
        let mut index = self.index.write().await;
        let mut report = EvictionReport::default();
        if index.total_bytes <= target_bytes {
            report.remaining_bytes = index.total_bytes;
            return Ok(report);
        }

        let mut scored: Vec<(ContentKey, f64)> = index
            .entries
            .values()
            .filter(|entry| !index.is_pinned(&entry.key))
            .map(|entry| (entry.key.clone(), retention_score(entry, ctx)))
            .collect();
        report.skipped_pinned = index.entries.len() - scored.len();
        // Lowest score evicts first. Scores are finite, NaN aside.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        for (key, score) in scored {
            if index.total_bytes <= target_bytes {
                break;
            }
            if let Some(entry) = index.remove(&key) {
                report.freed_bytes += entry.size_bytes;
                let _ = fs::remove_file(self.root.join(&entry.artifact)).await;
                debug!(artifact = %entry.artifact.display(), score, "evicted");
                report.evicted.push(key);
            }
        }
        if index.total_bytes > target_bytes {
            warn!(
                total = index.total_bytes,
                target = target_bytes,
                pinned = report.skipped_pinned,
                "cache still over target; remaining entries are pinned"
            );
        }
        report.remaining_bytes = index.total_bytes;
        Ok(report)
    }

    /// Serializable copy of all entry metadata, for the host's persistence
    /// layer.
    pub async fn snapshot(&self) -> Vec<CacheEntry> {
        self.index.read().await.entries.values().cloned().collect()
    }

    /// Rebuild the index from persisted metadata. Records whose artifacts
    /// have vanished (or shrunk below validity) are dropped silently — the
    /// cache is not the source of truth for its own files.
    pub async fn restore(&self, entries: Vec<CacheEntry>) -> Result<usize> {
        let mut index = self.index.write().await;
        let mut restored = 0;
        for entry in entries {
            let absolute = self.root.join(&entry.artifact);
            let min = if entry.compression == CompressionState::Compressed { 1 } else { self.min_artifact_bytes };
            match fs::metadata(&absolute).await {
                Ok(meta) if meta.len() >= min => {
                    index.total_bytes += entry.size_bytes;
                    index.entries.insert(entry.key.clone(), entry);
                    restored += 1;
                },
                _ => debug!(artifact = %entry.artifact.display(), "dropping stale metadata on restore"),
            }
        }
        Ok(restored)
    }

    pub(crate) fn partial_path(&self, artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_os_string();
        name.push(".");
        name.push(PARTIAL_SUFFIX);
        self.root.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BookId;

    fn settings() -> CacheSettings {
        CacheSettings { quota_bytes: Some(10_000), ..CacheSettings::default() }
    }

    fn key(text: &str) -> ContentKey {
        ContentKey::new("piper".into(), "en-alice".into(), text)
    }

    fn location(segment: u32) -> SegmentLocation {
        SegmentLocation { book: BookId::new("book-1"), chapter_index: 0, segment_index: segment }
    }

    fn wav(len: usize) -> Vec<u8> {
        let mut bytes = b"RIFF....WAVEfmt ....data....".to_vec();
        bytes.resize(len.max(44), 7);
        bytes
    }

    #[tokio::test]
    async fn store_then_lookup_returns_valid_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), &settings()).unwrap();
        let bytes = wav(1000);
        cache.store(key("hello"), &bytes, location(0), Duration::from_secs(2)).await.unwrap();

        let handle = cache.lookup(&key("hello")).await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&handle.path).await.unwrap(), bytes);
        assert_eq!(handle.audio_duration, Duration::from_secs(2));
        assert_eq!(cache.total_bytes().await, 1000);
    }

    #[tokio::test]
    async fn lookup_after_external_deletion_is_a_miss_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), &settings()).unwrap();
        let entry = cache.store(key("gone"), &wav(500), location(0), Duration::from_secs(1)).await.unwrap();

        tokio::fs::remove_file(dir.path().join(&entry.artifact)).await.unwrap();
        assert!(cache.lookup(&key("gone")).await.unwrap().is_none());
        // The stale entry was purged entirely.
        assert!(!cache.contains(&key("gone")).await);
        assert_eq!(cache.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn undersized_artifact_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), &settings()).unwrap();
        let entry = cache.store(key("tiny"), &wav(100), location(0), Duration::from_secs(1)).await.unwrap();
        // Truncate below one WAV header behind the cache's back.
        tokio::fs::write(dir.path().join(&entry.artifact), b"RIFF").await.unwrap();
        assert!(cache.lookup(&key("tiny")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storing_same_key_twice_replaces_not_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), &settings()).unwrap();
        cache.store(key("dup"), &wav(100), location(0), Duration::from_secs(1)).await.unwrap();
        cache.store(key("dup"), &wav(200), location(0), Duration::from_secs(1)).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.total_bytes().await, 200);
    }

    #[tokio::test]
    async fn rate_independence_same_key_same_artifact() {
        // Playback rate is not part of the key: requests at 1.0x and 1.5x
        // build identical ContentKeys and land on the same artifact.
        let a = key("rate independent text");
        let b = key("rate independent text");
        assert_eq!(a, b);
        assert_eq!(a.artifact_name(), b.artifact_name());
    }

    #[tokio::test]
    async fn eviction_respects_quota_and_pins() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings();
        cfg.quota_bytes = Some(100);
        let cache = AudioCache::open(dir.path(), &cfg).unwrap();

        // Five header-sized entries, oldest to newest: 5 * 44 = 220 > 100.
        for i in 0..5u32 {
            cache.store(key(&format!("seg {i}")), &wav(44), location(i), Duration::from_secs(1)).await.unwrap();
        }
        assert!(cache.total_bytes().await > 100);
        assert!(cache.pin(&key("seg 4")).await);

        let report = cache.evict_if_over_budget(&ScoreContext::default()).await.unwrap();
        assert!(cache.total_bytes().await <= 100);
        assert!(!report.evicted.contains(&key("seg 4")), "pinned entry was evicted");
        assert!(cache.contains(&key("seg 4")).await);
        // Evicted files are gone from disk too.
        for evicted in &report.evicted {
            assert!(!dir.path().join(evicted.artifact_name()).exists());
        }
    }

    #[tokio::test]
    async fn pinned_entries_survive_even_impossible_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings();
        cfg.quota_bytes = Some(10);
        let cache = AudioCache::open(dir.path(), &cfg).unwrap();
        cache.store(key("pinned"), &wav(100), location(0), Duration::from_secs(1)).await.unwrap();
        cache.pin(&key("pinned")).await;

        let report = cache.evict_if_over_budget(&ScoreContext::default()).await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.skipped_pinned, 1);
        assert!(cache.contains(&key("pinned")).await);
    }

    #[tokio::test]
    async fn unpin_makes_entry_evictable_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings();
        cfg.quota_bytes = Some(10);
        let cache = AudioCache::open(dir.path(), &cfg).unwrap();
        cache.store(key("later"), &wav(100), location(0), Duration::from_secs(1)).await.unwrap();
        cache.pin(&key("later")).await;
        cache.pin(&key("later")).await;
        cache.unpin(&key("later")).await;
        // Still pinned once.
        let report = cache.evict_if_over_budget(&ScoreContext::default()).await.unwrap();
        assert!(report.evicted.is_empty());
        cache.unpin(&key("later")).await;
        let report = cache.evict_if_over_budget(&ScoreContext::default()).await.unwrap();
        assert_eq!(report.evicted.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip_drops_vanished_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), &settings()).unwrap();
        cache.store(key("keep"), &wav(100), location(0), Duration::from_secs(1)).await.unwrap();
        let doomed = cache.store(key("vanish"), &wav(100), location(1), Duration::from_secs(1)).await.unwrap();
        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        tokio::fs::remove_file(dir.path().join(&doomed.artifact)).await.unwrap();
        let fresh = AudioCache::open(dir.path(), &settings()).unwrap();
        let restored = fresh.restore(snapshot).await.unwrap();
        assert_eq!(restored, 1);
        assert!(fresh.contains(&key("keep")).await);
        assert!(!fresh.contains(&key("vanish")).await);
    }

    #[tokio::test]
    async fn open_sweeps_stale_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deadbeef.wav.part"), b"half-written").unwrap();
        let _cache = AudioCache::open(dir.path(), &settings()).unwrap();
        assert!(!dir.path().join("deadbeef.wav.part").exists());
    }
}
