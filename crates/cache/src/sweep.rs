//! Background compression sweep.
//!
//! Entries untouched for longer than the hot window are rewritten compressed,
//! trading CPU for cache capacity. The sweep follows the same cooperative
//! discipline as everything else here: candidates are marked, compressed off
//! the async threads, and the result is only committed after re-checking that
//! nobody touched the entry in the meantime.

use crate::compress::Compression;
use crate::entry::CompressionState;
use crate::error::{ErrorKind, Result};
use crate::store::AudioCache;
use aloud_synth::ContentKey;
use exn::ResultExt;
use std::path::PathBuf;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, instrument, warn};

/// What one sweep pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub compressed: usize,
    pub failed: usize,
    /// Candidates abandoned because they were accessed mid-compression, or
    /// where compression wouldn't shrink the file.
    pub skipped: usize,
    pub bytes_saved: u64,
}

impl AudioCache {
    /// Run one compression pass over every cold, raw, unpinned entry.
    #[instrument(skip(self))]
    pub async fn run_sweep_once(&self) -> Result<SweepReport> {
        let now = OffsetDateTime::now_utc();
        let candidates = self.mark_candidates(now).await;
        let mut report = SweepReport::default();
        for (key, artifact) in candidates {
            match self.compress_one(&key, artifact, now).await {
                Ok(Some(saved)) => {
                    report.compressed += 1;
                    report.bytes_saved += saved;
                },
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(error = %err, "compression failed; leaving artifact raw");
                    self.set_state(&key, CompressionState::Failed).await;
                    report.failed += 1;
                },
            }
        }
        Ok(report)
    }

    /// Mark cold raw entries as `Compressing` and return them. Marking under
    /// the write lock means two overlapping sweeps can't pick the same entry.
    async fn mark_candidates(&self, now: OffsetDateTime) -> Vec<(ContentKey, PathBuf)> {
        let hot_secs = self.hot_window.as_secs_f64();
        let mut index = self.index.write().await;
        let pinned: Vec<ContentKey> = index.pins.keys().cloned().collect();
        index
            .entries
            .values_mut()
            .filter(|entry| {
                entry.compression == CompressionState::Raw
                    && entry.idle_hours(now) * 3600.0 >= hot_secs
                    && !pinned.contains(&entry.key)
            })
            .map(|entry| {
                entry.compression = CompressionState::Compressing;
                (entry.key.clone(), entry.artifact.clone())
            })
            .collect()
    }

    /// Compress one artifact in place. Returns bytes saved, or `None` when
    /// the entry was abandoned (touched mid-compression, or incompressible).
    async fn compress_one(&self, key: &ContentKey, artifact: PathBuf, started: OffsetDateTime) -> Result<Option<u64>> {
        let absolute = self.root().join(&artifact);
        let raw = fs::read(&absolute).await.map_err(ErrorKind::Io)?;
        let raw_len = raw.len() as u64;

        let level = self.compression_level;
        let compressed = tokio::task::spawn_blocking(move || Compression::Zstd.compress(&raw, level))
            .await
            .or_raise(|| ErrorKind::Compression(absolute.clone()))??;
        if compressed.len() as u64 >= raw_len {
            self.set_state(key, CompressionState::Raw).await;
            return Ok(None);
        }

        let compressed_name: PathBuf = {
            let mut name = artifact.clone().into_os_string();
            name.push(Compression::Zstd.suffix());
            name.into()
        };
        let partial = self.partial_path(&compressed_name);
        fs::write(&partial, &compressed).await.map_err(ErrorKind::Io)?;

        // Re-check before committing: if the entry was accessed (or evicted)
        // while we were compressing, the raw file is what the player holds.
        let mut index = self.index.write().await;
        let abandoned = match index.entries.get(key) {
            Some(entry) => entry.compression != CompressionState::Compressing || entry.last_accessed_at > started,
            None => true,
        };
        if abandoned {
            drop(index);
            debug!(artifact = %artifact.display(), "entry touched mid-compression; keeping raw");
            let _ = fs::remove_file(&partial).await;
            self.set_state(key, CompressionState::Raw).await;
            return Ok(None);
        }

        fs::rename(&partial, self.root().join(&compressed_name)).await.map_err(ErrorKind::Io)?;
        let _ = fs::remove_file(self.root().join(&artifact)).await;

        let entry = index.entries.get_mut(key).expect("checked above");
        let old_size = entry.size_bytes;
        entry.artifact = compressed_name;
        entry.size_bytes = compressed.len() as u64;
        entry.compression = CompressionState::Compressed;
        index.total_bytes = index.total_bytes.saturating_sub(old_size) + compressed.len() as u64;
        Ok(Some(raw_len - compressed.len() as u64))
    }

    /// Best-effort state flip for an entry that may or may not still exist.
    async fn set_state(&self, key: &ContentKey, state: CompressionState) {
        if let Some(entry) = self.index.write().await.entries.get_mut(key) {
            entry.compression = state;
        }
    }
}
