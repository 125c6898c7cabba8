//! Content-addressed audio cache for the aloud engine.
//!
//! Maps (backend, voice, normalized text) content keys to synthesized audio
//! artifacts on disk. The cache is not the source of truth for its own files:
//! it validates artifacts on every lookup, purges stale entries instead of
//! crashing, and can rebuild its index from a metadata snapshot.
//!
//! # Architecture
//! - **Store** ([`AudioCache`]): flat directory of content-addressed files,
//!   atomic writes, pin-refcounted eviction exemptions.
//! - **Eviction** ([`retention_score`]): five weighted factors (recency,
//!   reading-position proximity, frequency, book progress, voice match);
//!   lowest score evicts first until the byte budget is met.
//! - **Compression sweep**: entries cold for longer than the hot window are
//!   rewritten compressed in the background; lookup decompresses lazily and
//!   transparently.

mod compress;
mod entry;
pub mod error;
mod score;
mod store;
mod sweep;

pub use crate::compress::Compression;
pub use crate::entry::{BookId, CacheEntry, CompressionState, SegmentLocation};
pub use crate::score::{ScoreContext, retention_score};
pub use crate::store::{ArtifactHandle, AudioCache, EvictionReport};
pub use crate::sweep::SweepReport;
