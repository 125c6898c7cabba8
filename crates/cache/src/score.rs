//! Multi-factor eviction scoring.
//!
//! Every unpinned entry gets a retention score in `[0, 1]`; eviction removes
//! the lowest scores first. Five weighted factors:
//!
//! | factor                      | weight | shape                                   |
//! |-----------------------------|--------|-----------------------------------------|
//! | recency                     | 0.30   | exponential decay by idle hours          |
//! | reading-position proximity  | 0.30   | asymmetric decay, ahead beats behind     |
//! | access frequency            | 0.20   | linear, saturating at 10 accesses        |
//! | owning-book progress        | 0.15   | bell curve peaking at 50% progress       |
//! | current-voice match         | 0.05   | binary                                   |
//!
//! The asymmetry in proximity is the point: a segment 30 ahead of the
//! listener is about to be needed, a segment 30 behind almost never is.

use crate::entry::{BookId, CacheEntry, SegmentLocation};
use aloud_synth::VoiceId;
use std::collections::HashMap;
use time::OffsetDateTime;

const WEIGHT_RECENCY: f64 = 0.30;
const WEIGHT_PROXIMITY: f64 = 0.30;
const WEIGHT_FREQUENCY: f64 = 0.20;
const WEIGHT_PROGRESS: f64 = 0.15;
const WEIGHT_VOICE: f64 = 0.05;

/// Recency halves every six idle hours.
const RECENCY_HALF_LIFE_HOURS: f64 = 6.0;
/// Segments ahead of the listener decay over ~20 segments.
const AHEAD_SCALE: f64 = 20.0;
/// Segments behind decay four times faster.
const BEHIND_SCALE: f64 = 5.0;
/// A chapter boundary counts as this many segments of distance.
const CHAPTER_SPAN: f64 = 100.0;
/// Frequency factor saturates here.
const FREQUENCY_CEILING: u32 = 10;

/// Everything scoring needs to know about "now".
#[derive(Clone, Debug, Default)]
pub struct ScoreContext {
    pub now: Option<OffsetDateTime>,
    /// Where the listener currently is, if anything is playing.
    pub position: Option<SegmentLocation>,
    pub current_voice: Option<VoiceId>,
    /// Fractional progress through each book, 0.0 to 1.0.
    pub book_progress: HashMap<BookId, f64>,
}

impl ScoreContext {
    fn now(&self) -> OffsetDateTime {
        self.now.unwrap_or_else(OffsetDateTime::now_utc)
    }
}

/// Composite retention score in `[0, 1]`. Higher scores survive longer.
pub fn retention_score(entry: &CacheEntry, ctx: &ScoreContext) -> f64 {
    WEIGHT_RECENCY * recency_factor(entry, ctx)
        + WEIGHT_PROXIMITY * proximity_factor(entry, ctx)
        + WEIGHT_FREQUENCY * frequency_factor(entry)
        + WEIGHT_PROGRESS * progress_factor(entry, ctx)
        + WEIGHT_VOICE * voice_factor(entry, ctx)
}

fn recency_factor(entry: &CacheEntry, ctx: &ScoreContext) -> f64 {
    let hours = entry.idle_hours(ctx.now());
    (-hours * std::f64::consts::LN_2 / RECENCY_HALF_LIFE_HOURS).exp()
}

fn proximity_factor(entry: &CacheEntry, ctx: &ScoreContext) -> f64 {
    let Some(position) = &ctx.position else {
        // Nothing playing: no entry is closer than any other.
        return 0.5;
    };
    if entry.location.book != position.book {
        return 0.0;
    }
    let chapter_delta = f64::from(entry.location.chapter_index) - f64::from(position.chapter_index);
    let segment_delta = f64::from(entry.location.segment_index) - f64::from(position.segment_index);
    let distance = chapter_delta * CHAPTER_SPAN + segment_delta;
    if distance >= 0.0 { (-distance / AHEAD_SCALE).exp() } else { (distance / BEHIND_SCALE).exp() }
}

fn frequency_factor(entry: &CacheEntry) -> f64 {
    f64::from(entry.access_count.min(FREQUENCY_CEILING)) / f64::from(FREQUENCY_CEILING)
}

fn progress_factor(entry: &CacheEntry, ctx: &ScoreContext) -> f64 {
    let Some(progress) = ctx.book_progress.get(&entry.location.book) else {
        return 0.5;
    };
    let progress = progress.clamp(0.0, 1.0);
    // Parabolic bell: 1.0 at mid-book, 0.0 at either cover. Mid-progress
    // books are the ones actually being listened to.
    1.0 - (2.0 * progress - 1.0).powi(2)
}

fn voice_factor(entry: &CacheEntry, ctx: &ScoreContext) -> f64 {
    match &ctx.current_voice {
        Some(voice) => {
            if &entry.key.voice == voice {
                1.0
            } else {
                0.0
            }
        },
        None => 0.5,
    }
}
