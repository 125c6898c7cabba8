//! Predictive prefetch for long-form narration.
//!
//! This crate keeps synthesized audio ahead of the listener. The
//! [`PrefetchOrchestrator`] is the front door for a playback layer: it
//! profiles the synthesis engine, prepares the start of a chapter with a
//! tier-appropriate [`PrepMode`], then drives a watermark-based
//! [`BufferScheduler`] as playback advances. Edge cases (rate scrubbing,
//! voice changes, memory pressure, auto-tune regressions) are handled by
//! coordinators that emit [`Effect`]s consumed by the orchestrator.
//!
//! Everything is scoped to a [`PrefetchContext`]: the identity of what is
//! currently being listened to. Any change of book, chapter, voice or rate
//! epoch installs a fresh context and cancels the old one, and results
//! produced under a stale context are discarded rather than applied.

mod context;
mod coordinators;
pub mod error;
mod orchestrator;
mod readiness;
mod resource;
mod scheduler;
mod strategy;

pub use crate::context::{ContextKey, ContextSlot, PrefetchContext};
#[cfg(any(test, feature = "mock"))]
pub use crate::coordinators::RecordingSink;
pub use crate::coordinators::{
    AutoTuneGuard, Effect, EffectSink, MemoryPressureCoordinator, PressureLevel,
    RateChangeCoordinator, TuneBaseline, TuneVerdict, VoiceChangeCoordinator,
};
pub use crate::orchestrator::{EffectQueue, PrefetchOrchestrator};
pub use crate::readiness::ReadinessIndex;
#[cfg(any(test, feature = "mock"))]
pub use crate::resource::MockPowerSource;
pub use crate::resource::{Aggressiveness, PowerSource};
pub use crate::scheduler::{BufferScheduler, FetchPassReport, SchedulerState, Segment};
pub use crate::strategy::{PlaybackPrep, PrepMode, PrepReport};
