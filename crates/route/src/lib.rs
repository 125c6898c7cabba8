//! Synthesis routing for the aloud engine.
//!
//! A [`SynthesisRouter`] sits between schedulers and synthesis backends. It
//! answers every request from the audio cache when it can, and otherwise
//! drives exactly one backend invocation per content key no matter how many
//! callers ask concurrently: the first caller leads the synthesis, later
//! callers follow its outcome over a watch channel.
//!
//! Each backend holds a fixed number of permits. When they are exhausted the
//! router fails fast with [`error::ErrorKind::Busy`] rather than queueing,
//! leaving retry policy to the caller. Transient backend failures are retried
//! once; an out-of-memory failure first evicts the least recently used idle
//! voice model.

pub mod error;
mod request;
mod router;

pub use crate::request::{Priority, SynthesisRequest};
pub use crate::router::SynthesisRouter;
