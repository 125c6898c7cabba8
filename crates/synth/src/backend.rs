//! Synthesis backend trait and test double.
//!
//! Backends are opaque neural engines: text in, PCM out. The engine treats
//! them uniformly through [`SynthesisBackend`]; everything above this seam
//! (routing, caching, prefetch) never sees an engine-specific type.

use crate::error::Result;
use crate::key::VoiceId;
use async_trait::async_trait;
use std::time::Duration;

/// One completed synthesis: artifact bytes plus the duration of the audio
/// they decode to.
#[derive(Debug, Clone)]
pub struct SynthOutput {
    /// Complete WAV file contents.
    pub samples: Vec<u8>,
    /// Duration of the produced audio.
    pub audio_duration: Duration,
}

/// Whether a voice can synthesize right now, and if not, what's missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceStatus {
    /// Model loaded; synthesis calls will be served.
    Ready,
    /// Model files are not on disk.
    NeedsDownload { hint: String },
    /// Model files exist but are not loaded into memory.
    NeedsLoad { hint: String },
}

/// Unified interface over speech-synthesis engines.
///
/// Implementations must be safe to call concurrently; the router bounds how
/// many calls are actually in flight per backend. `synthesize` may take
/// arbitrarily long — the caller attaches its own timeout.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Stable identifier, used for routing and as part of content keys.
    fn id(&self) -> &str;

    /// Synthesize `text` with `voice` at rate 1.0.
    async fn synthesize(&self, voice: &VoiceId, text: &str) -> Result<SynthOutput>;

    /// Report whether `voice` is ready to synthesize.
    async fn voice_status(&self, voice: &VoiceId) -> Result<VoiceStatus>;

    /// Voices currently loaded into memory, least recently used first.
    /// Candidates for eviction when the engine reports out-of-memory.
    fn loaded_voices(&self) -> Vec<VoiceId>;

    /// Unload a voice model from memory. A no-op if it wasn't loaded.
    async fn unload_voice(&self, voice: &VoiceId) -> Result<()>;
}

#[cfg(any(test, feature = "mock"))]
pub use self::mock::{MockBackend, MockOutcome};

#[cfg(any(test, feature = "mock"))]
mod mock {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted outcome for one `synthesize` call on the mock.
    #[derive(Debug)]
    pub enum MockOutcome {
        Succeed,
        FailOnce(ErrorKind),
    }

    /// In-memory synthesis backend for testing.
    ///
    /// Produces deterministic fake WAV bytes sized proportionally to the
    /// input text and records every invocation, so tests can assert on
    /// at-most-once synthesis guarantees. Outcomes can be scripted per call
    /// and a fixed latency can be injected to widen race windows.
    pub struct MockBackend {
        id: String,
        latency: Duration,
        /// Wall-clock seconds spent per second of produced audio.
        real_time_factor: f64,
        /// Seconds of audio produced per input character.
        seconds_per_char: f64,
        invocations: AtomicUsize,
        script: Mutex<VecDeque<MockOutcome>>,
        loaded: Mutex<Vec<VoiceId>>,
    }

    impl MockBackend {
        pub fn new(id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                latency: Duration::ZERO,
                real_time_factor: 0.0,
                seconds_per_char: 1.0 / 15.0,
                invocations: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                loaded: Mutex::new(Vec::new()),
            }
        }

        /// Inject a fixed delay before each synthesis completes.
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Simulate an engine slower or faster than real time. A factor of
        /// 2.0 spends two seconds of wall clock per second of audio.
        pub fn with_real_time_factor(mut self, factor: f64) -> Self {
            self.real_time_factor = factor;
            self
        }

        /// Queue an outcome for the next unscripted call. Calls beyond the
        /// script succeed.
        pub fn script_next(&self, outcome: MockOutcome) {
            self.script.lock().unwrap().push_back(outcome);
        }

        /// How many times `synthesize` actually ran.
        pub fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }

        fn mark_loaded(&self, voice: &VoiceId) {
            let mut loaded = self.loaded.lock().unwrap();
            loaded.retain(|v| v != voice);
            loaded.push(voice.clone());
        }
    }

    #[async_trait]
    impl SynthesisBackend for MockBackend {
        fn id(&self) -> &str {
            &self.id
        }

        async fn synthesize(&self, voice: &VoiceId, text: &str) -> Result<SynthOutput> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let audio_duration = Duration::from_secs_f64(text.chars().count() as f64 * self.seconds_per_char);
            let work = self.latency + audio_duration.mul_f64(self.real_time_factor);
            if !work.is_zero() {
                tokio::time::sleep(work).await;
            }
            if let Some(MockOutcome::FailOnce(kind)) = self.script.lock().unwrap().pop_front() {
                return Err(exn::Exn::from(kind));
            }
            self.mark_loaded(voice);
            // A WAV header plus recognizable payload; size scales with text.
            let mut samples = b"RIFFWAVEfmt mock                            ".to_vec();
            samples.extend(text.as_bytes().iter().cycle().take(text.len() * 32));
            Ok(SynthOutput { samples, audio_duration })
        }

        async fn voice_status(&self, voice: &VoiceId) -> Result<VoiceStatus> {
            if self.loaded.lock().unwrap().contains(voice) {
                Ok(VoiceStatus::Ready)
            } else {
                Ok(VoiceStatus::NeedsLoad { hint: format!("voice {voice} loads on first use") })
            }
        }

        fn loaded_voices(&self) -> Vec<VoiceId> {
            self.loaded.lock().unwrap().clone()
        }

        async fn unload_voice(&self, voice: &VoiceId) -> Result<()> {
            self.loaded.lock().unwrap().retain(|v| v != voice);
            Ok(())
        }
    }
}
