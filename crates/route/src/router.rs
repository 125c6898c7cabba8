//! Request routing across synthesis backends.
//!
//! The router is the only component that talks to backends. It enforces the
//! engine's hardest guarantee: **at most one synthesis per content key**, no
//! matter how many callers race. The first caller for a key becomes the
//! *leader* and synthesizes; everyone else becomes a *follower* on the
//! leader's flight and receives the same artifact (or the same error) once
//! the leader finishes.
//!
//! Per-backend concurrency is a fixed permit count; when permits run out the
//! router fails fast with a retryable [`Busy`](ErrorKind::Busy) instead of
//! queueing unboundedly.

use crate::error::{ErrorKind, Result};
use crate::request::SynthesisRequest;
use aloud_config::RouterSettings;
use aloud_cache::{ArtifactHandle, AudioCache};
use aloud_synth::error::ErrorKind as BackendErrorKind;
use aloud_synth::{BackendId, ContentKey, DeviceEngineProfile, SynthOutput, SynthesisBackend, VoiceId, VoiceStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, instrument, warn};

/// Progress of one in-flight synthesis, broadcast to followers.
#[derive(Clone, Debug)]
enum Flight {
    Pending,
    /// `None` means the artifact landed in the cache; `Some` carries the
    /// leader's error for every follower to re-raise.
    Done(Option<ErrorKind>),
}

type FlightTable = Mutex<HashMap<ContentKey, watch::Receiver<Flight>>>;

struct BackendSlot {
    backend: Arc<dyn SynthesisBackend>,
    permits: Arc<Semaphore>,
}

/// Routes content keys to backends, deduplicating concurrent requests and
/// bounding per-backend concurrency.
pub struct SynthesisRouter {
    cache: Arc<AudioCache>,
    settings: RouterSettings,
    backends: HashMap<BackendId, BackendSlot>,
    inflight: Arc<FlightTable>,
}

impl SynthesisRouter {
    pub fn new(cache: Arc<AudioCache>, settings: RouterSettings) -> Self {
        Self { cache, settings, backends: HashMap::new(), inflight: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Register a backend under its own id. Each backend gets its own permit
    /// pool.
    pub fn with_backend(mut self, backend: Arc<dyn SynthesisBackend>) -> Self {
        let id = BackendId::new(backend.id());
        let permits = Arc::new(Semaphore::new(self.settings.permits_per_backend));
        self.backends.insert(id, BackendSlot { backend, permits });
        self
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    /// Obtain the artifact for a request: cached, joined onto an in-flight
    /// synthesis, or freshly produced.
    #[instrument(skip(self, request), fields(op = request.operation_id, reason = request.reason))]
    pub async fn synthesize(&self, request: &SynthesisRequest) -> Result<ArtifactHandle> {
        if request.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        // Cache first; a hit never touches a backend.
        if let Some(handle) = self.cache_lookup(&request.key).await? {
            return Ok(handle);
        }

        let (tx, follower_rx) = {
            let mut inflight = self.inflight.lock().expect("flight table poisoned");
            match inflight.get(&request.key) {
                Some(rx) => (None, Some(rx.clone())),
                None => {
                    let (tx, rx) = watch::channel(Flight::Pending);
                    inflight.insert(request.key.clone(), rx);
                    (Some(tx), None)
                },
            }
        };

        match (tx, follower_rx) {
            (Some(tx), _) => self.lead(request, tx).await,
            (_, Some(rx)) => self.follow(request, rx).await,
            _ => unreachable!("either leader or follower"),
        }
    }

    /// Report whether the voice behind a key can synthesize right now.
    pub async fn voice_ready(&self, backend: &BackendId, voice: &VoiceId) -> Result<VoiceStatus> {
        let slot = self.slot(backend)?;
        slot.backend.voice_status(voice).await.map_err(|err| Self::map_backend_error(&err))
    }

    /// Time one real synthesis to classify the backend's speed on this device.
    pub async fn profile_backend(&self, backend: &BackendId, voice: &VoiceId) -> Result<DeviceEngineProfile> {
        let slot = self.slot(backend)?;
        DeviceEngineProfile::measure(slot.backend.as_ref(), voice).await.map_err(|err| Self::map_backend_error(&err))
    }

    fn slot(&self, backend: &BackendId) -> Result<&BackendSlot> {
        self.backends.get(backend).ok_or_else(|| exn::Exn::from(ErrorKind::UnknownBackend(backend.to_string())))
    }

    async fn cache_lookup(&self, key: &ContentKey) -> Result<Option<ArtifactHandle>> {
        self.cache.lookup(key).await.map_err(|err| exn::Exn::from(ErrorKind::Cache(err.to_string())))
    }

    /// Leader path: acquire a permit, invoke the backend (with retry budget),
    /// store the artifact, resolve the flight.
    async fn lead(&self, request: &SynthesisRequest, tx: watch::Sender<Flight>) -> Result<ArtifactHandle> {
        let guard = FlightGuard { inflight: Arc::clone(&self.inflight), key: request.key.clone(), tx };
        let outcome = self.lead_inner(request).await;
        match &outcome {
            Ok(_) => guard.resolve(None),
            Err(err) => guard.resolve(Some((**err).clone())),
        }
        outcome
    }

    async fn lead_inner(&self, request: &SynthesisRequest) -> Result<ArtifactHandle> {
        let slot = self.slot(&request.key.backend)?;
        // Fail fast instead of queueing: the scheduler treats Busy as a
        // retryable signal and will come back on its next pass.
        let Ok(_permit) = slot.permits.try_acquire() else {
            exn::bail!(ErrorKind::Busy);
        };

        let output = self.invoke_with_retry(slot, request).await?;
        // The backend call is the long suspension; re-check before writing
        // anything so a cancelled request leaves no trace.
        if request.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }

        let entry = self
            .cache
            .store(request.key.clone(), &output.samples, request.location.clone(), output.audio_duration)
            .await
            .map_err(|err| exn::Exn::from(ErrorKind::Cache(err.to_string())))?;
        Ok(ArtifactHandle {
            key: entry.key,
            path: self.cache.root().join(&entry.artifact),
            audio_duration: output.audio_duration,
            size_bytes: entry.size_bytes,
        })
    }

    /// One backend invocation plus the transient retry budget: inference
    /// failures and timeouts retry once with no backoff; out-of-memory gets
    /// one retry after unloading the least-recently-used idle model.
    async fn invoke_with_retry(&self, slot: &BackendSlot, request: &SynthesisRequest) -> Result<SynthOutput> {
        let voice = &request.key.voice;
        let text = request.key.text();
        let mut transient_budget = self.settings.transient_retries;
        let mut oom_budget = 1u32;
        loop {
            if request.cancel.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            let attempt = tokio::time::timeout(request.timeout, slot.backend.synthesize(voice, text)).await;
            match attempt {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(err)) => match &*err {
                    BackendErrorKind::InferenceFailed(detail) if transient_budget > 0 => {
                        transient_budget -= 1;
                        warn!(op = request.operation_id, detail, "inference failed; retrying once");
                    },
                    BackendErrorKind::OutOfMemory if oom_budget > 0 => {
                        oom_budget -= 1;
                        self.unload_idle_model(slot, voice).await;
                    },
                    _ => return Err(Self::map_backend_error(&err)),
                },
                Err(_elapsed) if transient_budget > 0 => {
                    transient_budget -= 1;
                    warn!(op = request.operation_id, timeout = ?request.timeout, "synthesis timed out; retrying once");
                },
                Err(_elapsed) => exn::bail!(ErrorKind::Timeout),
            }
        }
    }

    /// OOM remediation: drop the least-recently-used loaded model that isn't
    /// the voice we're about to synthesize with.
    async fn unload_idle_model(&self, slot: &BackendSlot, current: &VoiceId) {
        let candidate = slot.backend.loaded_voices().into_iter().find(|voice| voice != current);
        match candidate {
            Some(voice) => {
                warn!(%voice, "backend out of memory; unloading least-recently-used model");
                if let Err(err) = slot.backend.unload_voice(&voice).await {
                    warn!(error = %err, "model unload failed");
                }
            },
            None => debug!("backend out of memory with no idle model to unload"),
        }
    }

    /// Follower path: wait for the leader's verdict, then read the artifact
    /// out of the cache.
    async fn follow(&self, request: &SynthesisRequest, mut rx: watch::Receiver<Flight>) -> Result<ArtifactHandle> {
        debug!(op = request.operation_id, "attaching to in-flight synthesis");
        loop {
            let flight = rx.borrow_and_update().clone();
            match flight {
                Flight::Done(None) => {
                    return match self.cache_lookup(&request.key).await? {
                        Some(handle) => Ok(handle),
                        // Evicted between the leader's store and our lookup.
                        // Vanishingly rare; treat as a transient failure.
                        None => Err(exn::Exn::from(ErrorKind::SynthesisFailed(
                            "shared artifact evicted before follower could read it".into(),
                        ))),
                    };
                },
                Flight::Done(Some(kind)) => return Err(exn::Exn::from(kind)),
                Flight::Pending => {
                    tokio::select! {
                        () = request.cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                        changed = rx.changed() => {
                            if changed.is_err() {
                                // Leader dropped without resolving (panic).
                                exn::bail!(ErrorKind::SynthesisFailed("synthesis abandoned".into()));
                            }
                        },
                    }
                },
            }
        }
    }

    fn map_backend_error(err: &aloud_synth::error::Error) -> exn::Exn<ErrorKind> {
        let kind = match &**err {
            BackendErrorKind::ModelMissing(voice) => {
                ErrorKind::BackendUnavailable(format!("voice model {voice} needs download"))
            },
            BackendErrorKind::ModelCorrupted(voice) => {
                ErrorKind::BackendUnavailable(format!("voice model {voice} is corrupted"))
            },
            BackendErrorKind::InferenceFailed(detail) => ErrorKind::SynthesisFailed(detail.clone()),
            BackendErrorKind::OutOfMemory => ErrorKind::ResourceExhausted,
            BackendErrorKind::InvalidInput(detail) => ErrorKind::InvalidInput(detail.clone()),
        };
        exn::Exn::from(kind)
    }
}

/// Broadcasts the leader's outcome and removes the flight from the table on
/// drop — including an unwind, where followers see the channel close and
/// bail out instead of waiting forever.
struct FlightGuard {
    inflight: Arc<FlightTable>,
    key: ContentKey,
    tx: watch::Sender<Flight>,
}

impl FlightGuard {
    fn resolve(&self, outcome: Option<ErrorKind>) {
        let _ = self.tx.send(Flight::Done(outcome));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inflight.lock().expect("flight table poisoned").remove(&self.key);
    }
}
