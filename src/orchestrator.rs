//! # Realtime Session Orchestrator
//!
//! Drives one realtime voice session from admission to billing.
//!
//! ## Start sequence:
//! 1. Ledger admission (rejections are returned verbatim, nothing else is touched)
//! 2. Durable record in `PENDING_LINK`, before anything external happens
//! 3. Ephemeral credential and event stream from the engine
//! 4. Link the provider session id, go `ACTIVE`, arm the max-duration timer
//!
//! ## End:
//! `end` may arrive from a client disconnect, the timer or the engine, in any
//! order. Exactly one caller moves the session to `ENDING`; everyone else gets
//! [`EndOutcome::AlreadyEnded`]. The ledger is debited once, keyed by `durable_id`.
//!
//! Ledger and registry writes that outlast their inline retries are buffered in
//! the delivery pipeline and replayed by its drain cycle, never reported to the
//! caller.

use crate::config::AppConfig;
use crate::delivery::{
    is_permanent, permanent, route_engine_event, DeliveryFailure, DeliveryPayload, DeliveryPipeline, EndReason,
    LedgerDebitRequest, OperationKind, SessionEndTelemetry, SessionStartTelemetry, SessionStatusRequest,
};
use crate::engine::{ConversationalEngine, EngineError, EngineEvent, EngineSessionConfig};
use crate::session::{
    AdmissionRejection, LedgerError, QuotaLedger, RegistryError, SessionMetadata, SessionRegistry, SessionStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const NOTICE_CAPACITY: usize = 64;

/// Client-visible session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Idle,
    PendingLink,
    Linked,
    Active,
    Ending,
    Ended,
    Failed,
}

impl From<SessionStatus> for SessionPhase {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::PendingLink => SessionPhase::PendingLink,
            SessionStatus::Linked => SessionPhase::Linked,
            SessionStatus::Active => SessionPhase::Active,
            SessionStatus::Ending => SessionPhase::Ending,
            SessionStatus::Ended => SessionPhase::Ended,
            SessionStatus::Aborted => SessionPhase::Failed,
        }
    }
}

/// Pushed to subscribers of a live session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotice {
    Phase {
        durable_id: String,
        phase: SessionPhase,
    },
    Engine {
        durable_id: String,
        event: EngineEvent,
    },
    Ended {
        durable_id: String,
        reason: EndReason,
        consumed_units: u32,
        duration_secs: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedSession {
    pub durable_id: String,
    pub external_session_id: String,
    pub client_secret: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_credits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EndOutcome {
    Ended { consumed_units: u32, duration_secs: f64 },
    /// The session is still being provisioned; it ends as soon as it is linked.
    Deferred,
    AlreadyEnded,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("admission rejected: {0}")]
    Rejected(AdmissionRejection),

    #[error("session registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("external engine unavailable for session {durable_id}: {message}")]
    ExternalEngineUnavailable { durable_id: String, message: String },

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session invariant violated: {0}")]
    InvariantViolation(String),
}

/// Timing and billing knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_duration: Duration,
    pub credential_timeout: Duration,
    pub unit_seconds: u64,
}

impl From<&AppConfig> for SessionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_duration: config.session.max_duration(),
            credential_timeout: config.session.credential_timeout(),
            unit_seconds: config.quota.unit_seconds,
        }
    }
}

/// Credits consumed by a session of `duration`, rounded up to whole units.
pub fn consumed_units(duration: Duration, unit_seconds: u64) -> u32 {
    let unit_millis = u128::from(unit_seconds.max(1)) * 1_000;
    let units = duration.as_millis().div_ceil(unit_millis);
    u32::try_from(units).unwrap_or(u32::MAX)
}

struct LiveState {
    phase: SessionPhase,
    activated_at: Option<Instant>,
    /// Termination that arrived before the session was active
    closed_early: Option<EndReason>,
}

struct LiveSession {
    identity_key: String,
    created_at: Instant,
    state: Mutex<LiveState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    notices: broadcast::Sender<SessionNotice>,
}

impl LiveSession {
    fn new(identity_key: &str) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            identity_key: identity_key.to_string(),
            created_at: Instant::now(),
            state: Mutex::new(LiveState {
                phase: SessionPhase::PendingLink,
                activated_at: None,
                closed_early: None,
            }),
            tasks: Mutex::new(Vec::new()),
            notices,
        }
    }

    fn state(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }
}

struct OrchestratorInner {
    ledger: QuotaLedger,
    registry: SessionRegistry,
    pipeline: DeliveryPipeline,
    engine: Arc<dyn ConversationalEngine>,
    settings: SessionSettings,
    sessions: RwLock<HashMap<String, Arc<LiveSession>>>,
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SessionOrchestrator {
    /// Registers the ledger-debit and session-status handlers on `pipeline`,
    /// so buffered state writes replay against this ledger and registry.
    pub fn new(
        ledger: QuotaLedger,
        registry: SessionRegistry,
        pipeline: DeliveryPipeline,
        engine: Arc<dyn ConversationalEngine>,
        settings: SessionSettings,
    ) -> Self {
        register_state_handlers(&pipeline, &ledger, &registry);
        Self {
            inner: Arc::new(OrchestratorInner {
                ledger,
                registry,
                pipeline,
                engine,
                settings,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.inner.ledger
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn pipeline(&self) -> &DeliveryPipeline {
        &self.inner.pipeline
    }

    /// Admit, record, provision and activate a new session for `identity_key`.
    pub async fn start(&self, identity_key: &str, metadata: SessionMetadata) -> Result<StartedSession, SessionError> {
        let decision = match self.inner.ledger.check_and_reserve(identity_key).await {
            Ok(decision) => decision,
            Err(LedgerError::InvalidIdentity) => {
                return Err(SessionError::InvalidRequest("identity key must not be empty".to_string()))
            }
            Err(err) => {
                warn!(identity_key = %identity_key, error = %err, "Ledger error during admission");
                return Err(SessionError::Rejected(AdmissionRejection::LedgerUnavailable));
            }
        };
        if !decision.allowed {
            let reason = decision.reason.unwrap_or(AdmissionRejection::LedgerUnavailable);
            info!(identity_key = %identity_key, reason = %reason, "Session admission rejected");
            return Err(SessionError::Rejected(reason));
        }

        let registry = self.inner.registry.clone();
        let created = self
            .inner
            .pipeline
            .try_execute("registry.create", self.retries(), || {
                let registry = registry.clone();
                let identity_key = identity_key.to_string();
                let metadata = metadata.clone();
                async move { registry.create(&identity_key, metadata).await.map_err(registry_error) }
            })
            .await;
        let durable_id = match created {
            Ok(durable_id) => durable_id,
            Err(failure) => {
                error!(identity_key = %identity_key, error = ?failure.last_error, "Could not create session record");
                let token = format!("release-{}", Uuid::new_v4());
                self.release_reservation(identity_key, None, &token).await;
                return Err(session_error_from(failure));
            }
        };

        let live = Arc::new(LiveSession::new(identity_key));
        self.sessions_mut().insert(durable_id.clone(), live.clone());
        live.notify(SessionNotice::Phase { durable_id: durable_id.clone(), phase: SessionPhase::PendingLink });
        info!(durable_id = %durable_id, identity_key = %identity_key, "Session record created, requesting credential");

        let engine_session = EngineSessionConfig {
            durable_id: durable_id.clone(),
            instructions: metadata
                .get("instructions")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            metadata: metadata.clone(),
        };
        let timeout = self.inner.settings.credential_timeout;
        let credential = match tokio::time::timeout(timeout, self.inner.engine.issue_credential(&engine_session)).await {
            Ok(Ok(credential)) => credential,
            Ok(Err(err)) => return Err(self.abort_start(&live, &durable_id, err).await),
            Err(_) => return Err(self.abort_start(&live, &durable_id, EngineError::Timeout(timeout)).await),
        };
        let events = match self.inner.engine.open_event_stream(&credential).await {
            Ok(events) => events,
            Err(err) => return Err(self.abort_start(&live, &durable_id, err).await),
        };
        live.track(self.spawn_event_pump(durable_id.clone(), events));

        let external_id = credential.provider_session_id.clone();
        if let Err(failure) = self
            .registry_write("registry.link", &durable_id, |registry, id| {
                let external_id = external_id.clone();
                async move { registry.link(&id, &external_id).await }
            })
            .await
        {
            return Err(self.abandon_provisioned(&live, &durable_id, failure).await);
        }
        self.set_phase(&live, &durable_id, SessionPhase::Linked);

        if let Err(failure) = self
            .registry_write("registry.transition.active", &durable_id, |registry, id| async move {
                registry.transition(&id, SessionStatus::Active).await
            })
            .await
        {
            return Err(self.abandon_provisioned(&live, &durable_id, failure).await);
        }

        let closed_early = {
            let mut state = live.state();
            state.phase = SessionPhase::Active;
            state.activated_at = Some(Instant::now());
            state.closed_early
        };
        live.notify(SessionNotice::Phase { durable_id: durable_id.clone(), phase: SessionPhase::Active });
        live.track(self.spawn_timer(durable_id.clone()));
        info!(
            durable_id = %durable_id,
            external_session_id = %external_id,
            provisioning_ms = live.created_at.elapsed().as_millis() as u64,
            "Session active"
        );

        self.deliver_in_background(DeliveryPayload::SessionStart(SessionStartTelemetry {
            durable_id: durable_id.clone(),
            identity_key: identity_key.to_string(),
            external_session_id: external_id.clone(),
            metadata,
            started_at: Utc::now(),
        }));

        if let Some(reason) = closed_early {
            info!(durable_id = %durable_id, reason = %reason, "Engine closed during provisioning, ending now");
            if let Err(err) = self.end(&durable_id, reason).await {
                error!(durable_id = %durable_id, error = %err, "Failed to end early-closed session");
            }
        }

        Ok(StartedSession {
            durable_id,
            external_session_id: external_id,
            client_secret: credential.token,
            expires_at: credential.expires_at,
            remaining_credits: decision.remaining_credits,
        })
    }

    /// Handle one engine event for a live session without blocking the caller.
    ///
    /// Telemetry is delivered in the background; terminal events schedule `end`.
    pub fn on_external_event(&self, durable_id: &str, event: EngineEvent) -> Result<(), SessionError> {
        let live = self
            .live(durable_id)
            .ok_or_else(|| SessionError::NotFound(durable_id.to_string()))?;

        if let Some(telemetry) = route_engine_event(durable_id, &event) {
            self.deliver_in_background(telemetry);
        }

        let terminal = match &event {
            EngineEvent::Error { fatal: true, code, message } => {
                warn!(durable_id = %durable_id, code = %code, message = %message, "Fatal engine error");
                Some(EndReason::EngineError)
            }
            EngineEvent::SessionClosed { reason } => {
                info!(durable_id = %durable_id, reason = ?reason, "Engine closed session");
                Some(EndReason::EngineClosed)
            }
            _ => None,
        };
        live.notify(SessionNotice::Engine { durable_id: durable_id.to_string(), event });

        if let Some(reason) = terminal {
            let orchestrator = self.clone();
            let durable_id = durable_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = orchestrator.end(&durable_id, reason).await {
                    error!(durable_id = %durable_id, error = %err, "Failed to end session after engine termination");
                }
            });
        }
        Ok(())
    }

    /// End a session. Safe to call any number of times from any source.
    pub async fn end(&self, durable_id: &str, reason: EndReason) -> Result<EndOutcome, SessionError> {
        let Some(live) = self.live(durable_id) else {
            return match self.inner.registry.get(durable_id).await {
                Ok(Some(_)) => Ok(EndOutcome::AlreadyEnded),
                Ok(None) => Err(SessionError::NotFound(durable_id.to_string())),
                Err(err) => Err(SessionError::RegistryUnavailable(err.to_string())),
            };
        };

        let activated_at = {
            let mut state = live.state();
            match state.phase {
                SessionPhase::Active => {
                    state.phase = SessionPhase::Ending;
                    state.activated_at.unwrap_or(live.created_at)
                }
                SessionPhase::PendingLink | SessionPhase::Linked => {
                    state.closed_early.get_or_insert(reason);
                    debug!(durable_id = %durable_id, reason = %reason, "End requested during provisioning, deferring");
                    return Ok(EndOutcome::Deferred);
                }
                _ => return Ok(EndOutcome::AlreadyEnded),
            }
        };
        live.notify(SessionNotice::Phase { durable_id: durable_id.to_string(), phase: SessionPhase::Ending });

        let duration = activated_at.elapsed();
        let units = consumed_units(duration, self.inner.settings.unit_seconds);
        let mut violation = None;

        // ACTIVE -> ENDING -> ENDED, resuming from wherever a failed attempt stopped
        if let Err(failure) = self
            .registry_write("registry.complete", durable_id, |registry, id| async move { registry.complete(&id).await })
            .await
        {
            match session_error_from(failure) {
                SessionError::InvariantViolation(message) => {
                    error!(durable_id = %durable_id, error = %message, "Invalid transition while ending session");
                    violation = Some(message);
                }
                other => {
                    warn!(durable_id = %durable_id, error = %other, "Session status write deferred to replay buffer");
                    self.defer(DeliveryPayload::SessionStatus(SessionStatusRequest {
                        durable_id: durable_id.to_string(),
                        target: SessionStatus::Ended,
                    }));
                }
            }
        }

        self.debit(&live.identity_key, Some(durable_id), units, durable_id).await;

        let duration_secs = duration.as_secs_f64();
        self.deliver_in_background(DeliveryPayload::SessionEnd(SessionEndTelemetry {
            durable_id: durable_id.to_string(),
            reason,
            duration_secs,
            consumed_units: units,
            ended_at: Utc::now(),
        }));

        live.state().phase = SessionPhase::Ended;
        live.notify(SessionNotice::Ended {
            durable_id: durable_id.to_string(),
            reason,
            consumed_units: units,
            duration_secs,
        });
        self.sessions_mut().remove(durable_id);
        live.abort_tasks();
        info!(durable_id = %durable_id, reason = %reason, duration_secs, consumed_units = units, "Session ended");

        match violation {
            Some(message) => Err(SessionError::InvariantViolation(message)),
            None => Ok(EndOutcome::Ended { consumed_units: units, duration_secs }),
        }
    }

    /// End every live session, e.g. on shutdown.
    pub async fn end_all(&self, reason: EndReason) -> usize {
        let ids: Vec<String> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        let count = ids.len();
        let results = futures_util::future::join_all(ids.iter().map(|id| self.end(id, reason))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(err) = result {
                warn!(durable_id = %id, error = %err, "Failed to end session");
            }
        }
        count
    }

    /// Client-visible phase; `Idle` for sessions this service has never seen.
    pub async fn phase(&self, durable_id: &str) -> Result<SessionPhase, SessionError> {
        if let Some(live) = self.live(durable_id) {
            return Ok(live.state().phase);
        }
        match self.inner.registry.get(durable_id).await {
            Ok(Some(record)) => Ok(record.status.into()),
            Ok(None) => Ok(SessionPhase::Idle),
            Err(err) => Err(SessionError::RegistryUnavailable(err.to_string())),
        }
    }

    /// Notices for a live session, or `None` if it is not live.
    pub fn subscribe(&self, durable_id: &str) -> Option<broadcast::Receiver<SessionNotice>> {
        self.live(durable_id).map(|live| live.notices.subscribe())
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn live(&self, durable_id: &str) -> Option<Arc<LiveSession>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(durable_id)
            .cloned()
    }

    fn sessions_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<LiveSession>>> {
        self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn retries(&self) -> u32 {
        self.inner.pipeline.policy().max_retries
    }

    fn set_phase(&self, live: &LiveSession, durable_id: &str, phase: SessionPhase) {
        live.state().phase = phase;
        live.notify(SessionNotice::Phase { durable_id: durable_id.to_string(), phase });
    }

    /// Registry write for one session through the retry executor.
    async fn registry_write<F, Fut>(&self, label: &str, durable_id: &str, write: F) -> Result<(), DeliveryFailure>
    where
        F: Fn(SessionRegistry, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), RegistryError>>,
    {
        let registry = self.inner.registry.clone();
        self.inner
            .pipeline
            .try_execute(label, self.retries(), || {
                let attempt = write(registry.clone(), durable_id.to_string());
                async move { attempt.await.map_err(registry_error) }
            })
            .await
    }

    fn deliver_in_background(&self, event: DeliveryPayload) {
        let pipeline = self.inner.pipeline.clone();
        tokio::spawn(async move {
            pipeline.deliver(event).await;
        });
    }

    fn spawn_event_pump(&self, durable_id: String, mut events: mpsc::Receiver<EngineEvent>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                if orchestrator.on_external_event(&durable_id, event).is_err() || terminal {
                    break;
                }
            }
            debug!(durable_id = %durable_id, "Engine event pump finished");
        })
    }

    fn spawn_timer(&self, durable_id: String) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let max_duration = self.inner.settings.max_duration;
        tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            info!(durable_id = %durable_id, max_secs = max_duration.as_secs(), "Session reached max duration");
            // end() aborts this task, so it must run on its own
            tokio::spawn(async move {
                if let Err(err) = orchestrator.end(&durable_id, EndReason::Timeout).await {
                    error!(durable_id = %durable_id, error = %err, "Failed to end timed-out session");
                }
            });
        })
    }

    /// Debit the ledger (zero units releases the slot), buffering the debit
    /// for replay if the ledger stays unreachable.
    async fn debit(&self, identity_key: &str, durable_id: Option<&str>, units: u32, token: &str) {
        let request = LedgerDebitRequest {
            identity_key: identity_key.to_string(),
            durable_id: durable_id.map(str::to_string),
            consumed_units: units,
            dedup_token: token.to_string(),
        };
        let ledger = self.inner.ledger.clone();
        let label = if units == 0 { "ledger.release" } else { "ledger.debit" };
        let result = self
            .inner
            .pipeline
            .try_execute(label, self.retries(), || {
                let ledger = ledger.clone();
                let request = request.clone();
                async move { apply_debit(&ledger, &request).await }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(failure) if is_permanent(&failure.last_error) => {
                error!(identity_key = %identity_key, token = %token, error = ?failure.last_error, "Quota debit rejected");
            }
            Err(_) => {
                warn!(identity_key = %identity_key, token = %token, units, "Quota debit deferred to replay buffer");
                self.defer(DeliveryPayload::LedgerDebit(request));
            }
        }
    }

    /// Release the exclusivity slot without consuming credits.
    async fn release_reservation(&self, identity_key: &str, durable_id: Option<&str>, token: &str) {
        self.debit(identity_key, durable_id, 0, token).await;
    }

    /// Hand a state write that exhausted its retries to the replay buffer.
    fn defer(&self, payload: DeliveryPayload) {
        self.inner.pipeline.buffer(payload);
        self.inner.pipeline.request_drain();
    }

    /// Roll back a start that failed before the engine session existed.
    async fn abort_start(&self, live: &LiveSession, durable_id: &str, err: EngineError) -> SessionError {
        warn!(durable_id = %durable_id, error = %err, "Credential acquisition failed, rolling back");
        self.roll_back(live, durable_id).await;
        SessionError::ExternalEngineUnavailable {
            durable_id: durable_id.to_string(),
            message: err.to_string(),
        }
    }

    /// Roll back a start whose registry write failed after the engine session was opened.
    async fn abandon_provisioned(&self, live: &LiveSession, durable_id: &str, failure: DeliveryFailure) -> SessionError {
        let err = session_error_from(failure);
        error!(durable_id = %durable_id, error = %err, "Session registry write failed during start, rolling back");
        self.roll_back(live, durable_id).await;
        err
    }

    async fn roll_back(&self, live: &LiveSession, durable_id: &str) {
        live.abort_tasks();
        if let Err(failure) = self
            .registry_write("registry.cleanup", durable_id, |registry, id| async move { registry.cleanup(&id).await })
            .await
        {
            if is_permanent(&failure.last_error) {
                error!(durable_id = %durable_id, error = ?failure.last_error, "Could not mark session aborted");
            } else {
                warn!(durable_id = %durable_id, "Session abort deferred to replay buffer");
                self.defer(DeliveryPayload::SessionStatus(SessionStatusRequest {
                    durable_id: durable_id.to_string(),
                    target: SessionStatus::Aborted,
                }));
            }
        }
        self.release_reservation(&live.identity_key, Some(durable_id), durable_id).await;
        self.set_phase(live, durable_id, SessionPhase::Failed);
        self.sessions_mut().remove(durable_id);
    }
}

/// Replay handlers for state writes buffered by the orchestrator.
fn register_state_handlers(pipeline: &DeliveryPipeline, ledger: &QuotaLedger, registry: &SessionRegistry) {
    let ledger = ledger.clone();
    pipeline.register_handler(OperationKind::LedgerDebit, move |payload| {
        let ledger = ledger.clone();
        async move {
            match payload {
                DeliveryPayload::LedgerDebit(request) => apply_debit(&ledger, &request).await,
                other => Err(permanent(anyhow::anyhow!("ledger handler received {} payload", other.kind()))),
            }
        }
    });

    let registry = registry.clone();
    pipeline.register_handler(OperationKind::SessionStatus, move |payload| {
        let registry = registry.clone();
        async move {
            let request = match payload {
                DeliveryPayload::SessionStatus(request) => request,
                other => return Err(permanent(anyhow::anyhow!("registry handler received {} payload", other.kind()))),
            };
            let written = match request.target {
                SessionStatus::Ended => registry.complete(&request.durable_id).await,
                SessionStatus::Aborted => registry.cleanup(&request.durable_id).await,
                other => {
                    return Err(permanent(anyhow::anyhow!(
                        "cannot replay {} write for {}",
                        other,
                        request.durable_id
                    )))
                }
            };
            written.map_err(registry_error)
        }
    });
}

async fn apply_debit(ledger: &QuotaLedger, request: &LedgerDebitRequest) -> anyhow::Result<()> {
    ledger
        .debit(&request.identity_key, request.consumed_units, &request.dedup_token)
        .await
        .map(|_| ())
        .map_err(ledger_error)
}

fn registry_error(err: RegistryError) -> anyhow::Error {
    if err.is_permanent() {
        permanent(err)
    } else {
        err.into()
    }
}

fn ledger_error(err: LedgerError) -> anyhow::Error {
    match err {
        LedgerError::InvalidIdentity => permanent(err),
        other => other.into(),
    }
}

fn session_error_from(failure: DeliveryFailure) -> SessionError {
    match failure.last_error.downcast_ref::<RegistryError>() {
        Some(err) if err.is_permanent() => SessionError::InvariantViolation(err.to_string()),
        Some(err) => SessionError::RegistryUnavailable(err.to_string()),
        None => SessionError::RegistryUnavailable(format!("{:#}", failure.last_error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{BufferLimits, MemoryTelemetrySink, OperationKind, RetryPolicy};
    use crate::engine::testing::FakeEngine;
    use crate::engine::SpeakerRole;
    use crate::session::{QuotaPolicy, QuotaState, SessionRecord};
    use crate::storage::MemoryStore;

    const IDENTITY: &str = "203.0.113.7|fp-1";

    struct Harness {
        orchestrator: SessionOrchestrator,
        engine: Arc<FakeEngine>,
        sink: Arc<MemoryTelemetrySink>,
        quota_store: Arc<MemoryStore<QuotaState>>,
        record_store: Arc<MemoryStore<SessionRecord>>,
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            max_duration: Duration::from_secs(60),
            credential_timeout: Duration::from_millis(200),
            unit_seconds: 60,
        }
    }

    fn harness_with(settings: SessionSettings) -> Harness {
        let quota_store: Arc<MemoryStore<QuotaState>> = Arc::new(MemoryStore::new());
        let record_store: Arc<MemoryStore<SessionRecord>> = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryTelemetrySink::new());
        let engine = Arc::new(FakeEngine::new());
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_retries: 3,
        };
        let ledger = QuotaLedger::new(
            quota_store.clone(),
            QuotaPolicy { max_credits: 10, window: chrono::Duration::hours(24) },
        );
        let registry = SessionRegistry::new(record_store.clone());
        let pipeline = DeliveryPipeline::with_sink(policy, BufferLimits::default(), sink.clone());
        let orchestrator = SessionOrchestrator::new(ledger, registry, pipeline, engine.clone(), settings);

        Harness { orchestrator, engine, sink, quota_store, record_store }
    }

    fn harness() -> Harness {
        harness_with(settings())
    }

    async fn quota(h: &Harness) -> QuotaState {
        h.orchestrator.ledger().snapshot(IDENTITY).await.unwrap().unwrap()
    }

    async fn record(h: &Harness, durable_id: &str) -> SessionRecord {
        h.orchestrator.registry().get(durable_id).await.unwrap().unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_consumed_units_round_up() {
        assert_eq!(consumed_units(Duration::ZERO, 60), 0);
        assert_eq!(consumed_units(Duration::from_millis(1), 60), 1);
        assert_eq!(consumed_units(Duration::from_secs(60), 60), 1);
        assert_eq!(consumed_units(Duration::from_secs(61), 60), 2);
        assert_eq!(consumed_units(Duration::from_secs(125), 60), 3);
    }

    #[tokio::test]
    async fn test_start_and_end_happy_path() {
        let h = harness();
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();

        assert_eq!(started.external_session_id, FakeEngine::provider_id(&started.durable_id));
        assert_eq!(h.orchestrator.phase(&started.durable_id).await.unwrap(), SessionPhase::Active);
        let active = record(&h, &started.durable_id).await;
        assert_eq!(active.status, SessionStatus::Active);
        assert!(active.is_consistent());
        assert!(quota(&h).await.has_active_session);

        let outcome = h.orchestrator.end(&started.durable_id, EndReason::UserCancelled).await.unwrap();
        let EndOutcome::Ended { consumed_units, .. } = outcome else {
            panic!("expected Ended, got {:?}", outcome);
        };
        assert!(consumed_units <= 1);

        let ended = record(&h, &started.durable_id).await;
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.ended_at.is_some());
        let state = quota(&h).await;
        assert!(!state.has_active_session);
        assert_eq!(state.remaining_credits, 10 - consumed_units);
        assert_eq!(h.orchestrator.live_sessions(), 0);

        settle().await;
        assert_eq!(h.sink.count(OperationKind::SessionStart), 1);
        assert_eq!(h.sink.count(OperationKind::SessionEnd), 1);
    }

    #[tokio::test]
    async fn test_credential_failure_rolls_back() {
        let h = harness();
        h.engine.fail_credentials(true);

        let durable_id = match h.orchestrator.start(IDENTITY, SessionMetadata::new()).await {
            Err(SessionError::ExternalEngineUnavailable { durable_id, .. }) => durable_id,
            other => panic!("expected ExternalEngineUnavailable, got {:?}", other),
        };

        let aborted = record(&h, &durable_id).await;
        assert_eq!(aborted.status, SessionStatus::Aborted);
        assert!(aborted.external_session_id.is_none());
        assert!(!quota(&h).await.has_active_session);
        assert_eq!(h.orchestrator.phase(&durable_id).await.unwrap(), SessionPhase::Failed);

        // The released slot admits the caller's retry
        h.engine.fail_credentials(false);
        assert!(h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_credential_timeout_rolls_back() {
        let h = harness_with(SessionSettings { credential_timeout: Duration::from_millis(20), ..settings() });
        h.engine.delay_credentials(Duration::from_millis(500));

        let err = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::ExternalEngineUnavailable { .. }));
        assert!(!quota(&h).await.has_active_session);
        assert_eq!(h.engine.credentials_issued(), 0);
    }

    #[tokio::test]
    async fn test_rejection_leaves_registry_untouched() {
        let h = harness();
        h.orchestrator.ledger().set_blocked(IDENTITY, true).await.unwrap();

        let err = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap_err();
        assert_eq!(err, SessionError::Rejected(AdmissionRejection::Blocked));
        assert!(h.record_store.is_empty());
        assert_eq!(h.engine.credentials_issued(), 0);
    }

    #[tokio::test]
    async fn test_second_start_is_already_active() {
        let h = harness();
        h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();

        let err = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap_err();
        assert_eq!(err, SessionError::Rejected(AdmissionRejection::AlreadyActive));
        assert_eq!(h.record_store.len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_outage_rejects_unavailable() {
        let h = harness();
        h.quota_store.set_available(false);

        let err = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap_err();
        assert_eq!(err, SessionError::Rejected(AdmissionRejection::LedgerUnavailable));
        assert!(h.record_store.is_empty());
    }

    #[tokio::test]
    async fn test_registry_outage_releases_reservation() {
        let h = harness();
        h.record_store.set_available(false);

        let err = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::RegistryUnavailable(_)));
        assert!(!quota(&h).await.has_active_session);
        assert_eq!(h.engine.credentials_issued(), 0);
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_debits_once() {
        let h = harness();
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();
        let id = started.durable_id.as_str();

        let (first, second) = tokio::join!(
            h.orchestrator.end(id, EndReason::UserCancelled),
            h.orchestrator.end(id, EndReason::Timeout)
        );
        let outcomes = [first.unwrap(), second.unwrap()];
        let ended: Vec<_> = outcomes.iter().filter(|o| matches!(o, EndOutcome::Ended { .. })).collect();
        assert_eq!(ended.len(), 1);
        assert!(outcomes.contains(&EndOutcome::AlreadyEnded));

        let remaining = quota(&h).await.remaining_credits;
        assert_eq!(h.orchestrator.end(id, EndReason::EngineClosed).await.unwrap(), EndOutcome::AlreadyEnded);
        assert_eq!(quota(&h).await.remaining_credits, remaining);

        settle().await;
        assert_eq!(h.sink.count(OperationKind::SessionEnd), 1);
    }

    #[tokio::test]
    async fn test_end_unknown_session_is_not_found() {
        let h = harness();
        let err = h.orchestrator.end("missing", EndReason::UserCancelled).await.unwrap_err();
        assert_eq!(err, SessionError::NotFound("missing".to_string()));
        assert_eq!(h.orchestrator.phase("missing").await.unwrap(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_end_survives_transient_registry_failures() {
        let h = harness();
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();

        h.record_store.fail_next(2);
        let outcome = h.orchestrator.end(&started.durable_id, EndReason::UserCancelled).await.unwrap();
        assert!(matches!(outcome, EndOutcome::Ended { .. }));
        assert_eq!(record(&h, &started.durable_id).await.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_end_during_registry_outage_replays_status() {
        let h = harness();
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();

        // Outlasts all four inline attempts
        h.record_store.fail_next(4);
        let outcome = h.orchestrator.end(&started.durable_id, EndReason::UserCancelled).await.unwrap();
        assert!(matches!(outcome, EndOutcome::Ended { .. }));
        assert!(!quota(&h).await.has_active_session);

        // The drain requested on deferral finishes the record once storage is back
        settle().await;
        let ended = record(&h, &started.durable_id).await;
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.is_consistent());
        assert_eq!(h.orchestrator.pipeline().queue_size(), 0);
    }

    #[tokio::test]
    async fn test_debit_during_ledger_outage_replays_after_recovery() {
        let h = harness();
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();

        h.quota_store.set_available(false);
        let outcome = h.orchestrator.end(&started.durable_id, EndReason::UserCancelled).await.unwrap();
        assert!(matches!(outcome, EndOutcome::Ended { .. }));
        settle().await;
        assert_eq!(h.orchestrator.pipeline().queue_size(), 1);

        h.quota_store.set_available(true);
        let report = h.orchestrator.pipeline().drain().await.unwrap();
        assert_eq!(report.delivered, 1);

        let state = quota(&h).await;
        assert!(!state.has_active_session);
        assert_eq!(state.last_debit_token.as_deref(), Some(started.durable_id.as_str()));
        assert!(h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_during_ledger_outage_replays_after_recovery() {
        let h = harness();
        h.engine.delay_credentials(Duration::from_millis(40));
        h.engine.fail_credentials(true);

        let orchestrator = h.orchestrator.clone();
        let starting = tokio::spawn(async move { orchestrator.start(IDENTITY, SessionMetadata::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.quota_store.set_available(false);

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ExternalEngineUnavailable { .. }));
        settle().await;
        assert_eq!(h.orchestrator.pipeline().queue_size(), 1);

        h.quota_store.set_available(true);
        assert_eq!(h.orchestrator.pipeline().drain().await.unwrap().delivered, 1);
        let state = quota(&h).await;
        assert!(!state.has_active_session);
        assert_eq!(state.remaining_credits, 10);
    }

    #[tokio::test]
    async fn test_max_duration_ends_session() {
        let h = harness_with(SessionSettings { max_duration: Duration::from_millis(30), ..settings() });
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.orchestrator.phase(&started.durable_id).await.unwrap(), SessionPhase::Ended);
        assert!(!quota(&h).await.has_active_session);

        let reasons: Vec<EndReason> = h
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DeliveryPayload::SessionEnd(end) => Some(end.reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![EndReason::Timeout]);
    }

    #[tokio::test]
    async fn test_engine_close_during_provisioning_still_links_and_ends() {
        let h = harness();
        h.engine.close_on_open(true);

        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();
        settle().await;

        let ended = record(&h, &started.durable_id).await;
        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.external_session_id.as_deref(), Some(started.external_session_id.as_str()));
        assert!(!quota(&h).await.has_active_session);
        assert_eq!(h.orchestrator.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_end_during_provisioning_is_deferred() {
        let h = harness();
        let live = Arc::new(LiveSession::new(IDENTITY));
        h.orchestrator.sessions_mut().insert("pending".to_string(), live.clone());

        let outcome = h.orchestrator.end("pending", EndReason::UserCancelled).await.unwrap();
        assert_eq!(outcome, EndOutcome::Deferred);
        assert_eq!(live.state().closed_early, Some(EndReason::UserCancelled));
        assert_eq!(live.state().phase, SessionPhase::PendingLink);
    }

    #[tokio::test]
    async fn test_engine_events_are_keyed_by_durable_id() {
        let h = harness();
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();

        h.engine
            .emit(
                &started.durable_id,
                EngineEvent::TranscriptFragment { role: SpeakerRole::User, text: "done".into(), is_final: true },
            )
            .await;
        settle().await;

        let audio: Vec<DeliveryPayload> =
            h.sink.events().into_iter().filter(|e| e.kind() == OperationKind::AudioEvent).collect();
        assert!(!audio.is_empty());
        assert!(audio.iter().all(|e| e.durable_id() == started.durable_id));
    }

    #[tokio::test]
    async fn test_fatal_engine_error_ends_session() {
        let h = harness();
        let started = h.orchestrator.start(IDENTITY, SessionMetadata::new()).await.unwrap();
        let mut notices = h.orchestrator.subscribe(&started.durable_id).unwrap();

        h.engine
            .emit(
                &started.durable_id,
                EngineEvent::Error { code: "server_error".into(), message: "boom".into(), fatal: true },
            )
            .await;
        settle().await;

        assert_eq!(h.orchestrator.phase(&started.durable_id).await.unwrap(), SessionPhase::Ended);
        let mut saw_end = false;
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::Ended { reason, .. } = notice {
                assert_eq!(reason, EndReason::EngineError);
                saw_end = true;
            }
        }
        assert!(saw_end);
    }

    #[tokio::test]
    async fn test_event_for_unknown_session_is_rejected() {
        let h = harness();
        let err = h
            .orchestrator
            .on_external_event("ghost", EngineEvent::SessionClosed { reason: None })
            .unwrap_err();
        assert_eq!(err, SessionError::NotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_end_all_ends_every_live_session() {
        let h = harness();
        let a = h.orchestrator.start("10.0.0.1|a", SessionMetadata::new()).await.unwrap();
        let b = h.orchestrator.start("10.0.0.2|b", SessionMetadata::new()).await.unwrap();

        assert_eq!(h.orchestrator.end_all(EndReason::Shutdown).await, 2);
        assert_eq!(h.orchestrator.live_sessions(), 0);
        for id in [&a.durable_id, &b.durable_id] {
            assert_eq!(record(&h, id).await.status, SessionStatus::Ended);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_admit_one() {
        let h = harness();
        let attempts = (0..8).map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.start(IDENTITY, SessionMetadata::new()).await })
        });
        let results = futures_util::future::join_all(attempts).await;

        let admitted = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(admitted, 1);
        for result in results.iter().filter_map(|r| r.as_ref().ok()).filter_map(|r| r.as_ref().err()) {
            assert_eq!(result, &SessionError::Rejected(AdmissionRejection::AlreadyActive));
        }
        assert_eq!(h.record_store.len(), 1);
    }
}
