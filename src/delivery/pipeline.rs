//! # Resilient Delivery Pipeline
//!
//! Wraps any outbound operation with bounded retry and exponential backoff,
//! and holds payloads that still failed in an at-least-once buffer.
//!
//! ## Delivery path:
//! 1. `execute_with_retry`: up to `max_retries + 1` attempts with backoff
//! 2. `buffer`: on exhaustion the payload becomes a [`DeliveryTask`]
//! 3. `drain`: a single in-flight drain retries each buffered task once per cycle,
//!    dropping (and counting) tasks that exceed `max_task_attempts`
//!
//! Nothing is thrown past this boundary: callers get a value, or `None`/a
//! [`DeliveryFailure`], and decide per operation whether that is fatal.

use crate::config::DeliveryConfig;
use crate::delivery::retry::RetryPolicy;
use crate::delivery::sink::TelemetrySink;
use crate::delivery::task::{DeliveryTask, OperationKind, DeliveryPayload};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler registered for one operation kind.
pub type DeliveryHandler = Arc<dyn Fn(DeliveryPayload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Marks an error as not worth retrying (logic errors, rejected payloads).
#[derive(Debug, Clone, Copy)]
pub struct PermanentFailure;

impl fmt::Display for PermanentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("permanent failure")
    }
}

/// Wrap `err` so `execute_with_retry` gives up immediately. The original error
/// stays reachable through `downcast_ref`.
pub fn permanent<E>(err: E) -> anyhow::Error
where
    E: Into<anyhow::Error>,
{
    err.into().context(PermanentFailure)
}

pub fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PermanentFailure>().is_some()
}

/// Terminal failure of a retried operation.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub label: String,
    pub attempts: u32,
    pub last_error: anyhow::Error,
}

#[derive(Debug, Clone)]
pub struct BufferLimits {
    /// Drain attempts a buffered task gets before it is dropped
    pub max_task_attempts: u32,
    /// Tasks held at once; the oldest is evicted beyond this
    pub max_buffer_size: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_task_attempts: 5,
            max_buffer_size: 1_000,
        }
    }
}

impl From<&DeliveryConfig> for BufferLimits {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_task_attempts: config.max_task_attempts,
            max_buffer_size: config.max_buffer_size,
        }
    }
}

/// Operational snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryHealth {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Tasks currently held in the buffer
    pub buffered: usize,
    pub dropped: u64,
    /// Tasks ever buffered
    pub total_buffered: u64,
    pub queue_size: usize,
    pub error_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub draining: bool,
}

#[derive(Debug, Default)]
struct DeliveryStats {
    total: u64,
    success: u64,
    failed: u64,
    dropped: u64,
    total_buffered: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// What happened to one telemetry event handed to [`DeliveryPipeline::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Buffered { task_id: String },
    Unroutable,
}

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

struct PipelineInner {
    policy: RetryPolicy,
    limits: BufferLimits,
    handlers: RwLock<HashMap<OperationKind, DeliveryHandler>>,
    queue: Mutex<VecDeque<DeliveryTask>>,
    draining: AtomicBool,
    stats: Mutex<DeliveryStats>,
}

/// Shared delivery service. Cloning is cheap; all clones share one buffer.
#[derive(Clone)]
pub struct DeliveryPipeline {
    inner: Arc<PipelineInner>,
}

/// Resets the single-drain flag however the drain exits.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DeliveryPipelineBuilder {
    policy: RetryPolicy,
    limits: BufferLimits,
    handlers: HashMap<OperationKind, DeliveryHandler>,
}

impl DeliveryPipelineBuilder {
    /// Register the handler that delivers one operation kind.
    pub fn handler<F, Fut>(mut self, kind: OperationKind, handler: F) -> Self
    where
        F: Fn(DeliveryPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(kind, boxed_handler(handler));
        self
    }

    pub fn build(self) -> DeliveryPipeline {
        for kind in OperationKind::TELEMETRY {
            if !self.handlers.contains_key(&kind) {
                warn!(kind = %kind, "No delivery handler registered");
            }
        }
        DeliveryPipeline {
            inner: Arc::new(PipelineInner {
                policy: self.policy,
                limits: self.limits,
                handlers: RwLock::new(self.handlers),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                stats: Mutex::new(DeliveryStats::default()),
            }),
        }
    }
}

impl DeliveryPipeline {
    pub fn builder(policy: RetryPolicy, limits: BufferLimits) -> DeliveryPipelineBuilder {
        DeliveryPipelineBuilder {
            policy,
            limits,
            handlers: HashMap::new(),
        }
    }

    /// Pipeline whose handler table routes each operation kind to `sink`.
    pub fn with_sink(policy: RetryPolicy, limits: BufferLimits, sink: Arc<dyn TelemetrySink>) -> Self {
        let start_sink = sink.clone();
        let audio_sink = sink.clone();
        let end_sink = sink;

        Self::builder(policy, limits)
            .handler(OperationKind::SessionStart, move |event| {
                let sink = start_sink.clone();
                async move {
                    match event {
                        DeliveryPayload::SessionStart(e) => sink.session_start(&e).await,
                        other => Err(kind_mismatch(OperationKind::SessionStart, &other)),
                    }
                }
            })
            .handler(OperationKind::AudioEvent, move |event| {
                let sink = audio_sink.clone();
                async move {
                    match event {
                        DeliveryPayload::AudioEvent(e) => sink.audio_event(&e).await,
                        other => Err(kind_mismatch(OperationKind::AudioEvent, &other)),
                    }
                }
            })
            .handler(OperationKind::SessionEnd, move |event| {
                let sink = end_sink.clone();
                async move {
                    match event {
                        DeliveryPayload::SessionEnd(e) => sink.session_end(&e).await,
                        other => Err(kind_mismatch(OperationKind::SessionEnd, &other)),
                    }
                }
            })
            .build()
    }

    /// Register or replace a handler after construction, for owners of the
    /// state a payload writes to (the orchestrator registers the ledger and
    /// registry kinds this way).
    pub fn register_handler<F, Fut>(&self, kind: OperationKind, handler: F)
    where
        F: Fn(DeliveryPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, boxed_handler(handler));
        debug!(kind = %kind, "Delivery handler registered");
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Run `operation` up to `max_retries + 1` times with backoff.
    ///
    /// Returns `None` once every attempt failed; the outcome is counted in
    /// [`DeliveryPipeline::health`] either way.
    pub async fn execute_with_retry<T, F, Fut>(&self, context_label: &str, max_retries: u32, operation: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_execute(context_label, max_retries, operation).await.ok()
    }

    /// Like [`DeliveryPipeline::execute_with_retry`], running `fallback` on terminal failure.
    pub async fn execute_or_else<T, F, Fut, G>(
        &self,
        context_label: &str,
        max_retries: u32,
        operation: F,
        fallback: G,
    ) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce(DeliveryFailure) -> T,
    {
        match self.try_execute(context_label, max_retries, operation).await {
            Ok(value) => value,
            Err(failure) => fallback(failure),
        }
    }

    /// Retry loop that keeps the last error for callers that need to classify it.
    pub async fn try_execute<T, F, Fut>(
        &self,
        context_label: &str,
        max_retries: u32,
        mut operation: F,
    ) -> Result<T, DeliveryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.inner.policy.delay_for_attempt(attempt);
                debug!(label = %context_label, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(label = %context_label, attempts, "Operation recovered after retry");
                    }
                    self.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    let permanent = is_permanent(&err);
                    let message = format!("{:#}", err);
                    warn!(
                        label = %context_label,
                        attempt = attempts,
                        permanent,
                        error = %message,
                        "Operation attempt failed"
                    );
                    last_error = Some(err);
                    if permanent {
                        break;
                    }
                }
            }
        }

        self.record_failure();
        warn!(label = %context_label, attempts, "Operation failed after all retries");
        Err(DeliveryFailure {
            label: context_label.to_string(),
            attempts,
            last_error: last_error.unwrap_or_else(|| anyhow::anyhow!("operation was never attempted")),
        })
    }

    /// Deliver one payload: retry synchronously, then buffer and trigger a drain.
    pub async fn deliver(&self, event: DeliveryPayload) -> DeliveryOutcome {
        let kind = event.kind();
        let Some(handler) = self.handler_for(kind) else {
            error!(kind = %kind, durable_id = %event.durable_id(), "No handler for payload kind, dropping");
            self.stats().dropped += 1;
            return DeliveryOutcome::Unroutable;
        };

        let label = format!("deliver.{}", kind);
        let attempt_event = event.clone();
        let delivered = self
            .execute_with_retry(&label, self.inner.policy.max_retries, || handler(attempt_event.clone()))
            .await;

        match delivered {
            Some(()) => DeliveryOutcome::Delivered,
            None => {
                let task_id = self.buffer(event);
                self.request_drain();
                DeliveryOutcome::Buffered { task_id }
            }
        }
    }

    /// Enqueue a payload for redelivery by the drain cycle and return its task id.
    pub fn buffer(&self, payload: DeliveryPayload) -> String {
        let task = DeliveryTask::new(payload);
        let task_id = task.task_id.clone();
        let kind = task.operation_kind;
        let durable_id = task.payload.durable_id().to_string();

        let (evicted, queue_size) = {
            let mut queue = self.queue();
            let mut evicted = Vec::new();
            while queue.len() >= self.inner.limits.max_buffer_size {
                match queue.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            queue.push_back(task);
            (evicted, queue.len())
        };

        {
            let mut stats = self.stats();
            stats.total_buffered += 1;
            stats.dropped += evicted.len() as u64;
        }
        for oldest in &evicted {
            warn!(
                task_id = %oldest.task_id,
                kind = %oldest.operation_kind,
                durable_id = %oldest.payload.durable_id(),
                "Delivery buffer full, evicting oldest task"
            );
        }

        info!(task_id = %task_id, kind = %kind, durable_id = %durable_id, queue_size, "Payload buffered for redelivery");
        task_id
    }

    /// Spawn a drain on the current runtime. A no-op outside a runtime.
    pub fn request_drain(&self) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pipeline = self.clone();
            runtime.spawn(async move {
                pipeline.drain().await;
            });
        }
    }

    /// Retry every buffered task once.
    ///
    /// Returns `None` without doing anything if another drain is in progress.
    pub async fn drain(&self) -> Option<DrainReport> {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already in progress");
            return None;
        }
        let _guard = DrainGuard(&self.inner.draining);

        let batch: Vec<DeliveryTask> = self.queue().drain(..).collect();
        let mut report = DrainReport::default();
        if batch.is_empty() {
            return Some(report);
        }

        let mut retained = Vec::new();
        for mut task in batch {
            report.attempted += 1;
            let result = match self.handler_for(task.operation_kind) {
                Some(handler) => handler(task.payload.clone()).await,
                None => Err(permanent(anyhow::anyhow!("no handler for {}", task.operation_kind))),
            };

            match result {
                Ok(()) => {
                    report.delivered += 1;
                    self.record_success();
                    debug!(task_id = %task.task_id, kind = %task.operation_kind, "Buffered task delivered");
                }
                Err(err) => {
                    task.attempt_count += 1;
                    task.last_error = Some(format!("{:#}", err));
                    if task.attempt_count > self.inner.limits.max_task_attempts || is_permanent(&err) {
                        report.dropped += 1;
                        self.stats().dropped += 1;
                        error!(
                            task_id = %task.task_id,
                            kind = %task.operation_kind,
                            durable_id = %task.payload.durable_id(),
                            attempts = task.attempt_count,
                            last_error = ?task.last_error,
                            "Dropping delivery task after exceeding retry cap"
                        );
                    } else {
                        report.requeued += 1;
                        retained.push(task);
                    }
                }
            }
        }

        if !retained.is_empty() {
            // Failed tasks go back ahead of anything enqueued while we were draining
            let mut overflow = 0;
            {
                let mut queue = self.queue();
                for task in retained.into_iter().rev() {
                    queue.push_front(task);
                }
                while queue.len() > self.inner.limits.max_buffer_size {
                    queue.pop_front();
                    overflow += 1;
                }
            }
            if overflow > 0 {
                report.dropped += overflow;
                self.stats().dropped += overflow as u64;
                warn!(overflow, "Delivery buffer over capacity after drain, evicted oldest tasks");
            }
        }

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            requeued = report.requeued,
            dropped = report.dropped,
            "Drain cycle finished"
        );
        Some(report)
    }

    /// Drain on a fixed interval until the returned task is aborted.
    pub fn spawn_drain_loop(&self, interval: Duration) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pipeline.queue_size() > 0 {
                    pipeline.drain().await;
                }
            }
        })
    }

    pub fn queue_size(&self) -> usize {
        self.queue().len()
    }

    pub fn health(&self) -> DeliveryHealth {
        let queue_size = self.queue_size();
        let stats = self.stats();
        DeliveryHealth {
            total: stats.total,
            success: stats.success,
            failed: stats.failed,
            buffered: queue_size,
            dropped: stats.dropped,
            total_buffered: stats.total_buffered,
            queue_size,
            error_rate: if stats.total > 0 {
                stats.failed as f64 / stats.total as f64
            } else {
                0.0
            },
            last_success_at: stats.last_success_at,
            last_failure_at: stats.last_failure_at,
            draining: self.inner.draining.load(Ordering::SeqCst),
        }
    }

    fn handler_for(&self, kind: OperationKind) -> Option<DeliveryHandler> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    fn record_success(&self) {
        let mut stats = self.stats();
        stats.total += 1;
        stats.success += 1;
        stats.last_success_at = Some(Utc::now());
    }

    fn record_failure(&self) {
        let mut stats = self.stats();
        stats.total += 1;
        stats.failed += 1;
        stats.last_failure_at = Some(Utc::now());
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<DeliveryTask>> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, DeliveryStats> {
        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn boxed_handler<F, Fut>(handler: F) -> DeliveryHandler
where
    F: Fn(DeliveryPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(handler(event)) as BoxFuture<'static, Result<()>>)
}

fn kind_mismatch(expected: OperationKind, event: &DeliveryPayload) -> anyhow::Error {
    permanent(anyhow::anyhow!(
        "{} handler received {} payload for {}",
        expected,
        event.kind(),
        event.durable_id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::sink::MemoryTelemetrySink;
    use crate::delivery::task::{AudioTelemetry, LedgerDebitRequest};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_retries: 3,
        }
    }

    fn audio(durable_id: &str) -> DeliveryPayload {
        DeliveryPayload::AudioEvent(AudioTelemetry {
            durable_id: durable_id.to_string(),
            event_type: "transcript".to_string(),
            role: Some("user".to_string()),
            text: Some("hello".to_string()),
            occurred_at: Utc::now(),
        })
    }

    fn pipeline(limits: BufferLimits) -> (DeliveryPipeline, Arc<MemoryTelemetrySink>) {
        let sink = Arc::new(MemoryTelemetrySink::new());
        (DeliveryPipeline::with_sink(fast_policy(), limits, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_recovers_on_third_attempt() {
        let (pipeline, _) = pipeline(BufferLimits::default());
        let calls = AtomicU32::new(0);

        let result = pipeline
            .execute_with_retry("test.flaky", 3, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        anyhow::bail!("attempt {} failed", n)
                    }
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Some(3));
        let health = pipeline.health();
        assert_eq!(health.success, 1);
        assert_eq!(health.failed, 0);
        assert_eq!(health.buffered, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_none_and_counts_failure() {
        let (pipeline, _) = pipeline(BufferLimits::default());
        let calls = AtomicU32::new(0);

        let result: Option<()> = pipeline
            .execute_with_retry("test.down", 3, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("down") }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let health = pipeline.health();
        assert_eq!(health.failed, 1);
        assert_eq!(health.error_rate, 1.0);
        assert!(health.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_permanent_errors_skip_retries() {
        let (pipeline, _) = pipeline(BufferLimits::default());
        let calls = AtomicU32::new(0);

        let failure = pipeline
            .try_execute("test.logic", 3, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(permanent(anyhow::anyhow!("bad transition"))) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert!(is_permanent(&failure.last_error));
    }

    #[tokio::test]
    async fn test_buffered_task_drains_after_outage() {
        let (pipeline, sink) = pipeline(BufferLimits::default());
        let before = pipeline.health().buffered;

        sink.fail_next(4);
        let event = audio("d1");
        let delivered = pipeline
            .execute_with_retry("telemetry.audio_event", 3, || {
                let sink = sink.clone();
                let event = event.clone();
                async move {
                    match event {
                        DeliveryPayload::AudioEvent(e) => sink.audio_event(&e).await,
                        _ => unreachable!(),
                    }
                }
            })
            .await;
        assert!(delivered.is_none());

        pipeline.buffer(event);
        assert_eq!(pipeline.health().buffered, before + 1);

        let report = pipeline.drain().await.unwrap();
        assert_eq!(report.delivered, 1);

        let health = pipeline.health();
        assert_eq!(health.buffered, before);
        assert_eq!(health.success, 1);
        assert_eq!(sink.count(OperationKind::AudioEvent), 1);
    }

    #[tokio::test]
    async fn test_deliver_buffers_and_retriggers_drain() {
        let (pipeline, sink) = pipeline(BufferLimits::default());
        sink.fail_next(4);

        let outcome = pipeline.deliver(audio("d1")).await;
        assert!(matches!(outcome, DeliveryOutcome::Buffered { .. }));

        // The drain requested by deliver() runs once we yield
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pipeline.health().buffered, 0);
        assert_eq!(sink.count(OperationKind::AudioEvent), 1);
    }

    #[tokio::test]
    async fn test_task_dropped_after_cap() {
        let (pipeline, sink) = pipeline(BufferLimits { max_task_attempts: 2, max_buffer_size: 10 });
        sink.fail_next(100);
        pipeline.buffer(audio("d1"));

        assert_eq!(pipeline.drain().await.unwrap().requeued, 1);
        assert_eq!(pipeline.drain().await.unwrap().requeued, 1);
        let report = pipeline.drain().await.unwrap();
        assert_eq!(report.dropped, 1);

        let health = pipeline.health();
        assert_eq!(health.dropped, 1);
        assert_eq!(health.queue_size, 0);
        assert_eq!(health.total_buffered, 1);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let (pipeline, sink) = pipeline(BufferLimits { max_task_attempts: 5, max_buffer_size: 2 });
        pipeline.buffer(audio("oldest"));
        pipeline.buffer(audio("middle"));
        pipeline.buffer(audio("newest"));

        let health = pipeline.health();
        assert_eq!(health.queue_size, 2);
        assert_eq!(health.dropped, 1);
        assert_eq!(health.total_buffered, 3);

        pipeline.drain().await.unwrap();
        let delivered: Vec<String> = sink.events().iter().map(|e| e.durable_id().to_string()).collect();
        assert_eq!(delivered, vec!["middle", "newest"]);
    }

    #[tokio::test]
    async fn test_single_drain_in_flight() {
        let gate = Arc::new(Notify::new());
        let handler_gate = gate.clone();
        let pipeline = DeliveryPipeline::builder(fast_policy(), BufferLimits::default())
            .handler(OperationKind::AudioEvent, move |_event| {
                let gate = handler_gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })
            .build();
        pipeline.buffer(audio("d1"));

        let background = pipeline.clone();
        let running = tokio::spawn(async move { background.drain().await });
        tokio::task::yield_now().await;

        assert!(pipeline.health().draining);
        assert!(pipeline.drain().await.is_none());

        gate.notify_one();
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert!(!pipeline.health().draining);
    }

    #[tokio::test]
    async fn test_registered_handler_replays_state_writes() {
        let (pipeline, _) = pipeline(BufferLimits::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        pipeline.register_handler(OperationKind::LedgerDebit, move |_payload| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::bail!("ledger down")
                }
                Ok(())
            }
        });

        pipeline.buffer(DeliveryPayload::LedgerDebit(LedgerDebitRequest {
            identity_key: "10.0.0.1|fp".to_string(),
            durable_id: Some("d1".to_string()),
            consumed_units: 2,
            dedup_token: "d1".to_string(),
        }));
        assert_eq!(pipeline.drain().await.unwrap().requeued, 1);
        assert_eq!(pipeline.drain().await.unwrap().delivered, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_unroutable() {
        let pipeline = DeliveryPipeline::builder(fast_policy(), BufferLimits::default()).build();
        assert_eq!(pipeline.deliver(audio("d1")).await, DeliveryOutcome::Unroutable);
        assert_eq!(pipeline.health().dropped, 1);
    }

    #[test]
    fn test_error_rate_zero_without_traffic() {
        let (pipeline, _) = pipeline(BufferLimits::default());
        let health = pipeline.health();
        assert_eq!(health.total, 0);
        assert_eq!(health.error_rate, 0.0);
    }
}
