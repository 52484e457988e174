//! # Application State
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## Contents:
//! - **config**: the loaded configuration (read-only after startup)
//! - **metrics**: per-endpoint request counters, updated by middleware
//! - **orchestrator**: the session orchestrator; it owns the ledger, the
//!   registry and the delivery pipeline
//!
//! Every field is cheap to clone; clones share the same underlying data.

use crate::config::AppConfig;
use crate::orchestrator::SessionOrchestrator;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[cfg(test)]
use crate::{
    delivery::{BufferLimits, DeliveryPipeline, MemoryTelemetrySink, RetryPolicy},
    engine::ConversationalEngine,
    orchestrator::SessionSettings,
    session::{QuotaLedger, QuotaPolicy, QuotaState, SessionRecord, SessionRegistry},
    storage::MemoryStore,
};
#[cfg(test)]
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, written on every request by the middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub orchestrator: SessionOrchestrator,

    pub start_time: Instant,
}

/// Request metrics collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: SessionOrchestrator) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            orchestrator,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Sessions currently between admission and end.
    pub fn live_sessions(&self) -> usize {
        self.orchestrator.live_sessions()
    }

    /// In-memory state around the given engine, with fast retries and a
    /// ten-credit daily quota.
    #[cfg(test)]
    pub(crate) fn for_tests(engine: Arc<dyn ConversationalEngine>) -> Self {
        let config = AppConfig::default();
        let quota_store: Arc<MemoryStore<QuotaState>> = Arc::new(MemoryStore::new());
        let record_store: Arc<MemoryStore<SessionRecord>> = Arc::new(MemoryStore::new());
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_retries: 2,
        };

        let ledger = QuotaLedger::new(
            quota_store,
            QuotaPolicy { max_credits: 10, window: chrono::Duration::hours(24) },
        );
        let registry = SessionRegistry::new(record_store);
        let pipeline = DeliveryPipeline::with_sink(
            retry,
            BufferLimits::default(),
            Arc::new(MemoryTelemetrySink::new()),
        );
        let settings = SessionSettings::from(&config);
        let orchestrator = SessionOrchestrator::new(ledger, registry, pipeline, engine, settings);

        Self::new(config, orchestrator)
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
