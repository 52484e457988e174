//! Telemetry sinks: where delivered telemetry ends up.

use crate::delivery::task::{AudioTelemetry, DeliveryPayload, OperationKind, SessionEndTelemetry, SessionStartTelemetry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Backing store for session telemetry and billing events.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn session_start(&self, event: &SessionStartTelemetry) -> Result<()>;
    async fn audio_event(&self, event: &AudioTelemetry) -> Result<()>;
    async fn session_end(&self, event: &SessionEndTelemetry) -> Result<()>;
}

/// Posts each event as JSON to `{base_url}/{operation_kind}`.
pub struct HttpTelemetrySink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTelemetrySink {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build telemetry HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: serde::Serialize + Sync>(&self, kind: OperationKind, body: &T) -> Result<()> {
        let url = format!("{}/{}", self.base_url, kind.as_str());
        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("telemetry request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("telemetry store rejected {}", kind))?;
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn session_start(&self, event: &SessionStartTelemetry) -> Result<()> {
        self.post(OperationKind::SessionStart, event).await
    }

    async fn audio_event(&self, event: &AudioTelemetry) -> Result<()> {
        self.post(OperationKind::AudioEvent, event).await
    }

    async fn session_end(&self, event: &SessionEndTelemetry) -> Result<()> {
        self.post(OperationKind::SessionEnd, event).await
    }
}

/// Keeps delivered events in memory. Used when no sink URL is configured, and by tests.
#[derive(Default)]
pub struct MemoryTelemetrySink {
    events: Mutex<Vec<DeliveryPayload>>,
    failures_pending: AtomicU32,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<DeliveryPayload> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, kind: OperationKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    fn record(&self, event: DeliveryPayload) -> Result<()> {
        if self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("telemetry store unavailable (injected)");
        }
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetrySink {
    async fn session_start(&self, event: &SessionStartTelemetry) -> Result<()> {
        self.record(DeliveryPayload::SessionStart(event.clone()))
    }

    async fn audio_event(&self, event: &AudioTelemetry) -> Result<()> {
        self.record(DeliveryPayload::AudioEvent(event.clone()))
    }

    async fn session_end(&self, event: &SessionEndTelemetry) -> Result<()> {
        self.record(DeliveryPayload::SessionEnd(event.clone()))
    }
}
