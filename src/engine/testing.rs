//! Scripted engine for orchestrator tests.

use crate::engine::{ConversationalEngine, EngineError, EngineEvent, EngineSessionConfig, EphemeralCredential};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct FakeEngine {
    fail_credentials: AtomicBool,
    credential_delay: Mutex<Option<Duration>>,
    close_on_open: AtomicBool,
    credentials_issued: AtomicU32,
    streams: Mutex<HashMap<String, mpsc::Sender<EngineEvent>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_credentials(&self, fail: bool) {
        self.fail_credentials.store(fail, Ordering::SeqCst);
    }

    pub fn delay_credentials(&self, delay: Duration) {
        *self.credential_delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Report the session closed before the orchestrator gets to link it.
    pub fn close_on_open(&self, close: bool) {
        self.close_on_open.store(close, Ordering::SeqCst);
    }

    pub fn credentials_issued(&self) -> u32 {
        self.credentials_issued.load(Ordering::SeqCst)
    }

    pub fn provider_id(durable_id: &str) -> String {
        format!("ext-{}", durable_id)
    }

    /// Push an event onto the stream opened for `durable_id`.
    pub async fn emit(&self, durable_id: &str, event: EngineEvent) {
        let sender = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::provider_id(durable_id))
            .cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl ConversationalEngine for FakeEngine {
    async fn issue_credential(&self, config: &EngineSessionConfig) -> Result<EphemeralCredential, EngineError> {
        let delay = *self.credential_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_credentials.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("credential service down".to_string()));
        }
        self.credentials_issued.fetch_add(1, Ordering::SeqCst);
        Ok(EphemeralCredential {
            token: format!("ek_{}", config.durable_id),
            provider_session_id: Self::provider_id(&config.durable_id),
            expires_at: None,
        })
    }

    async fn open_event_stream(&self, credential: &EphemeralCredential) -> Result<mpsc::Receiver<EngineEvent>, EngineError> {
        let (tx, rx) = mpsc::channel(16);
        let _ = tx
            .send(EngineEvent::SessionCreated {
                provider_session_id: credential.provider_session_id.clone(),
            })
            .await;
        if self.close_on_open.load(Ordering::SeqCst) {
            let _ = tx.send(EngineEvent::SessionClosed { reason: Some("provider hangup".to_string()) }).await;
        }
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(credential.provider_session_id.clone(), tx);
        Ok(rx)
    }
}
