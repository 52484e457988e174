//! # Conversational Engine
//!
//! Contract with the external realtime speech engine. The engine issues a
//! short-lived credential for one session and then streams typed events for it.
//!
//! ## Modules:
//! - **realtime**: HTTP credential issuance plus a WebSocket event reader

pub mod realtime;

#[cfg(test)]
pub(crate) mod testing;

use crate::session::SessionMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use realtime::{parse_engine_event, RealtimeEngine};

/// Per-session configuration sent with the credential request.
#[derive(Debug, Clone, Default)]
pub struct EngineSessionConfig {
    pub durable_id: String,
    /// Overrides the configured instructions when set
    pub instructions: Option<String>,
    pub metadata: SessionMetadata,
}

/// Short-lived credential for one realtime transport session.
#[derive(Debug, Clone, Serialize)]
pub struct EphemeralCredential {
    pub token: String,
    pub provider_session_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    User,
    Assistant,
}

impl SpeakerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerRole::User => "user",
            SpeakerRole::Assistant => "assistant",
        }
    }
}

/// Events the engine emits for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionCreated {
        provider_session_id: String,
    },
    TranscriptFragment {
        role: SpeakerRole,
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    Error {
        code: String,
        message: String,
        #[serde(default)]
        fatal: bool,
    },
    SessionClosed {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl EngineEvent {
    /// Whether this event terminates the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::SessionClosed { .. } | EngineEvent::Error { fatal: true, .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected engine response: {0}")]
    Protocol(String),

    #[error("engine did not respond within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ConversationalEngine: Send + Sync {
    /// Request an ephemeral credential for a new session.
    async fn issue_credential(&self, config: &EngineSessionConfig) -> Result<EphemeralCredential, EngineError>;

    /// Open the event stream for an issued credential.
    ///
    /// The stream ends with `SessionClosed` when the transport closes.
    async fn open_event_stream(&self, credential: &EphemeralCredential) -> Result<mpsc::Receiver<EngineEvent>, EngineError>;
}
