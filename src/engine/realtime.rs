//! Realtime speech engine client.
//!
//! Credentials come from `POST {api_base_url}/realtime/sessions`; events are
//! read from `{realtime_ws_url}?model=...` over a WebSocket authenticated with
//! the ephemeral token.

use crate::config::EngineConfig;
use crate::engine::{ConversationalEngine, EngineError, EngineEvent, EngineSessionConfig, EphemeralCredential, SpeakerRole};
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Provider error types after which the session cannot continue.
const FATAL_ERROR_TYPES: [&str; 2] = ["server_error", "session_expired"];

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
    client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    expires_at: Option<i64>,
}

pub struct RealtimeEngine {
    client: reqwest::Client,
    config: EngineConfig,
    event_capacity: usize,
}

impl RealtimeEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| EngineError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        })
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    fn session_body(&self, session: &EngineSessionConfig) -> Value {
        let instructions = session
            .instructions
            .clone()
            .unwrap_or_else(|| self.config.instructions.clone());

        json!({
            "model": self.config.model,
            "voice": self.config.voice,
            "instructions": instructions,
            "input_audio_transcription": { "model": "whisper-1" },
        })
    }
}

#[async_trait]
impl ConversationalEngine for RealtimeEngine {
    async fn issue_credential(&self, session: &EngineSessionConfig) -> Result<EphemeralCredential, EngineError> {
        if self.config.api_key.is_empty() {
            return Err(EngineError::Unavailable("engine API key is not configured".to_string()));
        }

        let url = format!("{}/realtime/sessions", self.config.api_base_url.trim_end_matches('/'));
        debug!(durable_id = %session.durable_id, url = %url, "Requesting ephemeral credential");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.session_body(session))
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Unavailable(format!("credential request returned {}: {}", status, body)));
        }

        let created: CreatedSession = response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(format!("invalid credential response: {}", e)))?;

        info!(
            durable_id = %session.durable_id,
            provider_session_id = %created.id,
            "Ephemeral credential issued"
        );

        Ok(EphemeralCredential {
            token: created.client_secret.value,
            provider_session_id: created.id,
            expires_at: created
                .client_secret
                .expires_at
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        })
    }

    async fn open_event_stream(&self, credential: &EphemeralCredential) -> Result<mpsc::Receiver<EngineEvent>, EngineError> {
        let url = format!("{}?model={}", self.config.realtime_ws_url, self.config.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| EngineError::Protocol(format!("invalid realtime URL: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|e| EngineError::Protocol(format!("invalid credential token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| EngineError::Unavailable(format!("realtime connect failed: {}", e)))?;
        info!(provider_session_id = %credential.provider_session_id, "Realtime event stream opened");

        let (tx, rx) = mpsc::channel(self.event_capacity);
        let provider_session_id = credential.provider_session_id.clone();
        let (mut writer, mut reader) = socket.split();

        tokio::spawn(async move {
            let mut close_reason = None;
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(provider_session_id = %provider_session_id, "Event receiver dropped, closing transport");
                        let _ = writer.send(Message::Close(None)).await;
                        return;
                    }
                    message = reader.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_engine_event(&text) {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            close_reason = frame.map(|f| f.reason.to_string());
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(provider_session_id = %provider_session_id, error = %e, "Realtime transport error");
                            close_reason = Some(e.to_string());
                            break;
                        }
                        None => break,
                    }
                }
            }
            info!(provider_session_id = %provider_session_id, reason = ?close_reason, "Realtime event stream closed");
            let _ = tx.send(EngineEvent::SessionClosed { reason: close_reason }).await;
        });

        Ok(rx)
    }
}

/// Map one provider JSON event to an [`EngineEvent`]. Unknown events yield `None`.
pub fn parse_engine_event(raw: &str) -> Option<EngineEvent> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let text_at = |pointer: &str| value.pointer(pointer).and_then(Value::as_str).map(str::to_string);

    match value.get("type")?.as_str()? {
        "session.created" => Some(EngineEvent::SessionCreated {
            provider_session_id: text_at("/session/id")?,
        }),
        "conversation.item.input_audio_transcription.completed" => Some(EngineEvent::TranscriptFragment {
            role: SpeakerRole::User,
            text: text_at("/transcript")?,
            is_final: true,
        }),
        "response.audio_transcript.delta" => Some(EngineEvent::TranscriptFragment {
            role: SpeakerRole::Assistant,
            text: text_at("/delta")?,
            is_final: false,
        }),
        "response.audio_transcript.done" => Some(EngineEvent::TranscriptFragment {
            role: SpeakerRole::Assistant,
            text: text_at("/transcript")?,
            is_final: true,
        }),
        "error" => {
            let error_type = text_at("/error/type").unwrap_or_else(|| "unknown".to_string());
            let code = text_at("/error/code").unwrap_or_else(|| error_type.clone());
            Some(EngineEvent::Error {
                fatal: FATAL_ERROR_TYPES.contains(&error_type.as_str()) || FATAL_ERROR_TYPES.contains(&code.as_str()),
                message: text_at("/error/message").unwrap_or_default(),
                code,
            })
        }
        _ => None,
    }
}
