//! Delivery payloads, buffered delivery tasks and engine-event routing.
//!
//! Payloads are telemetry for the sink, or ledger and registry writes that
//! exhausted their inline retries. Everything is keyed by the local
//! `durable_id`, never by the provider's session id.

use crate::engine::EngineEvent;
use crate::session::{SessionMetadata, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outbound operation kinds: three telemetry writes plus the two state
/// writes that must survive a storage outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    SessionStart,
    AudioEvent,
    SessionEnd,
    LedgerDebit,
    SessionStatus,
}

impl OperationKind {
    /// Kinds a telemetry sink handles.
    pub const TELEMETRY: [OperationKind; 3] = [
        OperationKind::SessionStart,
        OperationKind::AudioEvent,
        OperationKind::SessionEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::SessionStart => "session_start",
            OperationKind::AudioEvent => "audio_event",
            OperationKind::SessionEnd => "session_end",
            OperationKind::LedgerDebit => "ledger_debit",
            OperationKind::SessionStatus => "session_status",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserCancelled,
    Timeout,
    EngineClosed,
    EngineError,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserCancelled => "user_cancelled",
            EndReason::Timeout => "timeout",
            EndReason::EngineClosed => "engine_closed",
            EndReason::EngineError => "engine_error",
            EndReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_cancelled" => Ok(EndReason::UserCancelled),
            "timeout" => Ok(EndReason::Timeout),
            "engine_closed" => Ok(EndReason::EngineClosed),
            "engine_error" => Ok(EndReason::EngineError),
            "shutdown" => Ok(EndReason::Shutdown),
            other => Err(format!("unknown end reason: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStartTelemetry {
    pub durable_id: String,
    pub identity_key: String,
    pub external_session_id: String,
    pub metadata: SessionMetadata,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTelemetry {
    pub durable_id: String,
    pub event_type: String,
    pub role: Option<String>,
    pub text: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEndTelemetry {
    pub durable_id: String,
    pub reason: EndReason,
    pub duration_secs: f64,
    pub consumed_units: u32,
    pub ended_at: DateTime<Utc>,
}

/// Quota debit (or zero-unit release) replayed until the ledger takes it.
///
/// `dedup_token` is the session's `durable_id`, or a one-off release token when
/// no record was ever created, so a replay after a lost acknowledgement is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDebitRequest {
    pub identity_key: String,
    pub durable_id: Option<String>,
    pub consumed_units: u32,
    pub dedup_token: String,
}

/// Registry status write replayed until the record reaches `target`
/// (`ENDED` or `ABORTED`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusRequest {
    pub durable_id: String,
    pub target: SessionStatus,
}

/// A strongly-typed outbound payload; its variant decides the operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryPayload {
    SessionStart(SessionStartTelemetry),
    AudioEvent(AudioTelemetry),
    SessionEnd(SessionEndTelemetry),
    LedgerDebit(LedgerDebitRequest),
    SessionStatus(SessionStatusRequest),
}

impl DeliveryPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            DeliveryPayload::SessionStart(_) => OperationKind::SessionStart,
            DeliveryPayload::AudioEvent(_) => OperationKind::AudioEvent,
            DeliveryPayload::SessionEnd(_) => OperationKind::SessionEnd,
            DeliveryPayload::LedgerDebit(_) => OperationKind::LedgerDebit,
            DeliveryPayload::SessionStatus(_) => OperationKind::SessionStatus,
        }
    }

    /// Session the payload belongs to; a release with no record falls back to its token.
    pub fn durable_id(&self) -> &str {
        match self {
            DeliveryPayload::SessionStart(e) => &e.durable_id,
            DeliveryPayload::AudioEvent(e) => &e.durable_id,
            DeliveryPayload::SessionEnd(e) => &e.durable_id,
            DeliveryPayload::LedgerDebit(e) => e.durable_id.as_deref().unwrap_or(&e.dedup_token),
            DeliveryPayload::SessionStatus(e) => &e.durable_id,
        }
    }
}

/// A write that exhausted its synchronous retries and waits in the buffer.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub task_id: String,
    pub operation_kind: OperationKind,
    pub payload: DeliveryPayload,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl DeliveryTask {
    pub fn new(payload: DeliveryPayload) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            operation_kind: payload.kind(),
            payload,
            attempt_count: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Map an engine event to the telemetry it produces, if any.
///
/// `SessionClosed` produces nothing here: it ends the session, and the end
/// path emits `SESSION_END` itself.
pub fn route_engine_event(durable_id: &str, event: &EngineEvent) -> Option<DeliveryPayload> {
    let occurred_at = Utc::now();
    let audio = |event_type: &str, role: Option<String>, text: Option<String>| {
        DeliveryPayload::AudioEvent(AudioTelemetry {
            durable_id: durable_id.to_string(),
            event_type: event_type.to_string(),
            role,
            text,
            occurred_at,
        })
    };

    match event {
        EngineEvent::SessionCreated { provider_session_id } => {
            Some(audio("session_created", None, Some(provider_session_id.clone())))
        }
        EngineEvent::TranscriptFragment { role, text, is_final } => {
            let event_type = if *is_final { "transcript" } else { "transcript_partial" };
            Some(audio(event_type, Some(role.as_str().to_string()), Some(text.clone())))
        }
        EngineEvent::Error { code, message, .. } => {
            Some(audio("engine_error", None, Some(format!("{}: {}", code, message))))
        }
        EngineEvent::SessionClosed { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SpeakerRole;

    #[test]
    fn test_routing_keys_by_durable_id() {
        let event = EngineEvent::TranscriptFragment {
            role: SpeakerRole::User,
            text: "two sets of ten".into(),
            is_final: true,
        };
        let routed = route_engine_event("durable-1", &event).unwrap();
        assert_eq!(routed.kind(), OperationKind::AudioEvent);
        assert_eq!(routed.durable_id(), "durable-1");

        let created = EngineEvent::SessionCreated { provider_session_id: "sess_ext".into() };
        assert_eq!(route_engine_event("durable-1", &created).unwrap().durable_id(), "durable-1");

        let closed = EngineEvent::SessionClosed { reason: None };
        assert!(route_engine_event("durable-1", &closed).is_none());
    }

    #[test]
    fn test_end_reason_round_trip_names() {
        for reason in [
            EndReason::UserCancelled,
            EndReason::Timeout,
            EndReason::EngineClosed,
            EndReason::EngineError,
            EndReason::Shutdown,
        ] {
            assert_eq!(reason.as_str().parse::<EndReason>().unwrap(), reason);
        }
        assert!("later".parse::<EndReason>().is_err());
    }

    #[test]
    fn test_new_task_takes_kind_from_payload() {
        let task = DeliveryTask::new(DeliveryPayload::SessionEnd(SessionEndTelemetry {
            durable_id: "d".into(),
            reason: EndReason::Timeout,
            duration_secs: 1.0,
            consumed_units: 1,
            ended_at: Utc::now(),
        }));
        assert_eq!(task.operation_kind, OperationKind::SessionEnd);
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn test_release_without_record_is_keyed_by_token() {
        let release = DeliveryPayload::LedgerDebit(LedgerDebitRequest {
            identity_key: "10.0.0.1|fp".into(),
            durable_id: None,
            consumed_units: 0,
            dedup_token: "release-1".into(),
        });
        assert_eq!(release.kind(), OperationKind::LedgerDebit);
        assert_eq!(release.durable_id(), "release-1");

        let json = serde_json::to_value(DeliveryPayload::SessionStatus(SessionStatusRequest {
            durable_id: "d".into(),
            target: SessionStatus::Ended,
        }))
        .unwrap();
        assert_eq!(json["kind"], "session_status");
        assert_eq!(json["target"], "ENDED");
    }
}
