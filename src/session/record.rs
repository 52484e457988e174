//! # Durable Session Records
//!
//! A [`SessionRecord`] is written before any ephemeral credential is requested
//! from the external engine, so telemetry and billing always have a local row
//! to attach to.
//!
//! ## Status Lifecycle:
//! ```text
//! PENDING_LINK ──link──▶ LINKED ──▶ ACTIVE ──▶ ENDING ──▶ ENDED
//!      │                   │                     │
//!      └──────▶ ABORTED ◀──┘─────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque caller-supplied key/value context (member profile, locale, ...).
pub type SessionMetadata = HashMap<String, serde_json::Value>;

/// Persistent status of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    PendingLink,
    Linked,
    Active,
    Ending,
    Ended,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::PendingLink => "PENDING_LINK",
            SessionStatus::Linked => "LINKED",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Ending => "ENDING",
            SessionStatus::Ended => "ENDED",
            SessionStatus::Aborted => "ABORTED",
        }
    }

    /// The legal transition table. Anything not listed here is a programming error.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (PendingLink, Linked)
                | (PendingLink, Aborted)
                | (Linked, Active)
                | (Linked, Aborted)
                | (Active, Ending)
                | (Ending, Ended)
                | (Ending, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Aborted)
    }

    /// Statuses in which an external session id must be present.
    pub fn carries_external_id(&self) -> bool {
        matches!(
            self,
            SessionStatus::Linked | SessionStatus::Active | SessionStatus::Ending | SessionStatus::Ended
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the durable session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub durable_id: String,
    pub identity_key: String,
    pub external_session_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: SessionMetadata,
}

impl SessionRecord {
    pub fn new(durable_id: String, identity_key: String, metadata: SessionMetadata) -> Self {
        Self {
            durable_id,
            identity_key,
            external_session_id: None,
            status: SessionStatus::PendingLink,
            created_at: Utc::now(),
            ended_at: None,
            metadata,
        }
    }

    /// `external_session_id` is set exactly when the status says it should be.
    pub fn is_consistent(&self) -> bool {
        self.external_session_id.is_some() == self.status.carries_external_id()
    }
}
