//! # Quota & Admission Ledger
//!
//! Per-identity credit and exclusivity bookkeeping. Every decision is a
//! compare-and-swap on the identity's [`QuotaState`], so two concurrent
//! admissions for the same identity can never both observe a free slot.
//!
//! ## Admission order (first match wins):
//! 1. `blocked` → `Blocked`
//! 2. `has_active_session` → `AlreadyActive`
//! 3. `remaining_credits == 0` → `QuotaExhausted` (with `reset_at`)
//! 4. otherwise reserve the slot and admit
//!
//! Storage failures during admission reject with `LedgerUnavailable`: the
//! ledger fails closed.

use crate::config::QuotaConfig;
use crate::storage::{StorageError, VersionedStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_CAS_ATTEMPTS: usize = 8;

/// Debit tokens remembered per identity, so a late replay of an older debit is still recognised.
const DEBIT_TOKEN_HISTORY: usize = 16;

/// Why an admission request was refused. Closed set; callers map it to user-facing messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionRejection {
    Blocked,
    AlreadyActive,
    QuotaExhausted { reset_at: DateTime<Utc> },
    LedgerUnavailable,
}

impl AdmissionRejection {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionRejection::Blocked => "BLOCKED",
            AdmissionRejection::AlreadyActive => "ALREADY_ACTIVE",
            AdmissionRejection::QuotaExhausted { .. } => "QUOTA_EXHAUSTED",
            AdmissionRejection::LedgerUnavailable => "LEDGER_UNAVAILABLE",
        }
    }
}

impl fmt::Display for AdmissionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of `check_and_reserve`.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<AdmissionRejection>,
    pub remaining_credits: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

impl AdmissionDecision {
    fn allow(state: &QuotaState) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_credits: state.remaining_credits,
            reset_at: Some(state.window_reset_at),
        }
    }

    fn reject(reason: AdmissionRejection, state: Option<&QuotaState>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            remaining_credits: state.map_or(0, |s| s.remaining_credits),
            reset_at: state.map(|s| s.window_reset_at),
        }
    }
}

/// Stored quota row for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaState {
    pub identity_key: String,
    pub remaining_credits: u32,
    pub has_active_session: bool,
    pub blocked: bool,
    pub window_reset_at: DateTime<Utc>,

    /// Dedup token of the last applied debit; a repeat of it is ignored.
    pub last_debit_token: Option<String>,

    /// Most recent debit tokens, oldest first, including `last_debit_token`.
    #[serde(default)]
    pub recent_debit_tokens: Vec<String>,
}

impl QuotaState {
    fn fresh(identity_key: &str, policy: &QuotaPolicy, now: DateTime<Utc>) -> Self {
        Self {
            identity_key: identity_key.to_string(),
            remaining_credits: policy.max_credits,
            has_active_session: false,
            blocked: false,
            window_reset_at: now + policy.window,
            last_debit_token: None,
            recent_debit_tokens: Vec::new(),
        }
    }

    fn has_applied(&self, token: &str) -> bool {
        self.last_debit_token.as_deref() == Some(token) || self.recent_debit_tokens.iter().any(|t| t == token)
    }

    fn remember_debit(&mut self, token: &str) {
        self.last_debit_token = Some(token.to_string());
        self.recent_debit_tokens.push(token.to_string());
        if self.recent_debit_tokens.len() > DEBIT_TOKEN_HISTORY {
            let excess = self.recent_debit_tokens.len() - DEBIT_TOKEN_HISTORY;
            self.recent_debit_tokens.drain(..excess);
        }
    }

    /// Restore credits when the window has elapsed. Returns whether anything changed.
    fn reset_if_due(&mut self, policy: &QuotaPolicy, now: DateTime<Utc>) -> bool {
        if now < self.window_reset_at {
            return false;
        }
        self.remaining_credits = policy.max_credits;
        // Skip whole windows missed while idle, landing on the next future boundary
        while self.window_reset_at <= now {
            self.window_reset_at = self.window_reset_at + policy.window;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub max_credits: u32,
    pub window: Duration,
}

impl From<&QuotaConfig> for QuotaPolicy {
    fn from(config: &QuotaConfig) -> Self {
        Self {
            max_credits: config.max_credits,
            window: Duration::seconds(config.window_secs as i64),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("identity key must not be empty")]
    InvalidIdentity,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("too much write contention on quota for {0}")]
    Contention(String),
}

/// What a `debit` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    Applied { remaining_credits: u32 },
    Duplicate,
    UnknownIdentity,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn VersionedStore<QuotaState>>,
    policy: QuotaPolicy,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn VersionedStore<QuotaState>>, policy: QuotaPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Admit or reject a new session for `identity_key`, reserving the exclusivity slot on admit.
    pub async fn check_and_reserve(&self, identity_key: &str) -> Result<AdmissionDecision, LedgerError> {
        self.check_and_reserve_at(identity_key, Utc::now()).await
    }

    pub(crate) async fn check_and_reserve_at(
        &self,
        identity_key: &str,
        now: DateTime<Utc>,
    ) -> Result<AdmissionDecision, LedgerError> {
        if identity_key.trim().is_empty() {
            return Err(LedgerError::InvalidIdentity);
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.load(identity_key).await {
                Ok(current) => current,
                Err(err) => return Ok(self.fail_closed(identity_key, &err)),
            };
            let (version, mut state, mut changed) = match current {
                Some(v) => (Some(v.version), v.value, false),
                None => (None, QuotaState::fresh(identity_key, &self.policy, now), true),
            };
            changed |= state.reset_if_due(&self.policy, now);

            let decision = if state.blocked {
                AdmissionDecision::reject(AdmissionRejection::Blocked, Some(&state))
            } else if state.has_active_session {
                AdmissionDecision::reject(AdmissionRejection::AlreadyActive, Some(&state))
            } else if state.remaining_credits == 0 {
                AdmissionDecision::reject(
                    AdmissionRejection::QuotaExhausted { reset_at: state.window_reset_at },
                    Some(&state),
                )
            } else {
                state.has_active_session = true;
                changed = true;
                AdmissionDecision::allow(&state)
            };

            if !changed {
                self.log_decision(identity_key, &decision);
                return Ok(decision);
            }

            match self.store.store_if(identity_key, version, state).await {
                Ok(Some(_)) => {
                    self.log_decision(identity_key, &decision);
                    return Ok(decision);
                }
                Ok(None) => continue,
                Err(err) => return Ok(self.fail_closed(identity_key, &err)),
            }
        }

        // Every write lost a race; whoever won decides what this caller sees
        if let Ok(Some(current)) = self.store.load(identity_key).await {
            let state = current.value;
            let reason = if state.blocked {
                Some(AdmissionRejection::Blocked)
            } else if state.has_active_session {
                Some(AdmissionRejection::AlreadyActive)
            } else {
                None
            };
            if let Some(reason) = reason {
                let decision = AdmissionDecision::reject(reason, Some(&state));
                self.log_decision(identity_key, &decision);
                return Ok(decision);
            }
        }

        warn!(identity_key = %identity_key, "Quota contention exhausted, rejecting admission");
        Ok(AdmissionDecision::reject(AdmissionRejection::LedgerUnavailable, None))
    }

    /// Release the exclusivity slot and subtract `consumed_units`, floored at zero.
    ///
    /// A repeat of a recent `dedup_token` for this identity is a no-op, so a
    /// retried or replayed session end debits once.
    pub async fn debit(
        &self,
        identity_key: &str,
        consumed_units: u32,
        dedup_token: &str,
    ) -> Result<DebitOutcome, LedgerError> {
        if identity_key.trim().is_empty() {
            return Err(LedgerError::InvalidIdentity);
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.load(identity_key).await? else {
                warn!(identity_key = %identity_key, "Debit for identity with no quota state");
                return Ok(DebitOutcome::UnknownIdentity);
            };

            let mut state = current.value;
            if state.has_applied(dedup_token) {
                debug!(identity_key = %identity_key, token = %dedup_token, "Duplicate debit ignored");
                return Ok(DebitOutcome::Duplicate);
            }

            if consumed_units > state.remaining_credits {
                warn!(
                    identity_key = %identity_key,
                    consumed_units,
                    remaining_credits = state.remaining_credits,
                    "Session overran remaining quota, flooring credits at zero"
                );
            }
            state.remaining_credits = state.remaining_credits.saturating_sub(consumed_units);
            state.has_active_session = false;
            state.remember_debit(dedup_token);
            let remaining_credits = state.remaining_credits;

            if self.store.store_if(identity_key, Some(current.version), state).await?.is_some() {
                info!(identity_key = %identity_key, consumed_units, remaining_credits, "Quota debited");
                return Ok(DebitOutcome::Applied { remaining_credits });
            }
        }
        Err(LedgerError::Contention(identity_key.to_string()))
    }

    /// Restore credits if the identity's window has elapsed.
    pub async fn reset_if_due(&self, identity_key: &str) -> Result<(), LedgerError> {
        self.reset_if_due_at(identity_key, Utc::now()).await
    }

    pub(crate) async fn reset_if_due_at(&self, identity_key: &str, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.modify(identity_key, now, |state, policy| state.reset_if_due(policy, now))
            .await
            .map(|_| ())
    }

    /// Operator block/unblock.
    pub async fn set_blocked(&self, identity_key: &str, blocked: bool) -> Result<QuotaState, LedgerError> {
        let state = self
            .modify(identity_key, Utc::now(), |state, _| {
                let changed = state.blocked != blocked;
                state.blocked = blocked;
                changed
            })
            .await?;
        info!(identity_key = %identity_key, blocked, "Identity block flag updated");
        Ok(state)
    }

    pub async fn snapshot(&self, identity_key: &str) -> Result<Option<QuotaState>, LedgerError> {
        Ok(self.store.load(identity_key).await?.map(|v| v.value))
    }

    /// Load-or-initialise, mutate, store. `mutate` returns whether it changed the state.
    async fn modify<F>(&self, identity_key: &str, now: DateTime<Utc>, mut mutate: F) -> Result<QuotaState, LedgerError>
    where
        F: FnMut(&mut QuotaState, &QuotaPolicy) -> bool,
    {
        if identity_key.trim().is_empty() {
            return Err(LedgerError::InvalidIdentity);
        }
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.load(identity_key).await?;
            let (version, mut state, fresh) = match current {
                Some(v) => (Some(v.version), v.value, false),
                None => (None, QuotaState::fresh(identity_key, &self.policy, now), true),
            };
            if !mutate(&mut state, &self.policy) && !fresh {
                return Ok(state);
            }
            if self.store.store_if(identity_key, version, state.clone()).await?.is_some() {
                return Ok(state);
            }
        }
        Err(LedgerError::Contention(identity_key.to_string()))
    }

    fn fail_closed(&self, identity_key: &str, err: &StorageError) -> AdmissionDecision {
        warn!(identity_key = %identity_key, error = %err, "Ledger storage unavailable, failing closed");
        AdmissionDecision::reject(AdmissionRejection::LedgerUnavailable, None)
    }

    fn log_decision(&self, identity_key: &str, decision: &AdmissionDecision) {
        match &decision.reason {
            None => info!(
                identity_key = %identity_key,
                remaining_credits = decision.remaining_credits,
                "Admission granted"
            ),
            Some(reason) => warn!(identity_key = %identity_key, reason = %reason, "Admission rejected"),
        }
    }
}
