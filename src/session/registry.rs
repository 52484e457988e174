//! # Durable Session Registry
//!
//! Owns [`SessionRecord`] persistence. Writes for one `durable_id` are
//! serialized through the store's conditional update; different sessions never
//! contend with each other.
//!
//! ## Operations:
//! - **create**: new record in `PENDING_LINK`, must finish before a credential is requested
//! - **link**: attach the provider session id (`PENDING_LINK → LINKED`)
//! - **transition**: move along the legal status table
//! - **complete**: finish an active record (`ACTIVE → ENDING → ENDED`), resumable
//! - **cleanup**: mark an attempt `ABORTED` (kept for audit, never deleted)

use crate::session::record::{SessionMetadata, SessionRecord, SessionStatus};
use crate::storage::{StorageError, VersionedStore};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Bound on compare-and-swap retries for a single registry write.
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("session record not found: {0}")]
    NotFound(String),

    #[error("invalid session transition for {durable_id}: {from} -> {to}")]
    InvalidTransition {
        durable_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("too much write contention on session record {0}")]
    Contention(String),
}

impl RegistryError {
    /// Programming errors upstream; retrying them cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RegistryError::NotFound(_) | RegistryError::InvalidTransition { .. })
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn VersionedStore<SessionRecord>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn VersionedStore<SessionRecord>>) -> Self {
        Self { store }
    }

    /// Create a durable record in `PENDING_LINK` and return its id.
    pub async fn create(
        &self,
        identity_key: &str,
        metadata: SessionMetadata,
    ) -> Result<String, RegistryError> {
        let durable_id = Uuid::new_v4().to_string();
        let record = SessionRecord::new(durable_id.clone(), identity_key.to_string(), metadata);

        match self.store.store_if(&durable_id, None, record).await? {
            Some(_) => {
                debug!(durable_id = %durable_id, identity_key = %identity_key, "Session record created");
                Ok(durable_id)
            }
            None => Err(RegistryError::Contention(durable_id)),
        }
    }

    pub async fn get(&self, durable_id: &str) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self.store.load(durable_id).await?.map(|v| v.value))
    }

    /// Attach the provider-assigned session id.
    ///
    /// Linking again with the same external id is a no-op; linking an unknown
    /// record or one already bound to a different id fails with `NotFound`.
    pub async fn link(&self, durable_id: &str, external_session_id: &str) -> Result<(), RegistryError> {
        self.update(durable_id, |record| {
            match &record.external_session_id {
                Some(existing) if existing == external_session_id => return Ok(false),
                Some(existing) => {
                    error!(
                        durable_id = %durable_id,
                        existing = %existing,
                        requested = %external_session_id,
                        "Refusing to relink session to a different external id"
                    );
                    return Err(RegistryError::NotFound(durable_id.to_string()));
                }
                None => {}
            }
            if !record.status.can_transition_to(SessionStatus::Linked) {
                return Err(RegistryError::InvalidTransition {
                    durable_id: durable_id.to_string(),
                    from: record.status,
                    to: SessionStatus::Linked,
                });
            }
            record.external_session_id = Some(external_session_id.to_string());
            record.status = SessionStatus::Linked;
            Ok(true)
        })
        .await?;

        info!(durable_id = %durable_id, external_session_id = %external_session_id, "Session linked");
        Ok(())
    }

    /// Move a record along the legal transition table.
    ///
    /// `LINKED` is only reachable through [`SessionRegistry::link`], which
    /// supplies the external id the status requires.
    pub async fn transition(&self, durable_id: &str, new_status: SessionStatus) -> Result<(), RegistryError> {
        self.update(durable_id, |record| {
            if new_status == SessionStatus::Linked || !record.status.can_transition_to(new_status) {
                return Err(RegistryError::InvalidTransition {
                    durable_id: durable_id.to_string(),
                    from: record.status,
                    to: new_status,
                });
            }
            apply_status(record, new_status);
            Ok(true)
        })
        .await?;

        debug!(durable_id = %durable_id, status = %new_status, "Session transitioned");
        Ok(())
    }

    /// Walk an active record to `ENDED` through `ENDING`, resuming wherever a
    /// previous attempt stopped. Already-ended records are left alone.
    pub async fn complete(&self, durable_id: &str) -> Result<(), RegistryError> {
        loop {
            let record = self
                .get(durable_id)
                .await?
                .ok_or_else(|| RegistryError::NotFound(durable_id.to_string()))?;

            match record.status {
                SessionStatus::Ended => return Ok(()),
                SessionStatus::Active => self.transition(durable_id, SessionStatus::Ending).await?,
                SessionStatus::Ending => return self.transition(durable_id, SessionStatus::Ended).await,
                from => {
                    return Err(RegistryError::InvalidTransition {
                        durable_id: durable_id.to_string(),
                        from,
                        to: SessionStatus::Ended,
                    })
                }
            }
        }
    }

    /// Mark an attempt `ABORTED` after a failure before the session became usable.
    ///
    /// Already-aborted records are left alone.
    pub async fn cleanup(&self, durable_id: &str) -> Result<(), RegistryError> {
        self.update(durable_id, |record| {
            if record.status == SessionStatus::Aborted {
                return Ok(false);
            }
            if !record.status.can_transition_to(SessionStatus::Aborted) {
                return Err(RegistryError::InvalidTransition {
                    durable_id: durable_id.to_string(),
                    from: record.status,
                    to: SessionStatus::Aborted,
                });
            }
            apply_status(record, SessionStatus::Aborted);
            Ok(true)
        })
        .await?;

        info!(durable_id = %durable_id, "Session record aborted");
        Ok(())
    }

    /// Read-modify-write loop. `mutate` returns `Ok(false)` when nothing changed.
    async fn update<F>(&self, durable_id: &str, mut mutate: F) -> Result<(), RegistryError>
    where
        F: FnMut(&mut SessionRecord) -> Result<bool, RegistryError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .load(durable_id)
                .await?
                .ok_or_else(|| RegistryError::NotFound(durable_id.to_string()))?;

            let mut record = current.value;
            if !mutate(&mut record)? {
                return Ok(());
            }
            if self.store.store_if(durable_id, Some(current.version), record).await?.is_some() {
                return Ok(());
            }
        }
        Err(RegistryError::Contention(durable_id.to_string()))
    }
}

fn apply_status(record: &mut SessionRecord, status: SessionStatus) {
    record.status = status;
    if status == SessionStatus::Aborted {
        record.external_session_id = None;
    }
    if status.is_terminal() {
        record.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registry() -> (SessionRegistry, Arc<MemoryStore<SessionRecord>>) {
        let store = Arc::new(MemoryStore::new());
        (SessionRegistry::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (registry, _) = registry();
        let id = registry.create("1.2.3.4|fp", SessionMetadata::new()).await.unwrap();

        registry.link(&id, "ext_1").await.unwrap();
        registry.transition(&id, SessionStatus::Active).await.unwrap();
        registry.transition(&id, SessionStatus::Ending).await.unwrap();
        registry.transition(&id, SessionStatus::Ended).await.unwrap();

        let record = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Ended);
        assert_eq!(record.external_session_id.as_deref(), Some("ext_1"));
        assert!(record.ended_at.is_some());
        assert!(record.is_consistent());
    }

    #[tokio::test]
    async fn test_link_guards() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.link("nope", "ext").await,
            Err(RegistryError::NotFound(_))
        ));

        let id = registry.create("k", SessionMetadata::new()).await.unwrap();
        registry.link(&id, "ext_1").await.unwrap();
        // Same id again is fine, a different one is not
        registry.link(&id, "ext_1").await.unwrap();
        assert!(matches!(
            registry.link(&id, "ext_2").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (registry, _) = registry();
        let id = registry.create("k", SessionMetadata::new()).await.unwrap();

        let err = registry.transition(&id, SessionStatus::Active).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert!(err.is_permanent());

        // LINKED needs an external id, so only link() may reach it
        assert!(registry.transition(&id, SessionStatus::Linked).await.is_err());

        registry.link(&id, "ext").await.unwrap();
        registry.transition(&id, SessionStatus::Active).await.unwrap();
        assert!(registry.transition(&id, SessionStatus::Ended).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_marks_aborted() {
        let (registry, store) = registry();
        let id = registry.create("k", SessionMetadata::new()).await.unwrap();
        registry.link(&id, "ext").await.unwrap();

        registry.cleanup(&id).await.unwrap();
        registry.cleanup(&id).await.unwrap();

        let record = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Aborted);
        assert!(record.external_session_id.is_none());
        assert!(record.is_consistent());
        // Retained for audit
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_resumes_from_ending() {
        let (registry, _) = registry();
        let id = registry.create("k", SessionMetadata::new()).await.unwrap();
        registry.link(&id, "ext").await.unwrap();
        registry.transition(&id, SessionStatus::Active).await.unwrap();
        registry.transition(&id, SessionStatus::Ending).await.unwrap();

        registry.complete(&id).await.unwrap();
        registry.complete(&id).await.unwrap();
        let record = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Ended);
        assert!(record.is_consistent());

        let pending = registry.create("k", SessionMetadata::new()).await.unwrap();
        let err = registry.complete(&pending).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_storage_errors_are_retryable() {
        let (registry, store) = registry();
        store.set_available(false);
        let err = registry.create("k", SessionMetadata::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(!err.is_permanent());
    }
}
