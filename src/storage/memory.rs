//! In-process [`VersionedStore`] backed by a `HashMap`.
//!
//! Used by the binary when no external database is wired in, and by tests.
//! Outages can be simulated with [`MemoryStore::set_available`] and
//! [`MemoryStore::fail_next`].

use super::{StorageError, Versioned, VersionedStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

pub struct MemoryStore<T> {
    entries: RwLock<HashMap<String, Versioned<T>>>,
    available: AtomicBool,
    failures_pending: AtomicU32,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            failures_pending: AtomicU32::new(0),
        }
    }
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a full outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail, then recover.
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store offline".to_string()));
        }
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<T> VersionedStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load(&self, key: &str) -> Result<Option<Versioned<T>>, StorageError> {
        self.check_available()?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn store_if(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: T,
    ) -> Result<Option<u64>, StorageError> {
        self.check_available()?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let current = entries.get(key).map(|v| v.version);
        if current != expected_version {
            return Ok(None);
        }
        let version = current.map_or(1, |v| v + 1);
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_store() {
        let store = MemoryStore::<u32>::new();
        assert_eq!(store.store_if("a", None, 1).await.unwrap(), Some(1));
        // Stale writer loses
        assert_eq!(store.store_if("a", None, 2).await.unwrap(), None);
        assert_eq!(store.store_if("a", Some(1), 3).await.unwrap(), Some(2));

        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value, 3);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outage_injection() {
        let store = MemoryStore::<u32>::new();
        store.fail_next(2);
        assert!(store.load("a").await.is_err());
        assert!(store.store_if("a", None, 1).await.is_err());
        assert!(store.load("a").await.is_ok());

        store.set_available(false);
        assert!(matches!(store.load("a").await, Err(StorageError::Unavailable(_))));
        store.set_available(true);
        assert!(store.is_empty());
    }
}
