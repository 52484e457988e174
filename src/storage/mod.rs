//! # Storage Collaborator
//!
//! The Registry and the Ledger persist their records through [`VersionedStore`],
//! a point-lookup store with compare-and-swap writes. Every read-modify-write is
//! a `load` followed by a `store_if` against the version that was read; a version
//! conflict means another writer got there first and the caller re-reads.
//!
//! No lock is ever held across a store round-trip, so slow storage only slows
//! the caller that is waiting on it.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors raised by a storage backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The backend could not be reached or refused the request
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A stored value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Versioned key/value store with conditional writes.
#[async_trait]
pub trait VersionedStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Point lookup by primary key.
    async fn load(&self, key: &str) -> Result<Option<Versioned<T>>, StorageError>;

    /// Write `value` only if the current version still matches `expected_version`
    /// (`None` = the key must not exist yet).
    ///
    /// Returns `Ok(Some(new_version))` on success and `Ok(None)` on a version conflict.
    async fn store_if(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: T,
    ) -> Result<Option<u64>, StorageError>;
}
