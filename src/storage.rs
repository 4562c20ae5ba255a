// SPDX-License-Identifier: Apache-2.0

//! The persistent-storage-facing contract and an in-memory test double.

use crate::error::ConfigError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// An opaque key identifying a record in a [`Storage`] backend: the
/// persistent queue's monotonically increasing sequence number.
pub type StorageId = u64;

/// An opaque key/value extent the persistent queue uses to survive process
/// restarts.
///
/// `set` must return only after the record is recoverable across a crash;
/// implementations backed by a real disk must `fsync` (or equivalent)
/// before returning `Ok`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads a previously stored record, or `Ok(None)` if absent.
    async fn get(&self, id: StorageId) -> Result<Option<Vec<u8>>, ConfigError>;

    /// Durably writes a record.
    async fn set(&self, id: StorageId, bytes: Vec<u8>) -> Result<(), ConfigError>;

    /// Removes a record. Called only after a downstream send returns
    /// success or a non-retryable error.
    async fn delete(&self, id: StorageId) -> Result<(), ConfigError>;

    /// Lists every id currently stored, in ascending order, for replay at
    /// startup.
    async fn list(&self) -> Result<Vec<StorageId>, ConfigError>;
}

/// A factory resolving a storage backend by process-wide name, supplied by
/// the host rather than looked up in a global registry (Design Note 3).
pub type StorageFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Storage>, ConfigError> + Send + Sync>;

/// A `Storage` implementation backed by an in-process `BTreeMap`, useful
/// for tests and for hosts that want at-most-process-lifetime durability.
///
/// Durability note: this implementation does not survive a process crash —
/// it exists to exercise the persistent queue's replay-then-live ordering
/// and marshal/unmarshal round trip without requiring a real disk.
#[derive(Default)]
pub struct InMemoryStorage {
    records: Mutex<BTreeMap<StorageId, Vec<u8>>>,
}

impl InMemoryStorage {
    /// Creates an empty in-memory storage backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a fresh instance in the `Arc` a [`StorageFactory`] must
    /// return.
    #[must_use]
    pub fn factory() -> StorageFactory {
        Arc::new(|_id: &str| Ok(Arc::new(InMemoryStorage::new()) as Arc<dyn Storage>))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, id: StorageId) -> Result<Option<Vec<u8>>, ConfigError> {
        Ok(self.records.lock().expect("storage lock").get(&id).cloned())
    }

    async fn set(&self, id: StorageId, bytes: Vec<u8>) -> Result<(), ConfigError> {
        let _ = self.records.lock().expect("storage lock").insert(id, bytes);
        Ok(())
    }

    async fn delete(&self, id: StorageId) -> Result<(), ConfigError> {
        let _ = self.records.lock().expect("storage lock").remove(&id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StorageId>, ConfigError> {
        Ok(self.records.lock().expect("storage lock").keys().copied().collect())
    }
}
