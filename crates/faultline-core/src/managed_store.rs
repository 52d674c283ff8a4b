//! Managed-runtime fault record store.
//!
//! Append-only, oldest-first, bounded to the most recent
//! `stores.managed_capacity` records (50 by default). Every operation is
//! async: the blocking file work runs on tokio's blocking pool so callers
//! on the managed side await persistence without stalling their executor.

use std::sync::Arc;

use crate::config::Config;
use crate::error::StoreError;
use crate::record::FaultRecord;
use crate::storage::{BoundedLog, FileKvStore, InsertOrder, KvStore};

/// Storage key (after the prefix) of the managed fault log.
pub const MANAGED_LOG_KEY: &str = "fault_log";

#[derive(Debug, Clone)]
pub struct ManagedFaultStore {
    log: Arc<BoundedLog>,
}

impl ManagedFaultStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str, capacity: usize) -> Self {
        let key = format!("{prefix}.{MANAGED_LOG_KEY}");
        Self {
            log: Arc::new(BoundedLog::new(kv, key, capacity, InsertOrder::Append)),
        }
    }

    /// File-backed store in the managed namespace of the configured data dir.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(FileKvStore::new(config.managed_dir())),
            &config.general.storage_prefix,
            config.stores.managed_capacity,
        )
    }

    pub fn capacity(&self) -> usize {
        self.log.capacity()
    }

    pub fn key(&self) -> &str {
        self.log.key()
    }

    /// Persist one record. Returns the number of records evicted to stay in bounds.
    pub async fn append(&self, record: FaultRecord) -> Result<usize, StoreError> {
        tracing::debug!(record_id = %record.id(), origin = %record.origin(), store = "managed", "appending fault record");
        self.blocking(move |log| log.insert(record)).await
    }

    /// Persist one record on the calling thread.
    ///
    /// For callers that cannot await, such as a fatal fault about to hand
    /// control to a restart prompt.
    pub fn append_now(&self, record: FaultRecord) -> Result<usize, StoreError> {
        tracing::debug!(record_id = %record.id(), origin = %record.origin(), store = "managed", "appending fault record synchronously");
        self.log.insert(record)
    }

    /// All records, oldest first.
    pub async fn load(&self) -> Result<Vec<FaultRecord>, StoreError> {
        self.blocking(|log| log.read()).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.blocking(|log| log.clear()).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&BoundedLog) -> Result<T, StoreError> + Send + 'static,
    {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || f(&log))
            .await
            .map_err(|e| StoreError::WorkerGone(e.to_string()))?
    }
}
