//! Bridge from the managed layer to native fault records.
//!
//! The managed side never reads the native encoding directly. It goes
//! through a [`NativeBridge`], which hands back [`FaultRecord`]s and
//! reports every failure explicitly.

use std::sync::Arc;

use crate::error::{BridgeError, StoreError};
use crate::native::{NativeCrashEntry, NativeFaultStore};
use crate::record::{DeviceContext, FaultRecord};

/// Exception class of records written through the bridge.
pub const BRIDGE_CLASS: &str = "ManagedError";

#[allow(async_fn_in_trait)]
pub trait NativeBridge: Send + Sync {
    /// Native records, most recent first.
    ///
    /// A read or decode failure is an error, never an empty list.
    async fn get_native_error_logs(&self) -> Result<Vec<FaultRecord>, BridgeError>;

    async fn clear_native_error_logs(&self) -> Result<(), BridgeError>;

    /// Ask the native side to persist a record for a managed fault.
    async fn log_native_error(
        &self,
        context: &str,
        message: &str,
        stack_trace: Option<&str>,
    ) -> Result<(), BridgeError>;
}

/// In-process bridge over a [`NativeFaultStore`].
#[derive(Debug, Clone)]
pub struct LocalNativeBridge {
    store: Arc<NativeFaultStore>,
    device: Option<DeviceContext>,
}

impl LocalNativeBridge {
    #[must_use]
    pub fn new(store: Arc<NativeFaultStore>) -> Self {
        Self {
            store,
            device: None,
        }
    }

    /// Attach device metadata to records written through the bridge.
    #[must_use]
    pub fn with_device(mut self, device: DeviceContext) -> Self {
        self.device = Some(device);
        self
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&NativeFaultStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::WorkerGone(e.to_string()))?
    }
}

impl NativeBridge for LocalNativeBridge {
    async fn get_native_error_logs(&self) -> Result<Vec<FaultRecord>, BridgeError> {
        let entries = self
            .blocking(NativeFaultStore::entries)
            .await
            .map_err(|e| BridgeError::ReadFailure(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(NativeCrashEntry::into_fault_record)
            .collect())
    }

    async fn clear_native_error_logs(&self) -> Result<(), BridgeError> {
        self.blocking(NativeFaultStore::clear_all)
            .await
            .map_err(|e| BridgeError::ClearFailure(e.to_string()))
    }

    async fn log_native_error(
        &self,
        context: &str,
        message: &str,
        stack_trace: Option<&str>,
    ) -> Result<(), BridgeError> {
        let entry = NativeCrashEntry::capture(BRIDGE_CLASS, message, stack_trace.unwrap_or_default())
            .with_context(Some(context.to_string()))
            .with_device(self.device.clone());
        tracing::debug!(record_id = %entry.id, store = "native", context, "writing native record from managed layer");
        self.blocking(move |store| store.record_error(entry))
            .await
            .map(|_| ())
            .map_err(|e| BridgeError::WriteFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::PANIC_CLASS;
    use crate::record::FaultOrigin;
    use crate::storage::{KvStore, MemoryKvStore};

    fn bridge() -> (Arc<MemoryKvStore>, Arc<NativeFaultStore>, LocalNativeBridge) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = Arc::new(NativeFaultStore::new(kv.clone(), "voicejot", 20));
        let bridge = LocalNativeBridge::new(Arc::clone(&store));
        (kv, store, bridge)
    }

    #[tokio::test]
    async fn empty_store_is_an_empty_list() {
        let (_, _, bridge) = bridge();
        assert!(bridge.get_native_error_logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn logged_errors_come_back_as_native_records() {
        let (_, _, bridge) = bridge();
        bridge
            .log_native_error("sync", "upload failed", Some("at sync::run"))
            .await
            .unwrap();
        let records = bridge.get_native_error_logs().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].origin(), FaultOrigin::NativeUncaught);
        assert_eq!(records[0].message(), "upload failed");
        let stack = records[0].stack_trace().unwrap();
        assert!(stack.starts_with("ManagedError: upload failed\ncontext: sync"));
        assert!(stack.ends_with("at sync::run"));
    }

    #[tokio::test]
    async fn both_native_logs_are_merged_newest_first() {
        let (_, store, bridge) = bridge();
        let mut crash = NativeCrashEntry::capture(PANIC_CLASS, "old crash", "");
        crash.timestamp_ms = 1_000;
        store.record_crash(crash).unwrap();
        bridge.log_native_error("ctx", "newer", None).await.unwrap();

        let messages: Vec<_> = bridge
            .get_native_error_logs()
            .await
            .unwrap()
            .iter()
            .map(|r| r.message().to_string())
            .collect();
        assert_eq!(messages, vec!["newer", "old crash"]);
    }

    #[tokio::test]
    async fn corrupt_store_is_a_read_failure() {
        let (kv, _, bridge) = bridge();
        kv.set("voicejot.native_crash_log", "{not json").unwrap();
        let err = bridge.get_native_error_logs().await.unwrap_err();
        assert!(matches!(err, BridgeError::ReadFailure(_)));
    }

    #[tokio::test]
    async fn clear_empties_both_logs() {
        let (_, store, bridge) = bridge();
        store
            .record_crash(NativeCrashEntry::capture(PANIC_CLASS, "x", ""))
            .unwrap();
        bridge.log_native_error("ctx", "y", None).await.unwrap();
        bridge.clear_native_error_logs().await.unwrap();
        assert!(bridge.get_native_error_logs().await.unwrap().is_empty());
    }
}
