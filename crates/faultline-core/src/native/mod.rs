//! Native-runtime fault capture and persistence.
//!
//! Native records live in their own key-value namespace, written with
//! plain synchronous I/O so they can be persisted from a panic hook on any
//! thread, even when the managed side never finished starting.
//!
//! # Native encoding
//!
//! ```text
//! [
//!   {
//!     "id": "1760900000000-k3j9x0a1b",
//!     "timestampMs": 1760900000000,
//!     "thread": "worker-1",
//!     "exceptionClass": "panic",
//!     "message": "null pointer",
//!     "stackTrace": "at src/audio.rs:42:9\n   0: ...",
//!     "device": { "manufacturer": "...", "model": "...", ... }
//!   }
//! ]
//! ```
//!
//! Both native logs are newest first. [`NativeCrashEntry::into_fault_record`]
//! is the single place the native shape is converted into a [`FaultRecord`].

mod hook;
mod startup;

pub use hook::{NativeFaultInterceptor, contain, is_contained};
pub use startup::guard_startup;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::StoreError;
use crate::record::{DeviceContext, FaultOrigin, FaultRecord, new_record_id};
use crate::storage::{BoundedLog, FileKvStore, InsertOrder, KvStore};

/// Storage key (after the prefix) of panic-hook records.
pub const NATIVE_CRASH_KEY: &str = "native_crash_log";

/// Storage key (after the prefix) of startup-guard and bridge-written records.
pub const NATIVE_ERROR_KEY: &str = "native_error_log";

/// Exception class recorded for panics.
pub const PANIC_CLASS: &str = "panic";

/// One persisted native fault, in the native encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeCrashEntry {
    pub id: String,
    pub timestamp_ms: i64,
    pub thread: String,
    pub exception_class: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
    /// Startup stage or caller-supplied context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceContext>,
}

impl NativeCrashEntry {
    /// New entry stamped now, attributed to the current thread.
    #[must_use]
    pub fn capture(
        exception_class: impl Into<String>,
        message: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_record_id(now),
            timestamp_ms: now.timestamp_millis(),
            thread: current_thread_name(),
            exception_class: exception_class.into(),
            message: message.into(),
            stack_trace: stack_trace.into(),
            context: None,
            device: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.is_empty());
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Option<DeviceContext>) -> Self {
        self.device = device;
        self
    }

    /// Convert into the common record shape (origin `native-uncaught`).
    ///
    /// The exception class and context become the head of the stack trace.
    #[must_use]
    pub fn into_fault_record(self) -> FaultRecord {
        let timestamp: DateTime<Utc> =
            DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default();

        let mut stack = format!("{}: {}", self.exception_class, self.message);
        if let Some(context) = &self.context {
            stack.push_str("\ncontext: ");
            stack.push_str(context);
        }
        if !self.stack_trace.is_empty() {
            stack.push('\n');
            stack.push_str(&self.stack_trace);
        }

        FaultRecord::new(FaultOrigin::NativeUncaught, self.message)
            .with_id(self.id)
            .with_timestamp(timestamp)
            .with_stack_trace(Some(stack))
            .with_thread_name(Some(self.thread))
            .with_device_context(self.device)
    }
}

pub(crate) fn current_thread_name() -> String {
    std::thread::current()
        .name()
        .map_or_else(|| "<unnamed>".to_string(), str::to_string)
}

/// The two native fault logs.
#[derive(Debug)]
pub struct NativeFaultStore {
    crashes: BoundedLog,
    errors: BoundedLog,
}

impl NativeFaultStore {
    /// Both logs share `capacity`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str, capacity: usize) -> Self {
        Self {
            crashes: BoundedLog::new(
                Arc::clone(&kv),
                format!("{prefix}.{NATIVE_CRASH_KEY}"),
                capacity,
                InsertOrder::Prepend,
            ),
            errors: BoundedLog::new(
                kv,
                format!("{prefix}.{NATIVE_ERROR_KEY}"),
                capacity,
                InsertOrder::Prepend,
            ),
        }
    }

    /// File-backed store in the native namespace of the configured data dir.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(FileKvStore::new(config.native_dir())),
            &config.general.storage_prefix,
            config.stores.native_capacity,
        )
    }

    pub fn capacity(&self) -> usize {
        self.crashes.capacity()
    }

    /// Prepend a panic-hook record.
    pub fn record_crash(&self, entry: NativeCrashEntry) -> Result<usize, StoreError> {
        self.crashes.insert(entry)
    }

    /// Prepend a startup-guard or bridge-written record.
    pub fn record_error(&self, entry: NativeCrashEntry) -> Result<usize, StoreError> {
        self.errors.insert(entry)
    }

    pub fn crash_entries(&self) -> Result<Vec<NativeCrashEntry>, StoreError> {
        self.crashes.read()
    }

    pub fn error_entries(&self) -> Result<Vec<NativeCrashEntry>, StoreError> {
        self.errors.read()
    }

    /// Both logs merged newest first. Each log's own order is kept for equal timestamps.
    pub fn entries(&self) -> Result<Vec<NativeCrashEntry>, StoreError> {
        let mut entries = self.crash_entries()?;
        entries.extend(self.error_entries()?);
        entries.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(entries)
    }

    /// Raw JSON text of the panic-hook log (`[]` when nothing was recorded).
    pub fn get_crash_logs(&self) -> Result<String, StoreError> {
        Ok(self
            .crashes
            .read_raw()?
            .unwrap_or_else(|| "[]".to_string()))
    }

    pub fn clear_crash_logs(&self) -> Result<(), StoreError> {
        self.crashes.clear()
    }

    /// Clear both native logs. Both are attempted even if the first fails.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let crashes = self.crashes.clear();
        let errors = self.errors.clear();
        crashes.and(errors)
    }
}
