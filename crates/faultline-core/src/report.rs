//! Unified report over managed and native fault records.
//!
//! Both stores are read when the report opens and reconciled here, and
//! only here: records are concatenated and stable-sorted by capture time,
//! most recent first. A native read failure degrades the report instead of
//! failing it.

use std::fmt::{self, Write as _};

use crate::bridge::NativeBridge;
use crate::error::{BridgeError, StoreError};
use crate::interceptor::GlobalFaultInterceptor;
use crate::managed_store::ManagedFaultStore;
use crate::record::{FaultRecord, format_timestamp};

/// Longest message shown in a list row, in characters.
pub const ROW_MESSAGE_LEN: usize = 80;

/// Concatenate and order most recent first. Equal timestamps keep their
/// input order (managed before native, each in its store order).
#[must_use]
pub fn merge(managed: Vec<FaultRecord>, native: Vec<FaultRecord>) -> Vec<FaultRecord> {
    let mut merged = managed;
    merged.extend(native);
    merged.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
    merged
}

/// Shorten to `max` characters, ending in `…` when cut.
#[must_use]
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }
    let mut out: String = message.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Flat text transcript of one record. Stack and traces are copied verbatim.
#[must_use]
pub fn export_record(record: &FaultRecord) -> String {
    let mut out = format!(
        "Type: {}\nTime: {}\nID: {}\nMessage: {}\n",
        record.origin(),
        format_timestamp(record.timestamp()),
        record.id(),
        record.message()
    );
    if let Some(thread) = record.thread_name() {
        let _ = writeln!(out, "Thread: {thread}");
    }
    if let Some(device) = record.device_context() {
        let _ = writeln!(out, "Device: {device}");
    }
    if let Some(trace) = record.subtree_trace() {
        out.push_str("\nSubtree Trace:\n");
        out.push_str(trace);
        out.push('\n');
    }
    if let Some(stack) = record.stack_trace() {
        out.push_str("\nStack Trace:\n");
        out.push_str(stack);
        out.push('\n');
    }
    out
}

/// Platform share primitive.
pub trait ShareSink {
    fn share(&self, title: &str, text: &str) -> std::io::Result<()>;
}

/// One list row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub id: String,
    pub badge: &'static str,
    pub message: String,
    pub time: String,
}

/// Detail view of one record; fields not applicable to its origin are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDetail {
    pub badge: &'static str,
    pub time: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub subtree_trace: Option<String>,
    pub device: Option<String>,
    pub thread: Option<String>,
}

impl From<&FaultRecord> for RecordDetail {
    fn from(record: &FaultRecord) -> Self {
        let native = record.origin().is_native();
        Self {
            badge: record.origin().badge(),
            time: format_timestamp(record.timestamp()),
            message: record.message().to_string(),
            stack_trace: record.stack_trace().map(str::to_string),
            subtree_trace: if native {
                None
            } else {
                record.subtree_trace().map(str::to_string)
            },
            device: if native {
                record.device_context().map(ToString::to_string)
            } else {
                None
            },
            thread: if native {
                record.thread_name().map(str::to_string)
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState<'a> {
    /// Nothing recorded on either side, and both sides were readable.
    Empty,
    Loaded {
        records: &'a [FaultRecord],
        native_unavailable: Option<&'a str>,
    },
}

/// Proof that the user confirmed a bulk clear.
#[derive(Debug)]
pub struct ClearConfirmation(());

impl ClearConfirmation {
    #[must_use]
    pub fn confirmed() -> Self {
        Self(())
    }
}

/// Per-side result of a bulk clear.
#[derive(Debug)]
pub struct ClearOutcome {
    pub managed: Result<(), StoreError>,
    pub native: Result<(), BridgeError>,
}

impl ClearOutcome {
    pub fn is_complete(&self) -> bool {
        self.managed.is_ok() && self.native.is_ok()
    }
}

impl fmt::Display for ClearOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.managed, &self.native) {
            (Ok(()), Ok(())) => write!(f, "Cleared managed and native fault records"),
            (Ok(()), Err(e)) => write!(f, "Managed records cleared; native clear failed: {e}"),
            (Err(e), Ok(())) => write!(f, "Native records cleared; managed clear failed: {e}"),
            (Err(m), Err(n)) => write!(f, "Clear failed on both sides: {m}; {n}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnifiedReport {
    records: Vec<FaultRecord>,
    native_unavailable: Option<String>,
}

impl UnifiedReport {
    /// Read both sides concurrently and merge.
    ///
    /// Only a managed read failure fails the report.
    pub async fn open<B: NativeBridge>(
        store: &ManagedFaultStore,
        bridge: &B,
    ) -> Result<Self, StoreError> {
        let (managed, native) = tokio::join!(store.load(), bridge.get_native_error_logs());
        let managed = managed?;
        let (native, native_unavailable) = match native {
            Ok(records) => (records, None),
            Err(e) => {
                tracing::warn!(error = %e, "native fault records unavailable");
                (Vec::new(), Some(e.to_string()))
            }
        };
        Ok(Self::from_parts(managed, native, native_unavailable))
    }

    #[must_use]
    pub fn from_parts(
        managed: Vec<FaultRecord>,
        native: Vec<FaultRecord>,
        native_unavailable: Option<String>,
    ) -> Self {
        Self {
            records: merge(managed, native),
            native_unavailable,
        }
    }

    pub fn state(&self) -> ReportState<'_> {
        if self.records.is_empty() && self.native_unavailable.is_none() {
            ReportState::Empty
        } else {
            ReportState::Loaded {
                records: &self.records,
                native_unavailable: self.native_unavailable.as_deref(),
            }
        }
    }

    pub fn records(&self) -> &[FaultRecord] {
        &self.records
    }

    pub fn native_unavailable(&self) -> Option<&str> {
        self.native_unavailable.as_deref()
    }

    /// One-line description of the report state.
    pub fn status_line(&self) -> String {
        match (self.records.is_empty(), &self.native_unavailable) {
            (true, None) => "No errors recorded".to_string(),
            (true, Some(_)) => "No managed errors recorded; native records unavailable".to_string(),
            (false, Some(reason)) => format!(
                "{} records (native records unavailable: {reason})",
                self.records.len()
            ),
            (false, None) => format!("{} records", self.records.len()),
        }
    }

    pub fn rows(&self) -> Vec<ReportRow> {
        self.records
            .iter()
            .map(|r| ReportRow {
                id: r.id().to_string(),
                badge: r.origin().badge(),
                message: truncate_message(r.message(), ROW_MESSAGE_LEN),
                time: format_timestamp(r.timestamp()),
            })
            .collect()
    }

    pub fn detail(&self, index: usize) -> Option<RecordDetail> {
        self.records.get(index).map(RecordDetail::from)
    }

    /// Every record with `id`. Ids are only unique within one store.
    pub fn find(&self, id: &str) -> Vec<&FaultRecord> {
        self.records.iter().filter(|r| r.id() == id).collect()
    }

    pub fn export(&self, index: usize) -> Option<String> {
        self.records.get(index).map(export_record)
    }

    /// Hand the export text of one record to `sink`. `Ok(false)` if there is no such record.
    pub fn share(&self, index: usize, sink: &dyn ShareSink) -> std::io::Result<bool> {
        let Some(record) = self.records.get(index) else {
            return Ok(false);
        };
        let title = format!("Fault report {}", record.id());
        sink.share(&title, &export_record(record))?;
        Ok(true)
    }

    /// Clear both sides. The report keeps whatever could not be cleared.
    ///
    /// Only touches what is already persisted. Records still queued in a
    /// running [`GlobalFaultInterceptor`] land after the clear; use
    /// [`Self::clear_all_flushed`] when one is installed.
    pub async fn clear_all<B: NativeBridge>(
        &mut self,
        store: &ManagedFaultStore,
        bridge: &B,
        _confirmation: ClearConfirmation,
    ) -> ClearOutcome {
        let (managed, native) = tokio::join!(store.clear(), bridge.clear_native_error_logs());
        if let Err(e) = &managed {
            tracing::warn!(error = %e, store = "managed", "clear failed");
        }
        if let Err(e) = &native {
            tracing::warn!(error = %e, store = "native", "clear failed");
        }
        let managed_cleared = managed.is_ok();
        let native_cleared = native.is_ok();
        self.records.retain(|r| {
            if r.origin().is_native() {
                !native_cleared
            } else {
                !managed_cleared
            }
        });
        ClearOutcome { managed, native }
    }

    /// [`Self::clear_all`] on the interceptor's store, after draining its
    /// write queue so nothing captured before this call survives it.
    pub async fn clear_all_flushed<B: NativeBridge>(
        &mut self,
        interceptor: &GlobalFaultInterceptor,
        bridge: &B,
        confirmation: ClearConfirmation,
    ) -> ClearOutcome {
        interceptor.flush().await;
        self.clear_all(interceptor.store(), bridge, confirmation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceContext, FaultOrigin};
    use crate::storage::MemoryKvStore;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::{Arc, Mutex};

    fn at(origin: FaultOrigin, message: &str, secs: i64) -> FaultRecord {
        let base: DateTime<Utc> = DateTime::from_timestamp(1_760_000_000, 0).unwrap();
        FaultRecord::new(origin, message).with_timestamp(base + Duration::seconds(secs))
    }

    struct StubBridge {
        records: Vec<FaultRecord>,
        fail_read: bool,
        fail_clear: bool,
    }

    impl NativeBridge for StubBridge {
        async fn get_native_error_logs(&self) -> Result<Vec<FaultRecord>, BridgeError> {
            if self.fail_read {
                return Err(BridgeError::ReadFailure("native storage locked".to_string()));
            }
            Ok(self.records.clone())
        }

        async fn clear_native_error_logs(&self) -> Result<(), BridgeError> {
            if self.fail_clear {
                return Err(BridgeError::ClearFailure("denied".to_string()));
            }
            Ok(())
        }

        async fn log_native_error(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
        ) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    fn stub(records: Vec<FaultRecord>) -> StubBridge {
        StubBridge {
            records,
            fail_read: false,
            fail_clear: false,
        }
    }

    fn managed_store() -> ManagedFaultStore {
        ManagedFaultStore::new(Arc::new(MemoryKvStore::new()), "voicejot", 50)
    }

    #[test]
    fn merge_orders_most_recent_first() {
        let t1 = at(FaultOrigin::ManagedConsole, "t1", 1);
        let t3 = at(FaultOrigin::ManagedUncaught, "t3", 3);
        let t2 = at(FaultOrigin::NativeUncaught, "t2", 2);
        let merged = merge(vec![t1, t3], vec![t2]);
        let order: Vec<_> = merged.iter().map(FaultRecord::message).collect();
        assert_eq!(order, vec!["t3", "t2", "t1"]);
    }

    #[test]
    fn merge_is_stable_for_ties() {
        let a = at(FaultOrigin::ManagedConsole, "a", 5);
        let b = at(FaultOrigin::ManagedConsole, "b", 5);
        let n = at(FaultOrigin::NativeUncaught, "n", 5);
        let merged = merge(vec![a, b], vec![n]);
        let order: Vec<_> = merged.iter().map(FaultRecord::message).collect();
        assert_eq!(order, vec!["a", "b", "n"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_message("short", 80), "short");
        let long = "ü".repeat(100);
        let cut = truncate_message(&long, 80);
        assert_eq!(cut.chars().count(), 80);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn export_keeps_stack_verbatim() {
        let stack = "Error: network down\n    at fetch (\"api.js\":10:5)\n\tat <anonymous>";
        let record = FaultRecord::new(FaultOrigin::ManagedRejection, "network down")
            .with_stack_trace(Some(stack.to_string()));
        let text = export_record(&record);
        assert!(text.contains(stack));
        assert!(text.starts_with("Type: managed-rejection\nTime: "));
        assert!(text.contains("Message: network down\n"));
    }

    #[test]
    fn export_includes_native_metadata() {
        let record = FaultRecord::new(FaultOrigin::NativeUncaught, "null pointer")
            .with_thread_name(Some("worker-1".to_string()))
            .with_device_context(Some(DeviceContext {
                manufacturer: "Google".to_string(),
                model: "Pixel 8".to_string(),
                os_version: "14".to_string(),
                api_level: Some(34),
                arch: "aarch64".to_string(),
            }));
        let text = export_record(&record);
        assert!(text.contains("Thread: worker-1\n"));
        assert!(text.contains("Device: Google Pixel 8 (14, aarch64, API 34)\n"));
    }

    #[tokio::test]
    async fn empty_is_distinct_from_native_failure() {
        let store = managed_store();
        let report = UnifiedReport::open(&store, &stub(Vec::new())).await.unwrap();
        assert_eq!(report.state(), ReportState::Empty);
        assert_eq!(report.status_line(), "No errors recorded");

        let failing = StubBridge {
            fail_read: true,
            ..stub(Vec::new())
        };
        let report = UnifiedReport::open(&store, &failing).await.unwrap();
        assert!(matches!(
            report.state(),
            ReportState::Loaded {
                native_unavailable: Some(_),
                ..
            }
        ));
        assert_eq!(
            report.status_line(),
            "No managed errors recorded; native records unavailable"
        );
    }

    #[tokio::test]
    async fn native_failure_keeps_managed_records() {
        let store = managed_store();
        store
            .append(at(FaultOrigin::ManagedUncaught, "kept", 1))
            .await
            .unwrap();
        let failing = StubBridge {
            fail_read: true,
            ..stub(Vec::new())
        };
        let report = UnifiedReport::open(&store, &failing).await.unwrap();
        assert_eq!(report.records().len(), 1);
        assert!(report.native_unavailable().unwrap().contains("native storage locked"));
    }

    #[tokio::test]
    async fn rows_and_detail() {
        let store = managed_store();
        store
            .append(
                at(FaultOrigin::ManagedComponent, &"x".repeat(120), 1)
                    .with_subtree_trace(Some("    in Editor".to_string())),
            )
            .await
            .unwrap();
        let native = at(FaultOrigin::NativeUncaught, "null pointer", 2)
            .with_thread_name(Some("worker-1".to_string()));
        let report = UnifiedReport::open(&store, &stub(vec![native])).await.unwrap();

        let rows = report.rows();
        assert_eq!(rows[0].badge, "NATIVE");
        assert_eq!(rows[1].badge, "COMPONENT");
        assert_eq!(rows[1].message.chars().count(), ROW_MESSAGE_LEN);
        assert_eq!(rows[0].time, "2025-10-09 08:53:22 UTC");

        let native_detail = report.detail(0).unwrap();
        assert_eq!(native_detail.thread.as_deref(), Some("worker-1"));
        assert!(native_detail.subtree_trace.is_none());
        let component_detail = report.detail(1).unwrap();
        assert_eq!(component_detail.subtree_trace.as_deref(), Some("    in Editor"));
        assert!(component_detail.thread.is_none());
        assert!(report.detail(2).is_none());
    }

    #[tokio::test]
    async fn find_tolerates_cross_store_id_collisions() {
        let managed = at(FaultOrigin::ManagedConsole, "m", 1).with_id("dup");
        let native = at(FaultOrigin::NativeUncaught, "n", 2).with_id("dup");
        let report = UnifiedReport::from_parts(vec![managed], vec![native], None);
        assert_eq!(report.find("dup").len(), 2);
        assert!(report.find("missing").is_empty());
    }

    #[test]
    fn share_hands_export_text_to_sink() {
        struct Capture(Mutex<Vec<(String, String)>>);
        impl ShareSink for Capture {
            fn share(&self, title: &str, text: &str) -> std::io::Result<()> {
                self.0.lock().unwrap().push((title.to_string(), text.to_string()));
                Ok(())
            }
        }
        let record = at(FaultOrigin::ManagedConsole, "shared", 1);
        let report = UnifiedReport::from_parts(vec![record.clone()], Vec::new(), None);
        let sink = Capture(Mutex::new(Vec::new()));
        assert!(report.share(0, &sink).unwrap());
        assert!(!report.share(5, &sink).unwrap());
        let shared = sink.0.lock().unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].1, export_record(&record));
    }

    #[tokio::test]
    async fn clear_reports_partial_failure() {
        let store = managed_store();
        store
            .append(at(FaultOrigin::ManagedConsole, "m", 1))
            .await
            .unwrap();
        let bridge = StubBridge {
            fail_clear: true,
            ..stub(vec![at(FaultOrigin::NativeUncaught, "n", 2)])
        };
        let mut report = UnifiedReport::open(&store, &bridge).await.unwrap();
        let outcome = report
            .clear_all(&store, &bridge, ClearConfirmation::confirmed())
            .await;

        assert!(!outcome.is_complete());
        assert!(outcome.managed.is_ok());
        assert!(matches!(outcome.native, Err(BridgeError::ClearFailure(_))));
        assert!(outcome.to_string().starts_with("Managed records cleared; native clear failed"));
        assert!(store.load().await.unwrap().is_empty());
        assert_eq!(report.records().len(), 1);
        assert!(report.records()[0].origin().is_native());
    }

    #[tokio::test]
    async fn flushed_clear_drops_queued_records() {
        use crate::channels::{CapturedConsole, ErrorChannels};
        use crate::config::CaptureConfig;
        use crate::ui::RecordingUi;

        let channels = ErrorChannels::new(Arc::new(CapturedConsole::new()));
        let interceptor = GlobalFaultInterceptor::install(
            &channels,
            managed_store(),
            Arc::new(RecordingUi::new()),
            &CaptureConfig::default(),
        );
        let bridge = stub(Vec::new());
        let mut report = UnifiedReport::open(interceptor.store(), &bridge).await.unwrap();

        channels.console_error(&["queued before clear"]);
        let outcome = report
            .clear_all_flushed(&interceptor, &bridge, ClearConfirmation::confirmed())
            .await;
        assert!(outcome.is_complete());

        interceptor.flush().await;
        assert!(interceptor.store().load().await.unwrap().is_empty());
    }
}
