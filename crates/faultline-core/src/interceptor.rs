//! Global fault interceptor for the managed layer.
//!
//! [`GlobalFaultInterceptor::install`] wraps the three handler slots of an
//! [`ErrorChannels`] set. Every wrapper records first and then calls the
//! handler it replaced, so earlier handlers (and the base printing
//! behaviour) keep running.
//!
//! Handlers are synchronous; records they produce are queued to a single
//! writer task that owns all managed-store writes. Queue order is capture
//! order, which is also the store's insertion order. The one exception is a
//! fatal uncaught error, written on the raising thread before the restart
//! prompt is shown.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::boundary::FaultSink;
use crate::channels::{ErrorChannels, ManagedError, RejectionEvent};
use crate::config::CaptureConfig;
use crate::error::StoreError;
use crate::logging::RAW_TARGET;
use crate::managed_store::ManagedFaultStore;
use crate::native::contain;
use crate::record::{FaultOrigin, FaultRecord, format_timestamp};
use crate::ui::{FatalPrompt, Notice, RecoveryUi};

/// Message recorded when an uncaught error or rejection carries none.
pub const UNKNOWN_MANAGED_ERROR: &str = "Unknown JavaScript error";

/// Prefix of console-channel records.
pub const CONSOLE_PREFIX: &str = "Console Error: ";

enum WriterCommand {
    Append(FaultRecord),
    Flush(oneshot::Sender<()>),
}

/// Optional context for [`GlobalFaultInterceptor::report_error`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportContext {
    pub subtree_trace: Option<String>,
}

pub struct GlobalFaultInterceptor {
    store: ManagedFaultStore,
    ui: Arc<dyn RecoveryUi>,
    capture: CaptureConfig,
    writer: mpsc::UnboundedSender<WriterCommand>,
    restart_required: AtomicBool,
}

impl fmt::Debug for GlobalFaultInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalFaultInterceptor")
            .field("store", &self.store)
            .field("capture", &self.capture)
            .field("restart_required", &self.restart_required)
            .finish_non_exhaustive()
    }
}

impl GlobalFaultInterceptor {
    /// Install on `channels`, once.
    ///
    /// A second call on the same channels returns the interceptor installed
    /// by the first and changes nothing.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the writer task is
    /// spawned onto it.
    pub fn install(
        channels: &ErrorChannels,
        store: ManagedFaultStore,
        ui: Arc<dyn RecoveryUi>,
        capture: &CaptureConfig,
    ) -> Arc<Self> {
        let mut fresh = false;
        let interceptor = channels.interceptor_slot().get_or_init(|| {
            fresh = true;
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(store.clone(), rx));
            Arc::new(Self {
                store,
                ui,
                capture: capture.clone(),
                writer: tx,
                restart_required: AtomicBool::new(false),
            })
        });

        if fresh {
            interceptor.wrap_channels(channels);
            tracing::info!(
                store_key = %interceptor.store.key(),
                diagnostic_notices = interceptor.capture.diagnostic_notices,
                "global fault handlers installed"
            );
        } else {
            tracing::debug!("global fault handlers already installed");
        }
        Arc::clone(interceptor)
    }

    fn wrap_channels(self: &Arc<Self>, channels: &ErrorChannels) {
        let previous = channels.global_handler();
        let this = Arc::clone(self);
        channels.set_global_handler(Arc::new(move |error, is_fatal| {
            this.on_uncaught(error, is_fatal);
            previous(error, is_fatal);
        }));

        let previous = channels.rejection_handler();
        let this = Arc::clone(self);
        channels.set_rejection_handler(Arc::new(move |event| {
            this.on_rejection(event);
            previous(event);
        }));

        let previous = channels.console_hook();
        let this = Arc::clone(self);
        channels.set_console_hook(Arc::new(move |args| {
            this.on_console(args);
            previous(args);
        }));
    }

    pub fn store(&self) -> &ManagedFaultStore {
        &self.store
    }

    /// Whether a fatal fault asked the host to restart.
    pub fn restart_required(&self) -> bool {
        self.restart_required.load(Ordering::Acquire)
    }

    fn on_uncaught(&self, error: &ManagedError, is_fatal: bool) {
        let message = error.message_or(UNKNOWN_MANAGED_ERROR);
        tracing::warn!(origin = %FaultOrigin::ManagedUncaught, is_fatal, %message, "uncaught managed error");
        let record = FaultRecord::new(FaultOrigin::ManagedUncaught, message.clone())
            .with_stack_trace(error.stack.clone());

        if is_fatal {
            // On disk before the prompt: the host may restart as soon as it is shown.
            self.persist_now(record);
            self.restart_required.store(true, Ordering::Release);
            let prompt = FatalPrompt::new(&message, error.stack.as_deref());
            self.present(|ui| ui.fatal(prompt));
        } else {
            self.enqueue(record);
            if self.capture.diagnostic_notices {
                let notice = Notice::dismissible("Error", message, error.stack.clone());
                self.present(|ui| ui.notice(notice));
            }
        }
    }

    fn on_rejection(&self, event: &RejectionEvent) {
        match event {
            RejectionEvent::Unhandled { id, error } => {
                let message = error.message_or(UNKNOWN_MANAGED_ERROR);
                tracing::warn!(origin = %FaultOrigin::ManagedRejection, rejection_id = id, %message, "unhandled rejection");
                self.enqueue(
                    FaultRecord::new(FaultOrigin::ManagedRejection, message)
                        .with_stack_trace(error.stack.clone()),
                );
            }
            RejectionEvent::Handled { id } => {
                tracing::debug!(rejection_id = id, "rejection handled late; record kept");
            }
        }
    }

    fn on_console(&self, args: &[String]) {
        let joined = args.join(" ");
        if self.is_noise(&joined) {
            tracing::trace!(text = %joined, "console noise skipped");
            return;
        }
        self.enqueue(FaultRecord::new(
            FaultOrigin::ManagedConsole,
            format!("{CONSOLE_PREFIX}{joined}"),
        ));
    }

    /// Whether console text matches a configured benign-noise pattern.
    pub fn is_noise(&self, text: &str) -> bool {
        self.capture
            .console_noise_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && text.contains(pattern.as_str()))
    }

    /// Record a caught fault from application code, without the fatal path.
    ///
    /// Resolves once the record is persisted (or its failure logged).
    pub async fn report_error(&self, error: &ManagedError, context: ReportContext) {
        let message = error.message_or(UNKNOWN_MANAGED_ERROR);
        self.enqueue(
            FaultRecord::new(FaultOrigin::ManagedComponent, message.clone())
                .with_stack_trace(error.stack.clone())
                .with_subtree_trace(context.subtree_trace),
        );
        if self.capture.diagnostic_notices {
            let notice = Notice::dismissible("Component Error", message, error.stack.clone());
            self.present(|ui| ui.notice(notice));
        }
        self.flush().await;
    }

    /// Wait until every record queued so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Aggregate over the managed store.
    pub async fn fault_summary(&self) -> Result<FaultSummary, StoreError> {
        self.flush().await;
        let records = self.store.load().await?;
        Ok(FaultSummary::from_records(&records))
    }

    /// Empty the managed store.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.flush().await;
        self.store.clear().await
    }

    fn enqueue(&self, record: FaultRecord) {
        if let Err(mpsc::error::SendError(WriterCommand::Append(record))) =
            self.writer.send(WriterCommand::Append(record))
        {
            tracing::error!(target: RAW_TARGET, record_id = %record.id(), store = "managed", "fault writer stopped; record dropped");
        }
    }

    // Records already queued may land after this one.
    fn persist_now(&self, record: FaultRecord) {
        let id = record.id().to_string();
        if let Err(e) = self.store.append_now(record) {
            tracing::error!(target: RAW_TARGET, record_id = %id, error = %e, store = "managed", "failed to persist fatal fault record");
        }
    }

    fn present(&self, show: impl FnOnce(&dyn RecoveryUi)) {
        if contain(|| show(self.ui.as_ref())).is_err() {
            tracing::error!(target: RAW_TARGET, "recovery ui panicked");
        }
    }
}

impl FaultSink for GlobalFaultInterceptor {
    fn record(&self, record: FaultRecord) {
        self.enqueue(record);
    }
}

async fn run_writer(store: ManagedFaultStore, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(record) => {
                let id = record.id().to_string();
                match store.append(record).await {
                    Ok(evicted) if evicted > 0 => {
                        tracing::debug!(record_id = %id, evicted, store = "managed", "evicted oldest records");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(target: RAW_TARGET, record_id = %id, error = %e, store = "managed", "failed to persist fault record");
                    }
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Quick aggregate of a set of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultSummary {
    pub total: usize,
    pub by_origin: BTreeMap<FaultOrigin, usize>,
    pub most_recent: Option<RecentFault>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentFault {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FaultSummary {
    #[must_use]
    pub fn from_records(records: &[FaultRecord]) -> Self {
        let mut by_origin = BTreeMap::new();
        for record in records {
            *by_origin.entry(record.origin()).or_insert(0) += 1;
        }
        let most_recent = records
            .iter()
            .max_by_key(|r| r.timestamp())
            .map(|r| RecentFault {
                message: r.message().to_string(),
                timestamp: r.timestamp(),
            });
        Self {
            total: records.len(),
            by_origin,
            most_recent,
        }
    }
}

impl fmt::Display for FaultSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total faults: {}", self.total)?;
        for (origin, count) in &self.by_origin {
            writeln!(f, "  {origin}: {count}")?;
        }
        match &self.most_recent {
            Some(recent) => write!(
                f,
                "Most recent: {} ({})",
                recent.message,
                format_timestamp(recent.timestamp)
            ),
            None => write!(f, "Most recent: none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::CapturedConsole;
    use crate::storage::{FailingKvStore, FileKvStore, MemoryKvStore};
    use crate::ui::RecordingUi;

    struct Fixture {
        console: Arc<CapturedConsole>,
        channels: ErrorChannels,
        ui: Arc<RecordingUi>,
        interceptor: Arc<GlobalFaultInterceptor>,
    }

    fn fixture(diagnostic_notices: bool) -> Fixture {
        let console = Arc::new(CapturedConsole::new());
        let channels = ErrorChannels::new(console.clone());
        let ui = Arc::new(RecordingUi::new());
        let store = ManagedFaultStore::new(Arc::new(MemoryKvStore::new()), "voicejot", 50);
        let capture = CaptureConfig {
            diagnostic_notices,
            ..CaptureConfig::default()
        };
        let interceptor = GlobalFaultInterceptor::install(&channels, store, ui.clone(), &capture);
        Fixture {
            console,
            channels,
            ui,
            interceptor,
        }
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let fx = fixture(false);
        let other_store = ManagedFaultStore::new(Arc::new(MemoryKvStore::new()), "other", 5);
        let again = GlobalFaultInterceptor::install(
            &fx.channels,
            other_store,
            fx.ui.clone(),
            &CaptureConfig::default(),
        );
        assert!(Arc::ptr_eq(&again, &fx.interceptor));

        fx.channels.console_error(&["once"]);
        fx.interceptor.flush().await;
        assert_eq!(fx.interceptor.store().load().await.unwrap().len(), 1);
        assert_eq!(fx.console.lines(), vec!["once"]);
    }

    #[tokio::test]
    async fn fatal_uncaught_prompts_restart() {
        let fx = fixture(false);
        fx.channels
            .raise_uncaught(&ManagedError::new("boom").with_stack("at main"), true);
        fx.interceptor.flush().await;

        let records = fx.interceptor.store().load().await.unwrap();
        assert_eq!(records[0].origin(), FaultOrigin::ManagedUncaught);
        assert_eq!(records[0].stack_trace(), Some("at main"));
        assert!(fx.interceptor.restart_required());
        assert_eq!(fx.ui.prompts().len(), 1);
        assert_eq!(fx.console.lines()[0], "Fatal error: boom");
    }

    #[tokio::test]
    async fn missing_message_uses_sentinel() {
        let fx = fixture(false);
        fx.channels.raise_uncaught(&ManagedError::default(), false);
        fx.interceptor.flush().await;
        let records = fx.interceptor.store().load().await.unwrap();
        assert_eq!(records[0].message(), UNKNOWN_MANAGED_ERROR);
        assert!(!fx.interceptor.restart_required());
    }

    #[tokio::test]
    async fn non_fatal_notices_follow_config() {
        let quiet = fixture(false);
        quiet.channels.raise_uncaught(&ManagedError::new("x"), false);
        assert!(quiet.ui.notices().is_empty());

        let loud = fixture(true);
        loud.channels.raise_uncaught(&ManagedError::new("x"), false);
        assert_eq!(loud.ui.notices().len(), 1);
    }

    #[tokio::test]
    async fn handled_rejection_keeps_record() {
        let fx = fixture(false);
        fx.channels.reject(9, ManagedError::new("timeout"));
        fx.channels.mark_handled(9);
        fx.interceptor.flush().await;
        let records = fx.interceptor.store().load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message(), "timeout");
    }

    #[tokio::test]
    async fn console_records_are_prefixed() {
        let fx = fixture(false);
        fx.channels.console_error(&["Failed to load", "note.json"]);
        fx.interceptor.flush().await;
        let records = fx.interceptor.store().load().await.unwrap();
        assert_eq!(records[0].message(), "Console Error: Failed to load note.json");
        assert_eq!(fx.console.lines(), vec!["Failed to load note.json"]);
    }

    #[tokio::test]
    async fn report_error_carries_subtree_trace() {
        let fx = fixture(true);
        fx.interceptor
            .report_error(
                &ManagedError::new("mic unavailable"),
                ReportContext {
                    subtree_trace: Some("    in Recorder".to_string()),
                },
            )
            .await;
        let records = fx.interceptor.store().load().await.unwrap();
        assert_eq!(records[0].origin(), FaultOrigin::ManagedComponent);
        assert_eq!(records[0].subtree_trace(), Some("    in Recorder"));
        assert_eq!(fx.ui.notices()[0].title, "Component Error");
    }

    #[tokio::test]
    async fn summary_and_clear() {
        let fx = fixture(false);
        fx.channels.raise_uncaught(&ManagedError::new("a"), false);
        fx.channels.reject(1, ManagedError::new("b"));
        fx.channels.reject(2, ManagedError::new("c"));

        let summary = fx.interceptor.fault_summary().await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_origin[&FaultOrigin::ManagedRejection], 2);
        assert_eq!(summary.most_recent.unwrap().message, "c");

        fx.interceptor.clear_all().await.unwrap();
        assert_eq!(fx.interceptor.fault_summary().await.unwrap().total, 0);
    }

    #[test]
    fn fatal_record_is_on_disk_before_runtime_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let open =
            || ManagedFaultStore::new(Arc::new(FileKvStore::new(tmp.path())), "voicejot", 50);
        let ui = Arc::new(RecordingUi::new());
        let channels = ErrorChannels::new(Arc::new(CapturedConsole::new()));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            GlobalFaultInterceptor::install(
                &channels,
                open(),
                ui.clone(),
                &CaptureConfig::default(),
            );
            channels.raise_uncaught(&ManagedError::new("fatal boom"), true);
        });
        drop(rt);
        assert_eq!(ui.prompts().len(), 1);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let records = rt.block_on(open().load()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].origin(), FaultOrigin::ManagedUncaught);
        assert_eq!(records[0].message(), "fatal boom");
    }

    #[tokio::test]
    async fn failed_writes_stay_out_of_the_channels() {
        let kv = Arc::new(FailingKvStore::default());
        let console = Arc::new(CapturedConsole::new());
        let channels = ErrorChannels::new(console.clone());
        let ui = Arc::new(RecordingUi::new());
        let store = ManagedFaultStore::new(kv.clone(), "voicejot", 50);
        let interceptor =
            GlobalFaultInterceptor::install(&channels, store, ui.clone(), &CaptureConfig::default());

        channels.console_error(&["x"]);
        channels.console_error(&["y"]);
        interceptor.flush().await;
        assert_eq!(kv.set_attempts(), 2);
        assert_eq!(console.lines(), vec!["x", "y"]);

        channels.raise_uncaught(&ManagedError::new("boom"), true);
        assert_eq!(kv.set_attempts(), 3);
        assert_eq!(ui.prompts().len(), 1);
        assert_eq!(console.lines(), vec!["x", "y", "Fatal error: boom"]);
    }

    #[test]
    fn summary_display() {
        let summary = FaultSummary::from_records(&[]);
        assert_eq!(summary.to_string(), "Total faults: 0\nMost recent: none");
    }

    #[tokio::test]
    async fn panicking_ui_does_not_escape() {
        struct Exploding;
        impl RecoveryUi for Exploding {
            fn notice(&self, _: Notice) {
                panic!("notice failed");
            }
            fn fatal(&self, _: FatalPrompt) {
                panic!("modal failed");
            }
        }
        let channels = ErrorChannels::new(Arc::new(CapturedConsole::new()));
        let store = ManagedFaultStore::new(Arc::new(MemoryKvStore::new()), "voicejot", 50);
        let interceptor = GlobalFaultInterceptor::install(
            &channels,
            store,
            Arc::new(Exploding),
            &CaptureConfig::default(),
        );
        channels.raise_uncaught(&ManagedError::new("boom"), true);
        interceptor.flush().await;
        assert_eq!(interceptor.store().load().await.unwrap().len(), 1);
    }
}
