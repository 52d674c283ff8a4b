//! faultline-core: fault capture and reporting for VoiceJot
//!
//! Captures faults in two layers, persists them in two independent bounded
//! logs, and reconciles both only when a report is opened.
//!
//! # Architecture
//!
//! ```text
//! ErrorChannels ──▶ GlobalFaultInterceptor ──┐
//! FaultBoundary ───────────(FaultSink)───────┼──▶ ManagedFaultStore ──┐
//!                                            │                        ├──▶ UnifiedReport
//! panic hook ──▶ NativeFaultInterceptor ──┐  │                        │
//! guard_startup ──────────────────────────┴──┴──▶ NativeFaultStore ◀─ NativeBridge
//! ```
//!
//! # Modules
//!
//! - `record`: The fault record and its origins
//! - `storage`: Key-value namespaces and the bounded JSON log
//! - `managed_store`: Async managed fault store (bound 50)
//! - `native`: Native store (bound 20), panic hook, startup guard
//! - `channels`: Managed diagnostic channels (uncaught, rejection, console)
//! - `interceptor`: Global managed interceptor, summary and manual reports
//! - `boundary`: Subtree fault boundary and render tree
//! - `bridge`: Managed-to-native bridge
//! - `report`: Unified merge, list, detail, export and clear
//! - `ui`: Recovery notices and fatal prompts
//! - `config`: Configuration management
//! - `logging`: Structured logging
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod boundary;
pub mod bridge;
pub mod channels;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod managed_store;
pub mod native;
pub mod record;
pub mod report;
pub mod storage;
pub mod ui;

pub use boundary::{Element, FaultBoundary, FaultSink, RenderContext, RenderFault, Subtree};
pub use bridge::{LocalNativeBridge, NativeBridge};
pub use channels::{ErrorChannels, ManagedError, RejectionEvent};
pub use config::Config;
pub use error::{BridgeError, ConfigError, Error, Result, StoreError};
pub use interceptor::{FaultSummary, GlobalFaultInterceptor, ReportContext};
pub use managed_store::ManagedFaultStore;
pub use native::{NativeCrashEntry, NativeFaultInterceptor, NativeFaultStore, guard_startup};
pub use record::{DeviceContext, FaultOrigin, FaultRecord};
pub use report::{ClearConfirmation, ClearOutcome, UnifiedReport, export_record};
pub use ui::{FatalPrompt, LogRecoveryUi, Notice, RecoveryUi};

/// Version of the faultline-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
