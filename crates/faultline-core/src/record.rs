//! The fault record shared by every capture path.
//!
//! A [`FaultRecord`] is created once, at the moment a fault is observed, and
//! never mutated afterwards. The managed store persists records in this
//! shape directly (camelCase JSON); the native store uses its own encoding
//! ([`crate::native::NativeCrashEntry`]) that converts into this shape.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;

/// Sentinel used when a fault carries no usable message.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Display format for capture times.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

const ID_SUFFIX_LEN: usize = 9;
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Which capture path produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultOrigin {
    /// Uncaught exception in the managed runtime
    ManagedUncaught,
    /// Unhandled rejection of an async task
    ManagedRejection,
    /// Intercepted console-error call
    ManagedConsole,
    /// Render fault caught by a boundary, or a manual report
    ManagedComponent,
    /// Uncaught native fault (panic hook or native startup guard)
    NativeUncaught,
}

impl FaultOrigin {
    /// All origins, in display order.
    pub const ALL: [Self; 5] = [
        Self::ManagedUncaught,
        Self::ManagedRejection,
        Self::ManagedConsole,
        Self::ManagedComponent,
        Self::NativeUncaught,
    ];

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManagedUncaught => "managed-uncaught",
            Self::ManagedRejection => "managed-rejection",
            Self::ManagedConsole => "managed-console",
            Self::ManagedComponent => "managed-component",
            Self::NativeUncaught => "native-uncaught",
        }
    }

    /// Short badge for list rendering.
    #[must_use]
    pub const fn badge(self) -> &'static str {
        match self {
            Self::ManagedUncaught => "UNCAUGHT",
            Self::ManagedRejection => "REJECTION",
            Self::ManagedConsole => "CONSOLE",
            Self::ManagedComponent => "COMPONENT",
            Self::NativeUncaught => "NATIVE",
        }
    }

    #[must_use]
    pub const fn is_native(self) -> bool {
        matches!(self, Self::NativeUncaught)
    }
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device metadata attached to native records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContext {
    pub manufacturer: String,
    pub model: String,
    pub os_version: String,
    /// Platform API level, where the platform has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_level: Option<u32>,
    pub arch: String,
}

impl DeviceContext {
    /// Probe the current device, applying configured overrides.
    #[must_use]
    pub fn detect(overrides: &DeviceConfig) -> Self {
        Self {
            manufacturer: overrides
                .manufacturer
                .clone()
                .unwrap_or_else(|| whoami::platform().to_string()),
            model: overrides
                .model
                .clone()
                .unwrap_or_else(whoami::devicename),
            os_version: whoami::distro(),
            api_level: None,
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}, {}", self.manufacturer, self.model, self.os_version, self.arch)?;
        if let Some(level) = self.api_level {
            write!(f, ", API {level}")?;
        }
        f.write_str(")")
    }
}

/// One captured fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    origin: FaultOrigin,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subtree_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_context: Option<DeviceContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thread_name: Option<String>,
}

impl FaultRecord {
    /// Capture a new record now, with a fresh id.
    #[must_use]
    pub fn new(origin: FaultOrigin, message: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        Self {
            id: new_record_id(timestamp),
            timestamp,
            origin,
            message: normalize_message(message.into()),
            stack_trace: None,
            subtree_trace: None,
            device_context: None,
            thread_name: None,
        }
    }

    /// Override the capture time (used when decoding the native encoding).
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack: Option<String>) -> Self {
        self.stack_trace = stack.filter(|s| !s.is_empty());
        self
    }

    /// Only meaningful for `managed-component` records.
    #[must_use]
    pub fn with_subtree_trace(mut self, trace: Option<String>) -> Self {
        self.subtree_trace = trace.filter(|s| !s.is_empty());
        self
    }

    /// Only meaningful for `native-uncaught` records.
    #[must_use]
    pub fn with_device_context(mut self, device: Option<DeviceContext>) -> Self {
        self.device_context = device;
        self
    }

    /// Only meaningful for `native-uncaught` records.
    #[must_use]
    pub fn with_thread_name(mut self, thread: Option<String>) -> Self {
        self.thread_name = thread;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn origin(&self) -> FaultOrigin {
        self.origin
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    pub fn subtree_trace(&self) -> Option<&str> {
        self.subtree_trace.as_deref()
    }

    pub fn device_context(&self) -> Option<&DeviceContext> {
        self.device_context.as_ref()
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }
}

/// `<epoch millis>-<random suffix>`
#[must_use]
pub fn new_record_id(timestamp: DateTime<Utc>) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| char::from(ID_CHARSET[rng.random_range(0..ID_CHARSET.len())]))
        .collect();
    format!("{}-{suffix}", timestamp.timestamp_millis())
}

#[must_use]
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Replace an empty or blank message with [`UNKNOWN_ERROR`].
#[must_use]
pub fn normalize_message(message: String) -> String {
    if message.trim().is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        message
    }
}
