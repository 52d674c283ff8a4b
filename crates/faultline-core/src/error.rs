//! Error types for faultline-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for faultline-core
#[derive(Error, Debug)]
pub enum Error {
    /// Fault record store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Cross-runtime bridge errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Store(err) => Some(err.remediation()),
            Self::Bridge(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show effective config", "fl config")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Errors raised by the key-value layer underneath both fault stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored value under {key} is not a valid record list: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode records for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage worker stopped: {0}")]
    WorkerGone(String),
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { .. } | Self::Write { .. } => Remediation::new(
                "The fault store could not be accessed. Check data directory permissions.",
            )
            .command("Show effective config", "fl config")
            .alternative("Point --data-dir at a writable directory."),
            Self::Corrupt { key, .. } => Remediation::new(format!(
                "The stored fault list under {key} is unreadable."
            ))
            .command("Clear all records", "fl clear --yes")
            .alternative("Inspect the JSON file by hand and fix or delete it."),
            Self::Encode { .. } => {
                Remediation::new("A fault record could not be serialized; this is a bug.")
            }
            Self::WorkerGone(_) => Remediation::new(
                "The background fault writer stopped. Restart the application.",
            ),
        }
    }
}

/// Errors crossing the managed/native boundary.
///
/// A `ReadFailure` is never reported as an empty record list.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("could not read native fault records: {0}")]
    ReadFailure(String),

    #[error("could not clear native fault records: {0}")]
    ClearFailure(String),

    #[error("could not write native fault record: {0}")]
    WriteFailure(String),
}

impl BridgeError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailure(_) => Remediation::new(
                "Native fault records are unavailable. Managed records can still be listed.",
            )
            .command("List records", "fl list")
            .alternative("Check the native store directory under the data dir."),
            Self::ClearFailure(_) => {
                Remediation::new("Native fault records were not cleared. Retry the clear.")
                    .command("Clear all records", "fl clear --yes")
            }
            Self::WriteFailure(_) => Remediation::new(
                "The native fault record could not be written. Check data directory permissions.",
            )
            .command("Show effective config", "fl config"),
        }
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    ParseFailed { path: String, message: String },

    #[error("invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed { path, .. } => {
                Remediation::new(format!("Make sure {path} exists and is readable."))
                    .alternative("Unset FAULTLINE_CONFIG to fall back to defaults.")
            }
            Self::ParseFailed { path, .. } => {
                Remediation::new(format!("Fix the TOML syntax in {path}."))
                    .command("Show defaults", "fl config")
            }
            Self::ValidationError(_) => Remediation::new("Correct the invalid config value.")
                .command("Show effective config", "fl config")
                .alternative("Store capacities must be at least 1."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_render_lists_commands_and_alternatives() {
        let text = Remediation::new("Do the thing.")
            .command("Run", "fl list")
            .alternative("Or not.")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("  Do the thing."));
        assert!(text.contains("    - Run: fl list"));
        assert!(text.contains("    - Or not."));
    }

    #[test]
    fn every_bridge_error_has_remediation() {
        for err in [
            BridgeError::ReadFailure("x".into()),
            BridgeError::ClearFailure("x".into()),
            BridgeError::WriteFailure("x".into()),
        ] {
            assert!(!err.remediation().summary.is_empty());
        }
    }

    #[test]
    fn top_level_error_wraps_store_error() {
        let err: Error = StoreError::WorkerGone("closed".into()).into();
        assert!(err.to_string().starts_with("Store error:"));
        assert!(err.remediation().is_some());
    }
}
