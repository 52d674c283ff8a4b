//! User-facing recovery surfaces.
//!
//! Capture paths never draw anything themselves. They describe what the
//! user should see ([`Notice`], [`FatalPrompt`]) and hand it to a
//! [`RecoveryUi`], which the host application implements. Every call is
//! best-effort: an implementation must not block or panic.

use std::sync::Mutex;

/// An action offered on a notice or prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    Dismiss,
    ShowDetails,
    Restart,
}

impl UiAction {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Dismiss => "Dismiss",
            Self::ShowDetails => "Show Details",
            Self::Restart => "Restart",
        }
    }
}

/// Transient, non-blocking notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: String,
    /// Text revealed by [`UiAction::ShowDetails`]
    pub details: Option<String>,
    pub actions: Vec<UiAction>,
}

impl Notice {
    /// Notice offering Dismiss and Show Details.
    #[must_use]
    pub fn dismissible(
        title: impl Into<String>,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            details,
            actions: vec![UiAction::Dismiss, UiAction::ShowDetails],
        }
    }
}

/// Blocking modal shown after a fatal managed fault.
///
/// The process cannot continue in a trustworthy state; `restart_required`
/// tells the host it must restart through its own platform primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalPrompt {
    pub title: String,
    pub message: String,
    /// Message and stack, revealed by [`UiAction::ShowDetails`]
    pub details: String,
    pub restart_required: bool,
}

impl FatalPrompt {
    #[must_use]
    pub fn new(message: &str, stack: Option<&str>) -> Self {
        let details = match stack {
            Some(stack) => format!("{message}\n\n{stack}"),
            None => message.to_string(),
        };
        Self {
            title: "Unexpected Error".to_string(),
            message: "The app ran into a problem it cannot recover from and needs to restart."
                .to_string(),
            details,
            restart_required: true,
        }
    }

    #[must_use]
    pub const fn actions(&self) -> [UiAction; 2] {
        [UiAction::ShowDetails, UiAction::Restart]
    }
}

/// Host-provided presentation of notices and fatal prompts.
pub trait RecoveryUi: Send + Sync {
    fn notice(&self, notice: Notice);
    fn fatal(&self, prompt: FatalPrompt);
}

/// Presents everything as log events. Used by the CLI and as a default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecoveryUi;

impl RecoveryUi for LogRecoveryUi {
    fn notice(&self, notice: Notice) {
        tracing::info!(title = %notice.title, details = ?notice.details, "{}", notice.message);
    }

    fn fatal(&self, prompt: FatalPrompt) {
        tracing::error!(
            title = %prompt.title,
            restart_required = prompt.restart_required,
            details = %prompt.details,
            "{}",
            prompt.message
        );
    }
}

/// Keeps every notice and prompt it is shown, for inspection.
#[derive(Debug, Default)]
pub struct RecordingUi {
    notices: Mutex<Vec<Notice>>,
    prompts: Mutex<Vec<FatalPrompt>>,
}

impl RecordingUi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn prompts(&self) -> Vec<FatalPrompt> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl RecoveryUi for RecordingUi {
    fn notice(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(notice);
    }

    fn fatal(&self, prompt: FatalPrompt) {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(prompt);
    }
}
