//! Guard for native initialization stages.
//!
//! A failed startup stage is recorded and reported, but the process keeps
//! running in a degraded state instead of crashing.

use std::fmt::Display;

use crate::logging::RAW_TARGET;
use crate::ui::{Notice, RecoveryUi};

use super::hook::{contain, panic_message};
use super::{NativeCrashEntry, NativeFaultStore, PANIC_CLASS};

/// Run one startup stage, containing its failure.
///
/// Returns `Some` with the stage's output on success. On an `Err` return or
/// a panic, writes a record to the native error log with `stage` as its
/// context, shows a best-effort notice and returns `None`.
pub fn guard_startup<T, E, F>(
    stage: &str,
    store: &NativeFaultStore,
    ui: &dyn RecoveryUi,
    f: F,
) -> Option<T>
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    let (class, message) = match contain(f) {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(e)) => (short_type_name::<E>(), e.to_string()),
        Err(payload) => (PANIC_CLASS.to_string(), panic_message(payload.as_ref())),
    };

    tracing::warn!(stage, exception_class = %class, %message, "startup stage failed, continuing degraded");

    let entry = NativeCrashEntry::capture(class, message.clone(), String::new())
        .with_context(Some(stage.to_string()));
    if let Err(e) = store.record_error(entry) {
        tracing::error!(target: RAW_TARGET, error = %e, stage, store = "native", "startup fault record lost");
    }

    let notice = Notice::dismissible(
        "Startup Problem",
        format!("Part of the app failed to start ({stage}). Some features may be unavailable."),
        Some(message),
    );
    if contain(|| ui.notice(notice)).is_err() {
        tracing::error!(target: RAW_TARGET, stage, "recovery ui panicked");
    }

    None
}

fn short_type_name<E>() -> String {
    let full = std::any::type_name::<E>();
    // Keep generic arguments intact: only strip the leading module path.
    let head = full.split('<').next().unwrap_or(full);
    let start = head.rfind("::").map_or(0, |i| i + 2);
    full[start..].to_string()
}
