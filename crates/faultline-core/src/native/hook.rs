//! Process-wide panic hook that persists uncaught native faults.

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};

use crate::error::StoreError;
use crate::logging::RAW_TARGET;
use crate::record::DeviceContext;

use super::{NativeCrashEntry, NativeFaultStore, PANIC_CLASS};

/// Maximum backtrace text kept per record (64 KiB).
const MAX_BACKTRACE_LEN: usize = 64 * 1024;

static NATIVE_INTERCEPTOR: OnceLock<NativeFaultInterceptor> = OnceLock::new();
static HOOK_INSTALLED: Once = Once::new();

thread_local! {
    static CONTAINMENT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Run `f`, catching a panic as a contained fault.
///
/// A panic raised inside `f` is handled by the caller (a fault boundary, a
/// guarded managed step, the startup guard), so the panic hook does not
/// persist it as an uncaught native fault. The previous hook still runs.
pub fn contain<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    CONTAINMENT_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CONTAINMENT_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    result
}

/// Whether the current thread is inside [`contain`].
#[must_use]
pub fn is_contained() -> bool {
    CONTAINMENT_DEPTH.with(Cell::get) > 0
}

/// Singleton owner of the native panic hook.
#[derive(Debug)]
pub struct NativeFaultInterceptor {
    store: Arc<NativeFaultStore>,
    device: DeviceContext,
    captured: AtomicU64,
}

impl NativeFaultInterceptor {
    /// Install the hook once per process.
    ///
    /// The first call wins; later calls return the existing interceptor and
    /// ignore their arguments. Whatever hook was registered before the first
    /// call is kept and invoked after every capture.
    pub fn install(store: Arc<NativeFaultStore>, device: DeviceContext) -> &'static Self {
        let interceptor = NATIVE_INTERCEPTOR.get_or_init(|| Self {
            store,
            device,
            captured: AtomicU64::new(0),
        });

        HOOK_INSTALLED.call_once(|| {
            let previous = panic::take_hook();
            panic::set_hook(Box::new(move |info| {
                if let Some(interceptor) = NATIVE_INTERCEPTOR.get() {
                    interceptor.capture(info);
                }
                previous(info);
            }));
            tracing::debug!(store = "native", "native panic hook installed");
        });

        interceptor
    }

    /// The installed interceptor, if any.
    pub fn get() -> Option<&'static Self> {
        NATIVE_INTERCEPTOR.get()
    }

    pub fn store(&self) -> &NativeFaultStore {
        &self.store
    }

    /// Panics persisted by this process so far.
    pub fn captured_count(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Raw JSON text of the panic-hook log.
    pub fn get_crash_logs(&self) -> Result<String, StoreError> {
        self.store.get_crash_logs()
    }

    pub fn clear_crash_logs(&self) -> Result<(), StoreError> {
        self.store.clear_crash_logs()
    }

    // Runs inside the panic hook: a panic here aborts the process, so every
    // failure is reported and dropped.
    fn capture(&self, info: &PanicHookInfo<'_>) {
        if is_contained() {
            return;
        }

        let backtrace = Backtrace::force_capture();
        let entry = entry_from_panic(info, &backtrace).with_device(Some(self.device.clone()));

        match self.store.record_crash(entry) {
            Ok(_) => {
                self.captured.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                eprintln!("faultline: failed to persist native crash record: {e}");
                tracing::error!(target: RAW_TARGET, error = %e, store = "native", "native crash record lost");
            }
        }
    }
}

fn entry_from_panic(info: &PanicHookInfo<'_>, backtrace: &Backtrace) -> NativeCrashEntry {
    let stack = match info.location() {
        Some(loc) => format!(
            "at {}:{}:{}\n{}",
            loc.file(),
            loc.line(),
            loc.column(),
            truncate_backtrace(backtrace.to_string())
        ),
        None => truncate_backtrace(backtrace.to_string()),
    };
    NativeCrashEntry::capture(PANIC_CLASS, panic_message(info.payload()), stack)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn truncate_backtrace(mut text: String) -> String {
    if text.len() > MAX_BACKTRACE_LEN {
        let mut cut = MAX_BACKTRACE_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contain_catches_and_marks() {
        assert!(!is_contained());
        let result = contain(|| {
            assert!(is_contained());
            42
        });
        assert_eq!(result.unwrap(), 42);
        assert!(!is_contained());
    }

    #[test]
    fn contain_nests_and_unwinds_depth() {
        let outer = contain(|| {
            let inner = contain(|| panic!("inner"));
            assert!(inner.is_err());
            is_contained()
        });
        assert!(outer.unwrap());
        assert!(!is_contained());
    }

    #[test]
    fn payload_messages() {
        let s: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(s.as_ref()), "static str");
        let s: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic payload");
    }

    #[test]
    fn long_backtrace_is_truncated_on_char_boundary() {
        let text = "é".repeat(MAX_BACKTRACE_LEN);
        let truncated = truncate_backtrace(text);
        assert!(truncated.ends_with("... [truncated]"));
        assert!(truncated.len() <= MAX_BACKTRACE_LEN + 20);
    }

    #[test]
    fn short_backtrace_is_untouched() {
        assert_eq!(truncate_backtrace("frame".to_string()), "frame");
    }
}
