//! Diagnostic channels of the managed (async application) layer.
//!
//! [`ErrorChannels`] is the host object the rest of the application reports
//! into. It has three handler slots, each replaceable at runtime:
//!
//! - uncaught errors, `(error, is_fatal)`
//! - rejections of tracked async tasks, `Unhandled { id, error }` and a
//!   later `Handled { id }`
//! - console-error calls, `(args)`
//!
//! Each slot starts with a base handler that prints through the channel's
//! [`ConsoleSink`]. Installing a handler returns nothing; callers that want
//! to chain read the current handler first and call it from their own.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use crate::interceptor::GlobalFaultInterceptor;
use crate::native::contain;

/// An error as seen by the managed channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedError {
    pub message: Option<String>,
    pub stack: Option<String>,
}

impl ManagedError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Message from `Display`, stack from the `source()` chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = format!("Error: {error}");
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push_str("\nCaused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            message: Some(error.to_string()),
            stack: Some(stack),
        }
    }

    /// Message from a panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            Some((*s).to_string())
        } else {
            payload.downcast_ref::<String>().cloned()
        };
        Self {
            message,
            stack: None,
        }
    }

    /// The message, if it is present and not blank.
    pub fn message_or(&self, fallback: &str) -> String {
        self.message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

impl fmt::Display for ManagedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message.as_deref().unwrap_or("<no message>"))
    }
}

/// Event on the rejection channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionEvent {
    Unhandled { id: u64, error: ManagedError },
    /// A rejection reported earlier was handled after all.
    Handled { id: u64 },
}

pub type UncaughtHandler = Arc<dyn Fn(&ManagedError, bool) + Send + Sync>;
pub type RejectionHandler = Arc<dyn Fn(&RejectionEvent) + Send + Sync>;
pub type ConsoleHook = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Where the base handlers print.
pub trait ConsoleSink: Send + Sync {
    fn print(&self, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StderrConsole;

impl ConsoleSink for StderrConsole {
    fn print(&self, line: &str) {
        eprintln!("{line}");
    }
}

/// Keeps printed lines in memory.
#[derive(Debug, Default)]
pub struct CapturedConsole {
    lines: Mutex<Vec<String>>,
}

impl CapturedConsole {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConsoleSink for CapturedConsole {
    fn print(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}

static GLOBAL_CHANNELS: OnceLock<Arc<ErrorChannels>> = OnceLock::new();

pub struct ErrorChannels {
    uncaught: RwLock<UncaughtHandler>,
    rejection: RwLock<RejectionHandler>,
    console: RwLock<ConsoleHook>,
    sink: Arc<dyn ConsoleSink>,
    next_rejection_id: AtomicU64,
    interceptor: OnceLock<Arc<GlobalFaultInterceptor>>,
}

impl fmt::Debug for ErrorChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannels")
            .field("next_rejection_id", &self.next_rejection_id)
            .field("intercepted", &self.interceptor.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ErrorChannels {
    fn default() -> Self {
        Self::new(Arc::new(StderrConsole))
    }
}

impl ErrorChannels {
    /// Channels whose base handlers print to `sink`.
    pub fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            uncaught: RwLock::new(base_uncaught(Arc::clone(&sink))),
            rejection: RwLock::new(base_rejection(Arc::clone(&sink))),
            console: RwLock::new(base_console(Arc::clone(&sink))),
            sink,
            next_rejection_id: AtomicU64::new(1),
            interceptor: OnceLock::new(),
        }
    }

    /// Process-wide channels, printing to stderr.
    pub fn global() -> &'static Arc<Self> {
        GLOBAL_CHANNELS.get_or_init(|| Arc::new(Self::default()))
    }

    /// Slot holding the interceptor installed on these channels.
    pub(crate) fn interceptor_slot(&self) -> &OnceLock<Arc<GlobalFaultInterceptor>> {
        &self.interceptor
    }

    pub fn sink(&self) -> Arc<dyn ConsoleSink> {
        Arc::clone(&self.sink)
    }

    pub fn global_handler(&self) -> UncaughtHandler {
        Arc::clone(&self.uncaught.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_global_handler(&self, handler: UncaughtHandler) {
        *self.uncaught.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn rejection_handler(&self) -> RejectionHandler {
        Arc::clone(&self.rejection.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_rejection_handler(&self, handler: RejectionHandler) {
        *self.rejection.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn console_hook(&self) -> ConsoleHook {
        Arc::clone(&self.console.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_console_hook(&self, hook: ConsoleHook) {
        *self.console.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    // Handlers are cloned out of their slot before being called, so a
    // handler may replace slots or raise again without deadlocking.

    pub fn raise_uncaught(&self, error: &ManagedError, is_fatal: bool) {
        let handler = self.global_handler();
        handler(error, is_fatal);
    }

    pub fn reject(&self, id: u64, error: ManagedError) {
        let handler = self.rejection_handler();
        handler(&RejectionEvent::Unhandled { id, error });
    }

    pub fn mark_handled(&self, id: u64) {
        let handler = self.rejection_handler();
        handler(&RejectionEvent::Handled { id });
    }

    pub fn console_error<S: AsRef<str>>(&self, args: &[S]) {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        let hook = self.console_hook();
        hook(&args);
    }

    /// Next rejection id; ids increase monotonically per channel set.
    pub fn next_rejection_id(&self) -> u64 {
        self.next_rejection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one synchronous managed step. A panic inside it is raised on the
    /// uncaught channel instead of unwinding further.
    pub fn run_guarded<R>(&self, is_fatal: bool, f: impl FnOnce() -> R) -> Option<R> {
        match contain(f) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.raise_uncaught(&ManagedError::from_panic(payload.as_ref()), is_fatal);
                None
            }
        }
    }

    /// Spawn a task whose failure nobody awaits.
    ///
    /// An `Err` result or a panic becomes an unhandled rejection with a
    /// fresh id. The join handle yields `Some` only on success.
    pub fn spawn_tracked<F, T, E>(self: &Arc<Self>, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let channels = Arc::clone(self);
        let id = self.next_rejection_id();
        tokio::spawn(async move {
            let error = match (Contained { inner: Box::pin(fut) }).await {
                Ok(Ok(value)) => return Some(value),
                Ok(Err(e)) => ManagedError::from_error(&e),
                Err(payload) => ManagedError::from_panic(payload.as_ref()),
            };
            channels.reject(id, error);
            None
        })
    }
}

/// Polls a future inside [`contain`], turning a panic into a ready `Err`.
struct Contained<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Contained<F> {
    type Output = std::thread::Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match contain(|| inner.poll(cx)) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

fn base_uncaught(sink: Arc<dyn ConsoleSink>) -> UncaughtHandler {
    Arc::new(move |error, is_fatal| {
        let kind = if is_fatal { "Fatal" } else { "Uncaught" };
        sink.print(&format!("{kind} error: {error}"));
        if let Some(stack) = &error.stack {
            sink.print(stack);
        }
    })
}

fn base_rejection(sink: Arc<dyn ConsoleSink>) -> RejectionHandler {
    Arc::new(move |event| {
        if let RejectionEvent::Unhandled { id, error } = event {
            sink.print(&format!("Possible unhandled rejection (id: {id}): {error}"));
        }
    })
}

fn base_console(sink: Arc<dyn ConsoleSink>) -> ConsoleHook {
    Arc::new(move |args| sink.print(&args.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (Arc<CapturedConsole>, Arc<ErrorChannels>) {
        let console = Arc::new(CapturedConsole::new());
        let channels = Arc::new(ErrorChannels::new(console.clone()));
        (console, channels)
    }

    #[test]
    fn base_handlers_print() {
        let (console, channels) = channels();
        channels.console_error(&["hello", "world"]);
        channels.raise_uncaught(&ManagedError::new("boom"), true);
        channels.reject(3, ManagedError::new("late"));
        channels.mark_handled(3);
        assert_eq!(
            console.lines(),
            vec![
                "hello world",
                "Fatal error: boom",
                "Possible unhandled rejection (id: 3): late",
            ]
        );
    }

    #[test]
    fn replaced_handler_can_chain_previous() {
        let (console, channels) = channels();
        let previous = channels.console_hook();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_hook = Arc::clone(&seen);
        channels.set_console_hook(Arc::new(move |args| {
            seen_in_hook.lock().unwrap().push(args.join("|"));
            previous(args);
        }));
        channels.console_error(&["a", "b"]);
        assert_eq!(*seen.lock().unwrap(), vec!["a|b"]);
        assert_eq!(console.lines(), vec!["a b"]);
    }

    #[test]
    fn run_guarded_routes_panic_to_uncaught() {
        let (console, channels) = channels();
        let out = channels.run_guarded(false, || -> u8 { panic!("step failed") });
        assert!(out.is_none());
        assert_eq!(console.lines(), vec!["Uncaught error: step failed"]);
        assert_eq!(channels.run_guarded(false, || 5), Some(5));
    }

    #[test]
    fn rejection_ids_are_monotonic() {
        let (_, channels) = channels();
        let a = channels.next_rejection_id();
        let b = channels.next_rejection_id();
        assert!(b > a);
    }

    #[test]
    fn managed_error_from_error_chain() {
        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("sync failed")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }
        let error = ManagedError::from_error(&Outer(std::io::Error::other("disk full")));
        assert_eq!(error.message.as_deref(), Some("sync failed"));
        assert_eq!(
            error.stack.as_deref(),
            Some("Error: sync failed\nCaused by: disk full")
        );
    }

    #[test]
    fn message_or_falls_back_on_blank() {
        assert_eq!(ManagedError::default().message_or("x"), "x");
        assert_eq!(ManagedError::new("  ").message_or("x"), "x");
        assert_eq!(ManagedError::new("y").message_or("x"), "y");
    }

    #[tokio::test]
    async fn spawn_tracked_rejects_on_error_and_panic() {
        let (console, channels) = channels();
        let ok = channels
            .spawn_tracked(async { Ok::<_, std::io::Error>(1) })
            .await
            .unwrap();
        assert_eq!(ok, Some(1));

        let failed = channels
            .spawn_tracked(async { Err::<(), _>(std::io::Error::other("network down")) })
            .await
            .unwrap();
        assert!(failed.is_none());

        let panicked = channels
            .spawn_tracked(async {
                if true {
                    panic!("task exploded");
                }
                Ok::<(), std::io::Error>(())
            })
            .await
            .unwrap();
        assert!(panicked.is_none());

        let lines = console.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("network down"));
        assert!(lines[1].ends_with("task exploded"));
    }
}
