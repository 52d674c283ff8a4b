//! Subtree fault boundary.
//!
//! UI is a small retained tree of [`Element`]s produced by [`Subtree`]
//! implementations. A render fault is either an `Err(RenderFault)` return
//! or a panic. A [`FaultBoundary`] wraps one subtree, catches both, records
//! a `managed-component` fault and renders a fallback in its place. The
//! fault never reaches the boundary's parent or siblings.
//!
//! ```text
//!            fault in child
//!   Healthy ───────────────▶ Faulted
//!      ▲                        │
//!      └──────── try_again ─────┘   (while retries remain)
//! ```

use std::fmt;
use std::sync::Arc;

use crate::config::CaptureConfig;
use crate::native::contain;
use crate::record::{FaultOrigin, FaultRecord};
use crate::report::export_record;

pub const FALLBACK_TITLE: &str = "Something went wrong";
pub const FALLBACK_TEXT: &str =
    "This part of the app ran into a problem. The rest of the app is still working.";

pub const ACTION_TRY_AGAIN: &str = "try-again";
pub const ACTION_SHOW_DETAILS: &str = "show-details";
pub const ACTION_HIDE_DETAILS: &str = "hide-details";
pub const ACTION_COPY: &str = "copy";

/// A rendered UI node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Heading(String),
    Text(String),
    /// Preformatted text (stacks, traces)
    Code(String),
    Action {
        id: String,
        label: String,
        /// Text handed to the platform when the action carries data (copy)
        payload: Option<String>,
    },
    Column(Vec<Element>),
}

impl Element {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn heading(text: impl Into<String>) -> Self {
        Self::Heading(text.into())
    }

    pub fn action(id: &str, label: &str) -> Self {
        Self::Action {
            id: id.to_string(),
            label: label.to_string(),
            payload: None,
        }
    }

    /// First action with `id`, searching depth first.
    pub fn find_action(&self, id: &str) -> Option<&Self> {
        match self {
            Self::Action { id: own, .. } if own == id => Some(self),
            Self::Column(children) => children.iter().find_map(|c| c.find_action(id)),
            _ => None,
        }
    }

    /// Whether any text-bearing node contains `needle`.
    pub fn contains_text(&self, needle: &str) -> bool {
        match self {
            Self::Heading(t) | Self::Text(t) | Self::Code(t) => t.contains(needle),
            Self::Action { label, .. } => label.contains(needle),
            Self::Column(children) => children.iter().any(|c| c.contains_text(needle)),
        }
    }
}

/// A fault raised while rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFault {
    pub message: String,
    pub stack: Option<String>,
}

impl RenderFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for RenderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RenderFault {}

/// Tracks which subtrees are currently rendering.
#[derive(Debug, Default)]
pub struct RenderContext {
    path: Vec<String>,
    fault_trace: Option<String>,
}

impl RenderContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `child` one level deeper.
    pub fn render_child<S: Subtree + ?Sized>(
        &mut self,
        child: &mut S,
    ) -> Result<Element, RenderFault> {
        self.path.push(child.name().to_string());
        let result = child.render(self);
        match &result {
            Err(_) if self.fault_trace.is_none() => self.fault_trace = Some(self.trace()),
            Err(_) => {}
            // The child absorbed whatever failed below it.
            Ok(_) => self.fault_trace = None,
        }
        self.path.pop();
        result
    }

    /// Current path, innermost first, one `    in <name>` line per level.
    pub fn trace(&self) -> String {
        self.path
            .iter()
            .rev()
            .map(|name| format!("    in {name}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    fn unwind_to(&mut self, depth: usize) {
        self.path.truncate(depth);
    }

    fn take_fault_trace(&mut self) -> Option<String> {
        self.fault_trace.take()
    }
}

/// Something that renders into an [`Element`].
pub trait Subtree {
    fn name(&self) -> &str;
    fn render(&mut self, ctx: &mut RenderContext) -> Result<Element, RenderFault>;
}

/// Receives the records a boundary produces.
pub trait FaultSink: Send + Sync {
    fn record(&self, record: FaultRecord);
}

/// What a boundary knows about the fault it is showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaughtFault {
    pub error: RenderFault,
    pub subtree_trace: String,
    pub record: FaultRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryState {
    Healthy,
    Faulted(CaughtFault),
}

type FallbackFn = dyn Fn(&RenderFault, &str) -> Element + Send + Sync;

pub struct FaultBoundary<S> {
    name: String,
    child: S,
    sink: Arc<dyn FaultSink>,
    state: BoundaryState,
    fallback: Option<Box<FallbackFn>>,
    retry_limit: Option<u32>,
    consecutive_faults: u32,
    details_open: bool,
}

impl<S: fmt::Debug> fmt::Debug for FaultBoundary<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultBoundary")
            .field("name", &self.name)
            .field("child", &self.child)
            .field("state", &self.state)
            .field("retry_limit", &self.retry_limit)
            .field("consecutive_faults", &self.consecutive_faults)
            .finish_non_exhaustive()
    }
}

impl<S: Subtree> FaultBoundary<S> {
    pub fn new(child: S, sink: Arc<dyn FaultSink>) -> Self {
        Self {
            name: "FaultBoundary".to_string(),
            child,
            sink,
            state: BoundaryState::Healthy,
            fallback: None,
            retry_limit: CaptureConfig::default().retry_limit(),
            consecutive_faults: 0,
            details_open: false,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the default fallback view entirely.
    #[must_use]
    pub fn with_fallback(
        mut self,
        fallback: impl Fn(&RenderFault, &str) -> Element + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// `None` allows unlimited retries.
    #[must_use]
    pub fn with_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.retry_limit = limit;
        self
    }

    #[must_use]
    pub fn with_capture_config(self, capture: &CaptureConfig) -> Self {
        self.with_retry_limit(capture.retry_limit())
    }

    pub fn state(&self) -> &BoundaryState {
        &self.state
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.state, BoundaryState::Faulted(_))
    }

    pub fn child(&self) -> &S {
        &self.child
    }

    pub fn child_mut(&mut self) -> &mut S {
        &mut self.child
    }

    /// Whether "Try Again" is still offered.
    pub fn can_retry(&self) -> bool {
        self.retry_limit
            .is_none_or(|limit| self.consecutive_faults < limit)
    }

    /// Leave the faulted state; the next render re-attempts the child.
    ///
    /// Returns false when not faulted or when retries are exhausted.
    pub fn try_again(&mut self) -> bool {
        if !self.is_faulted() || !self.can_retry() {
            return false;
        }
        tracing::debug!(boundary = %self.name, attempt = self.consecutive_faults, "retrying subtree");
        self.state = BoundaryState::Healthy;
        self.details_open = false;
        true
    }

    /// Dispatch a fallback action by id. Returns whether it did anything.
    pub fn press(&mut self, action_id: &str) -> bool {
        match action_id {
            ACTION_TRY_AGAIN => self.try_again(),
            ACTION_SHOW_DETAILS if self.is_faulted() => {
                self.details_open = true;
                true
            }
            ACTION_HIDE_DETAILS if self.details_open => {
                self.details_open = false;
                true
            }
            _ => false,
        }
    }

    fn render_guarded(&mut self, ctx: &mut RenderContext) -> Element {
        if let BoundaryState::Faulted(caught) = &self.state {
            return self.fallback_view(caught);
        }

        let depth = ctx.depth();
        let _ = ctx.take_fault_trace();
        let child = &mut self.child;
        let outcome = contain(|| ctx.render_child(child));

        let (error, subtree_trace) = match outcome {
            Ok(Ok(element)) => {
                self.consecutive_faults = 0;
                return element;
            }
            Ok(Err(error)) => {
                let trace = ctx
                    .take_fault_trace()
                    .unwrap_or_else(|| ctx.trace());
                (error, trace)
            }
            Err(payload) => {
                // A panic skipped every pop below us.
                let trace = ctx.trace();
                ctx.unwind_to(depth);
                let _ = ctx.take_fault_trace();
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "render panicked".to_string()
                };
                (RenderFault::new(message), trace)
            }
        };

        self.consecutive_faults = self.consecutive_faults.saturating_add(1);
        let record = FaultRecord::new(FaultOrigin::ManagedComponent, error.message.clone())
            .with_stack_trace(error.stack.clone())
            .with_subtree_trace(Some(subtree_trace.clone()));
        tracing::warn!(
            boundary = %self.name,
            record_id = %record.id(),
            consecutive_faults = self.consecutive_faults,
            "subtree fault contained: {}",
            error.message
        );
        self.sink.record(record.clone());

        let caught = CaughtFault {
            error,
            subtree_trace,
            record,
        };
        let view = self.fallback_view(&caught);
        self.state = BoundaryState::Faulted(caught);
        view
    }

    fn fallback_view(&self, caught: &CaughtFault) -> Element {
        if let Some(fallback) = &self.fallback {
            return fallback(&caught.error, &caught.subtree_trace);
        }
        if self.details_open {
            return details_view(caught);
        }

        let mut children = vec![
            Element::heading(FALLBACK_TITLE),
            Element::text(FALLBACK_TEXT),
            Element::text(caught.error.message.clone()),
        ];
        if self.can_retry() {
            children.push(Element::action(ACTION_TRY_AGAIN, "Try Again"));
        }
        children.push(Element::action(ACTION_SHOW_DETAILS, "Show Details"));
        Element::Column(children)
    }
}

fn details_view(caught: &CaughtFault) -> Element {
    let mut children = vec![
        Element::heading("Error Details"),
        Element::text(caught.error.message.clone()),
    ];
    if let Some(stack) = &caught.error.stack {
        children.push(Element::Code(stack.clone()));
    }
    if !caught.subtree_trace.is_empty() {
        children.push(Element::Code(caught.subtree_trace.clone()));
    }
    children.push(Element::Action {
        id: ACTION_COPY.to_string(),
        label: "Copy".to_string(),
        payload: Some(export_record(&caught.record)),
    });
    children.push(Element::action(ACTION_HIDE_DETAILS, "Hide Details"));
    Element::Column(children)
}

impl<S: Subtree> Subtree for FaultBoundary<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&mut self, ctx: &mut RenderContext) -> Result<Element, RenderFault> {
        Ok(self.render_guarded(ctx))
    }
}
