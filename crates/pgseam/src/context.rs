//! Per-session execution context: tracing span, timeout and tag.

use std::time::Duration;
use tracing::Span;

/// Attached to a session with `with_context`; every statement the session
/// runs executes inside a child span of `span`, under `timeout`.
#[derive(Debug, Clone, Default)]
pub struct Context {
    span: Option<Span>,
    timeout: Option<Duration>,
    tag: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context parented on the caller's current span.
    pub fn current() -> Self {
        Self::new().with_span(Span::current())
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Deadline for each statement; on expiry the statement is cancelled
    /// server-side (best effort) and `OrmError::Timeout` is recorded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Label reported to monitors and logs.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}
