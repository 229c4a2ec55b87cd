//! Per-call execution options.

use crate::failure::{FailurePolicy, UnitFailure};
use std::{fmt, sync::Arc};

/// Handler receiving the failure of every failing unit of a call.
///
/// The handler may run concurrently on several workers.
pub type PanicHandler = Arc<dyn Fn(UnitFailure) + Send + Sync + 'static>;

/// Options controlling a single scheduling call.
///
/// Options are never process-wide: every call receives its own value. Entry points
/// accept any `IntoIterator<Item = ExecutionOptions>`; only the first value is
/// honored and an empty iterator means defaults. A bare `ExecutionOptions` can be
/// passed directly.
///
/// ```
/// use fanout::{ExecutionOptions, FailurePolicy};
///
/// let options = ExecutionOptions::new()
///     .with_worker_count(4)
///     .with_failure_policy(FailurePolicy::SurfaceAll)
///     .with_thread_name("resize");
/// assert_eq!(options.worker_count(), 4);
/// ```
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    worker_count: usize,
    on_panic: Option<PanicHandler>,
    failure_policy: FailurePolicy,
    thread_name: Option<String>,
}

impl ExecutionOptions {
    pub fn new() -> ExecutionOptions {
        Default::default()
    }

    /// Returns the first of `options`, or the defaults if there is none.
    pub fn first_of(options: impl IntoIterator<Item = ExecutionOptions>) -> ExecutionOptions {
        options.into_iter().next().unwrap_or_default()
    }

    /// Sets the number of workers. 0 (the default) starts one thread per unit.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Registers a handler for unit failures.
    ///
    /// With a handler registered, failing units no longer fail the call and the
    /// failure policy is ignored.
    pub fn with_panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(UnitFailure) + Send + Sync + 'static,
    {
        self.on_panic = Some(Arc::new(handler));
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Names worker threads `{prefix}-{n}`.
    pub fn with_thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = Some(prefix.into());
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn panic_handler(&self) -> Option<&PanicHandler> {
        self.on_panic.as_ref()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Returns the name of worker `n`, or an empty string for unnamed workers.
    pub(crate) fn worker_name(&self, n: usize) -> String {
        self.prefixed(n)
    }

    pub(crate) fn dispatcher_name(&self) -> String {
        self.prefixed("dispatch")
    }

    fn prefixed(&self, suffix: impl fmt::Display) -> String {
        match self.thread_name.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}-{suffix}"),
            _ => String::new(),
        }
    }
}

impl IntoIterator for ExecutionOptions {
    type Item = ExecutionOptions;
    type IntoIter = std::iter::Once<ExecutionOptions>;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("worker_count", &self.worker_count)
            .field("on_panic", &self.on_panic.as_ref().map(|_| ".."))
            .field("failure_policy", &self.failure_policy)
            .field("thread_name", &self.thread_name)
            .finish()
    }
}
