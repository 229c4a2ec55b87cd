//! Per-unit failures and how a call aggregates them.
//!
//! Every unit runs behind a panic boundary and produces either success or a
//! [`UnitFailure`]. What happens to the failures of a call is decided once, up front:
//!
//! - a registered panic handler receives each [`UnitFailure`] as it happens, and the
//!   call itself succeeds;
//! - otherwise the call's [`FailurePolicy`] applies once all units have finished.

use crate::{
    error::{Error, Result},
    options::{ExecutionOptions, PanicHandler},
};
use log::{error, warn};
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

/// Boxed error returned by a fallible unit.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The raw outcome of one unit.
pub(crate) type UnitResult = std::result::Result<(), BoxError>;

/// What went wrong inside a unit.
pub enum FailureCause {
    /// The unit panicked; this is the payload passed to `panic!`.
    Panic(Box<dyn Any + Send + 'static>),
    /// The unit returned an error.
    Error(BoxError),
}

/// A failure of the unit with the given index.
pub struct UnitFailure {
    index: i64,
    cause: FailureCause,
}

impl UnitFailure {
    pub fn new(index: i64, cause: FailureCause) -> UnitFailure {
        UnitFailure { index, cause }
    }

    /// Returns the index of the failed unit.
    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn cause(&self) -> &FailureCause {
        &self.cause
    }

    pub fn into_cause(self) -> FailureCause {
        self.cause
    }

    /// Returns the panic payload, if the unit panicked.
    pub fn panic_payload(&self) -> Option<&(dyn Any + Send + 'static)> {
        match &self.cause {
            FailureCause::Panic(payload) => Some(payload.as_ref()),
            FailureCause::Error(_) => None,
        }
    }

    /// Renders the cause as text.
    ///
    /// Panic payloads of type `&str` and `String` are rendered verbatim.
    pub fn message(&self) -> String {
        match &self.cause {
            FailureCause::Panic(payload) => panic_message(payload.as_ref()),
            FailureCause::Error(err) => err.to_string(),
        }
    }

    pub fn summary(&self) -> FailureSummary {
        FailureSummary {
            index: self.index,
            message: self.message(),
        }
    }
}

impl fmt::Debug for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitFailure")
            .field("index", &self.index)
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit {} failed: {}", self.index, self.message())
    }
}

/// The index and rendered message of a failure, as carried by [`Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSummary {
    pub index: i64,
    pub message: String,
}

/// What a call does with unit failures when no panic handler is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log each failure at `warn` level and succeed.
    Discard,
    /// Return the last observed failure as [`ErrorKind::UnitFailed`](crate::ErrorKind::UnitFailed).
    #[default]
    SurfaceLast,
    /// Return every failure, ordered by index, as
    /// [`ErrorKind::UnitFailures`](crate::ErrorKind::UnitFailures).
    SurfaceAll,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Collects the failures of one call according to its options.
pub(crate) struct FailureSink {
    handler: Option<PanicHandler>,
    policy: FailurePolicy,
    collected: Mutex<Vec<FailureSummary>>,
    /// Set once the caller stopped waiting; late failures are no longer collected.
    detached: AtomicBool,
}

impl FailureSink {
    pub fn new(options: &ExecutionOptions) -> FailureSink {
        FailureSink {
            handler: options.panic_handler().cloned(),
            policy: options.failure_policy(),
            collected: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
        }
    }

    /// Runs unit `index` behind a panic boundary and records its failure, if any.
    pub fn run<U>(&self, index: i64, unit: &U)
    where
        U: Fn(i64) -> UnitResult + ?Sized,
    {
        let cause = match panic::catch_unwind(AssertUnwindSafe(|| unit(index))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => FailureCause::Error(err),
            Err(payload) => FailureCause::Panic(payload),
        };
        self.record(UnitFailure::new(index, cause));
    }

    pub fn record(&self, failure: UnitFailure) {
        if let Some(handler) = &self.handler {
            let index = failure.index();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(failure))) {
                error!(
                    "panic handler panicked on unit {index}: {}",
                    panic_message(payload.as_ref())
                );
            }
            return;
        }

        if self.detached.load(Ordering::Acquire) {
            warn!("{failure} after the call stopped waiting");
            return;
        }

        match self.policy {
            FailurePolicy::Discard => warn!("{failure}"),
            FailurePolicy::SurfaceLast => {
                let mut collected = self.lock();
                collected.clear();
                collected.push(failure.summary());
            }
            FailurePolicy::SurfaceAll => self.lock().push(failure.summary()),
        }
    }

    /// Stops collecting; failures from units still running are only logged.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Turns the collected failures into the call's result.
    pub fn finish(&self) -> Result<()> {
        let mut collected = std::mem::take(&mut *self.lock());
        if collected.is_empty() {
            return Ok(());
        }
        match self.policy {
            FailurePolicy::Discard => Ok(()),
            FailurePolicy::SurfaceLast => match collected.pop() {
                Some(last) => Err(Error::unit_failed(last.index, last.message)),
                None => Ok(()),
            },
            FailurePolicy::SurfaceAll => {
                collected.sort_by_key(|failure| failure.index);
                Err(Error::unit_failures(collected))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FailureSummary>> {
        self.collected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn failing(index: i64) -> UnitResult {
        if index % 2 == 1 {
            Err(format!("odd index {index}").into())
        } else {
            Ok(())
        }
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_run_catches_panics() {
        let sink = FailureSink::new(&ExecutionOptions::new());
        sink.run(3, &|_: i64| -> UnitResult { panic!("boom") });
        match sink.finish().unwrap_err().into_kind() {
            ErrorKind::UnitFailed { index, message } => {
                assert_eq!(index, 3);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_surface_all_sorts_by_index() {
        let options = ExecutionOptions::new().with_failure_policy(FailurePolicy::SurfaceAll);
        let sink = FailureSink::new(&options);
        for index in (0..6).rev() {
            sink.run(index, &failing);
        }
        let err = sink.finish().unwrap_err();
        let indices: Vec<_> = err.failures().iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 3, 5]);
    }

    #[test]
    fn test_discard() {
        let options = ExecutionOptions::new().with_failure_policy(FailurePolicy::Discard);
        let sink = FailureSink::new(&options);
        sink.run(1, &failing);
        assert!(sink.finish().is_ok());
    }

    #[test]
    fn test_handler_takes_precedence() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = {
            let seen = seen.clone();
            ExecutionOptions::new()
                .with_failure_policy(FailurePolicy::SurfaceAll)
                .with_panic_handler(move |failure| seen.lock().unwrap().push(failure.index()))
        };
        let sink = FailureSink::new(&options);
        sink.run(1, &failing);
        sink.run(2, &failing);
        assert!(sink.finish().is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let options = ExecutionOptions::new().with_panic_handler(|_| panic!("handler"));
        let sink = FailureSink::new(&options);
        sink.run(1, &failing);
        assert!(sink.finish().is_ok());
    }

    #[test]
    fn test_detached_sink_stops_collecting() {
        let sink = FailureSink::new(&ExecutionOptions::new());
        sink.detach();
        sink.run(1, &failing);
        assert!(sink.finish().is_ok());
    }

    #[test]
    fn test_unit_failure_accessors() {
        let failure = UnitFailure::new(9, FailureCause::Panic(Box::new("bad")));
        assert_eq!(failure.index(), 9);
        assert_eq!(
            failure.panic_payload().and_then(|p| p.downcast_ref::<&str>()),
            Some(&"bad")
        );
        assert_eq!(failure.to_string(), "unit 9 failed: bad");

        let failure = UnitFailure::new(2, FailureCause::Error("io".into()));
        assert!(failure.panic_payload().is_none());
        assert_eq!(failure.summary().message, "io");
    }
}
