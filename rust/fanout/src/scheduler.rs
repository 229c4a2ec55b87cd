//! The range scheduler.
//!
//! Every entry point in this crate ends up here: a range `[begin, end)` is turned into
//! `end - begin` units, each unit `i` runs `f(i)` on a worker thread behind a panic
//! boundary, and a [`CompletionBarrier`] tells the caller when the last unit is done.
//!
//! Two execution modes are selected by [`ExecutionOptions::worker_count`]:
//!
//! - `0`: one freshly spawned thread per index
//! - `K > 0`: `min(K, len)` workers fed one index at a time through a zero-capacity
//!   queue, so dispatch blocks while every worker is busy
//!
//! The blocking calls ([`for_range`], [`for_range_with`], [`try_for_range`]) run inside a
//! [`std::thread::scope`], which lets `f` borrow from the caller. The cancellable call
//! ([`for_range_with_cancel`]) may return while units are still running and therefore
//! requires a `'static` function.

use crate::{
    error::{Error, Result},
    failure::{FailureSink, UnitResult},
    options::ExecutionOptions,
};
use fanout_workflow::{
    barrier::{BarrierWait, CompletionBarrier},
    cancel::CancellationToken,
    worker_pool::{WorkerPool, thread_builder},
};
use log::debug;
use std::{
    fmt,
    ops::Range,
    sync::{Arc, Mutex, PoisonError},
    thread,
};

/// A half-open range of unit indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRange {
    pub begin: i64,
    pub end: i64,
}

impl WorkRange {
    pub fn new(begin: i64, end: i64) -> WorkRange {
        WorkRange { begin, end }
    }

    /// Returns `true` if the range holds no index, including when `end < begin`.
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Returns the number of units in the range.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if the length does not fit in `usize`.
    pub fn len(&self) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let len = i128::from(self.end) - i128::from(self.begin);
        usize::try_from(len).map_err(|_| {
            Error::invalid_arg(
                "range",
                format!("[{}, {}) holds more units than can be addressed", self.begin, self.end),
            )
        })
    }

    /// Returns the indices of the range in dispatch order.
    pub fn indices(&self) -> Range<i64> {
        self.begin..self.end.max(self.begin)
    }
}

impl fmt::Display for WorkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Runs `f` on every index of `[begin, end)` with default options.
///
/// Returns once every unit has finished. Does nothing if `end <= begin`.
///
/// # Errors
///
/// With the default [`FailurePolicy::SurfaceLast`](crate::FailurePolicy::SurfaceLast),
/// a panicking unit makes the call fail with `UnitFailed` after all other units have
/// finished. `Spawn` is returned if a worker thread could not be started.
pub fn for_range<F>(begin: i64, end: i64, f: F) -> Result<()>
where
    F: Fn(i64) + Sync,
{
    for_range_with(begin, end, ExecutionOptions::default(), f)
}

/// Runs `f` on every index of `[begin, end)` using the first of `options`.
///
/// ```
/// use fanout::ExecutionOptions;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let hits = AtomicUsize::new(0);
/// fanout::for_range_with(0, 100, ExecutionOptions::new().with_worker_count(4), |_| {
///     hits.fetch_add(1, Ordering::Relaxed);
/// })
/// .unwrap();
/// assert_eq!(hits.into_inner(), 100);
/// ```
pub fn for_range_with<F>(
    begin: i64,
    end: i64,
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    F: Fn(i64) + Sync,
{
    let options = ExecutionOptions::first_of(options);
    execute_scoped(WorkRange::new(begin, end), &options, &|index: i64| -> UnitResult {
        f(index);
        Ok(())
    })
}

/// Runs a fallible `f` on every index of `[begin, end)`.
///
/// A unit returning `Err` is treated exactly like a panicking unit.
pub fn try_for_range<F, E>(
    begin: i64,
    end: i64,
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    F: Fn(i64) -> std::result::Result<(), E> + Sync,
    E: std::error::Error + Send + Sync + 'static,
{
    let options = ExecutionOptions::first_of(options);
    execute_scoped(WorkRange::new(begin, end), &options, &|index: i64| -> UnitResult {
        f(index).map_err(Into::into)
    })
}

/// Runs `f` on every index of `[begin, end)`, returning early if `token` fires.
///
/// Dispatch happens on a separate thread under a child of `token`. The call returns
/// when every unit has finished or when the token is cancelled or its deadline
/// passes, whichever comes first. Cancellation is not an error: the call then returns
/// `Ok(())` and [`CancellationToken::reason`] tells why it stopped.
///
/// Units that already started when the token fired are not interrupted. They keep
/// running in the background after this function returned and may still touch
/// whatever `f` captured. Their failures go to the panic handler if one is
/// registered and are logged otherwise.
pub fn for_range_with_cancel<F>(
    token: &CancellationToken,
    begin: i64,
    end: i64,
    options: impl IntoIterator<Item = ExecutionOptions>,
    f: F,
) -> Result<()>
where
    F: Fn(i64) + Send + Sync + 'static,
{
    let options = ExecutionOptions::first_of(options);
    execute_detached(
        token,
        WorkRange::new(begin, end),
        options,
        Arc::new(move |index: i64| -> UnitResult {
            f(index);
            Ok(())
        }),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unbounded,
    Bounded(usize),
}

impl Mode {
    fn select(worker_count: usize, len: usize) -> Mode {
        match worker_count {
            0 => Mode::Unbounded,
            k => Mode::Bounded(k.min(len)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Unbounded => write!(f, "one thread per unit"),
            Mode::Bounded(workers) => write!(f, "{workers} workers"),
        }
    }
}

fn execute_scoped<U>(range: WorkRange, options: &ExecutionOptions, unit: &U) -> Result<()>
where
    U: Fn(i64) -> UnitResult + Sync,
{
    let len = range.len()?;
    if len == 0 {
        return Ok(());
    }
    let mode = Mode::select(options.worker_count(), len);
    debug!("running {range}: {len} units, {mode}");

    let sink = FailureSink::new(options);
    let barrier = CompletionBarrier::new(len);
    let run = |index: i64| {
        let _arrival = barrier.arrival();
        sink.run(index, unit);
    };

    let dispatched = thread::scope(|scope| -> Result<()> {
        let run = &run;
        match mode {
            Mode::Unbounded => {
                for (n, index) in range.indices().enumerate() {
                    if let Err(e) = thread_builder(options.worker_name(n))
                        .spawn_scoped(scope, move || run(index))
                    {
                        barrier.abandon(len - n);
                        return Err(Error::spawn("unit thread", e));
                    }
                }
            }
            Mode::Bounded(workers) => {
                let pool =
                    WorkerPool::spawn_scoped(scope, workers, |n| options.worker_name(n), run)
                        .map_err(|e| {
                            barrier.abandon(len);
                            Error::spawn("worker pool", e)
                        })?;
                for (n, index) in range.indices().enumerate() {
                    if pool.submit(index).is_err() {
                        barrier.abandon(len - n);
                        break;
                    }
                }
            }
        }
        barrier.wait();
        Ok(())
    });

    dispatched?;
    sink.finish()
}

fn execute_detached(
    token: &CancellationToken,
    range: WorkRange,
    options: ExecutionOptions,
    unit: Arc<dyn Fn(i64) -> UnitResult + Send + Sync>,
) -> Result<()> {
    let len = range.len()?;
    if len == 0 {
        return Ok(());
    }
    let mode = Mode::select(options.worker_count(), len);
    debug!("running {range} with cancellation: {len} units, {mode}");

    let call = token.child();
    let sink = Arc::new(FailureSink::new(&options));
    let barrier = CompletionBarrier::new(len);
    let spawn_error = Arc::new(Mutex::new(None));

    let run: Arc<dyn Fn(i64) + Send + Sync> = {
        let sink = sink.clone();
        let barrier = barrier.clone();
        Arc::new(move |index| {
            let _arrival = barrier.arrival();
            sink.run(index, &*unit);
        })
    };

    let dispatcher = Dispatcher {
        call: call.clone(),
        range,
        len,
        mode,
        barrier: barrier.clone(),
        spawn_error: spawn_error.clone(),
    };
    thread_builder(options.dispatcher_name())
        .spawn(move || dispatcher.run(&options, run))
        .map_err(|e| Error::spawn("dispatcher thread", e))?;

    let outcome = barrier.wait_or_cancel(&call);
    // Stops the dispatcher if it is still handing out indices.
    call.cancel();

    match outcome {
        BarrierWait::Released => {
            let spawn_error = spawn_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match spawn_error {
                Some(err) => Err(err),
                None => sink.finish(),
            }
        }
        BarrierWait::Cancelled(reason) => {
            sink.detach();
            debug!(
                "{range}: {reason}, leaving {} units behind",
                barrier.outstanding()
            );
            Ok(())
        }
    }
}

/// Hands out the indices of a cancellable call from its own thread.
struct Dispatcher {
    call: CancellationToken,
    range: WorkRange,
    len: usize,
    mode: Mode,
    barrier: Arc<CompletionBarrier>,
    spawn_error: Arc<Mutex<Option<Error>>>,
}

impl Dispatcher {
    fn run(self, options: &ExecutionOptions, run: Arc<dyn Fn(i64) + Send + Sync>) {
        match self.mode {
            Mode::Unbounded => {
                for (n, index) in self.range.indices().enumerate() {
                    if self.call.is_cancelled() {
                        return self.stop(n, None);
                    }
                    let run = run.clone();
                    if let Err(e) =
                        thread_builder(options.worker_name(n)).spawn(move || run(index))
                    {
                        return self.stop(n, Some(Error::spawn("unit thread", e)));
                    }
                }
            }
            Mode::Bounded(workers) => {
                let pool = match WorkerPool::spawn(
                    workers,
                    |n| options.worker_name(n),
                    move |index: i64| run(index),
                ) {
                    Ok(pool) => pool,
                    Err(e) => return self.stop(0, Some(Error::spawn("worker pool", e))),
                };
                // Unblocks a pending hand-off as soon as the call is cancelled.
                let closer = pool.closer();
                self.call.on_cancel(move |_| closer.close());

                for (n, index) in self.range.indices().enumerate() {
                    if self.call.is_cancelled() || pool.submit(index).is_err() {
                        return self.stop(n, None);
                    }
                }
            }
        }
    }

    /// Abandons the units from the `dispatched`-th on.
    fn stop(&self, dispatched: usize, error: Option<Error>) {
        if let Some(error) = error {
            *self
                .spawn_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(error);
        }
        self.barrier.abandon(self.len - dispatched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_range_len() {
        assert_eq!(WorkRange::new(0, 10).len().unwrap(), 10);
        assert_eq!(WorkRange::new(-5, 5).len().unwrap(), 10);
        assert_eq!(WorkRange::new(5, 5).len().unwrap(), 0);
        assert_eq!(WorkRange::new(5, -5).len().unwrap(), 0);
        assert!(WorkRange::new(5, -5).indices().next().is_none());
        assert_eq!(WorkRange::new(-2, 1).indices().collect::<Vec<_>>(), vec![-2, -1, 0]);
        assert_eq!(WorkRange::new(3, 7).to_string(), "[3, 7)");
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn test_range_len_overflow() {
        let err = WorkRange::new(i64::MIN, i64::MAX).len().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn test_mode_select() {
        assert_eq!(Mode::select(0, 100), Mode::Unbounded);
        assert_eq!(Mode::select(4, 100), Mode::Bounded(4));
        assert_eq!(Mode::select(16, 3), Mode::Bounded(3));
    }

    #[test]
    fn test_scoped_unit_borrows_caller_data() {
        let slots: Vec<AtomicUsize> = (0..32).map(|_| AtomicUsize::new(0)).collect();
        for workers in [0, 1, 5] {
            let options = ExecutionOptions::new().with_worker_count(workers);
            execute_scoped(WorkRange::new(0, 32), &options, &|index: i64| -> UnitResult {
                slots[index as usize].fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert!(slots.iter().all(|slot| slot.load(Ordering::SeqCst) == 3));
    }

    #[test]
    fn test_failures_wait_for_siblings() {
        let finished = AtomicUsize::new(0);
        let err = for_range(0, 8, |index| {
            if index == 0 {
                panic!("first unit");
            }
            thread::sleep(std::time::Duration::from_millis(20));
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
        assert_eq!(finished.load(Ordering::SeqCst), 7);
        match err.kind() {
            ErrorKind::UnitFailed { index, message } => {
                assert_eq!(*index, 0);
                assert_eq!(message, "first unit");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_try_for_range_errors_are_failures() {
        let err = try_for_range(0, 4, ExecutionOptions::new().with_worker_count(2), |index| {
            if index == 3 {
                Err(std::io::Error::other("disk full"))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "unit 3 failed: disk full");
    }

    #[test]
    fn test_detached_completes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        for workers in [0, 3] {
            let hits = hits.clone();
            for_range_with_cancel(
                &token,
                0,
                10,
                ExecutionOptions::new().with_worker_count(workers),
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 20);
        assert_eq!(token.reason(), None);
    }

    #[test]
    fn test_detached_already_cancelled() {
        let hits = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        token.cancel();
        {
            let hits = hits.clone();
            for_range_with_cancel(&token, 0, 10, ExecutionOptions::new(), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(token.is_cancelled());
        // The dispatcher observes the fired child token before handing out anything.
        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
