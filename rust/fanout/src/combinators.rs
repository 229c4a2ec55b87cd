//! Task combinators built on the range scheduler.
//!
//! - [`race`] - Run every task, return when the first one finishes
//! - [`all`] - Run every task, return when the last one finishes
//!
//! A task is any `FnOnce()`; [`Task`] is the boxed form for heterogeneous lists.

use crate::{
    error::{Error, Result},
    failure::panic_message,
    options::ExecutionOptions,
    scheduler::{for_range_with, for_range_with_cancel},
};
use fanout_workflow::{cancel::CancellationToken, worker_pool::thread_builder};
use log::{debug, warn};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

/// A boxed zero-argument unit of work.
pub type Task<'a> = Box<dyn FnOnce() + Send + 'a>;

/// Runs every task on its own thread and returns the index of the first one to finish.
///
/// A task finishes by returning or by panicking; panics are logged and otherwise count
/// as finishing. The remaining tasks are not stopped and keep running in the
/// background. Returns `None` for an empty task list.
///
/// ```
/// use std::{thread, time::Duration};
///
/// let winner = fanout::race([300, 10, 200].map(|ms| {
///     move || thread::sleep(Duration::from_millis(ms))
/// }));
/// assert_eq!(winner, Some(1));
/// ```
pub fn race<I, F>(tasks: I) -> Option<usize>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send + 'static,
{
    race_with_cancel(&CancellationToken::new(), tasks)
}

/// Like [`race`], but also returns `None` if `token` fires before any task finished.
pub fn race_with_cancel<I, F>(token: &CancellationToken, tasks: I) -> Option<usize>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send + 'static,
{
    let race = token.child();
    let winner = Arc::new(OnceLock::new());

    let mut started = 0usize;
    for (index, task) in tasks.into_iter().enumerate() {
        let race = race.clone();
        let winner = winner.clone();
        let spawned = thread_builder(String::new()).spawn(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                warn!("task {index} panicked: {}", panic_message(payload.as_ref()));
            }
            if winner.set(index).is_ok() {
                race.cancel();
            }
        });
        match spawned {
            Ok(_) => started += 1,
            Err(e) => warn!("failed to start task {index}: {e}"),
        }
    }
    if started == 0 {
        return None;
    }

    race.wait();
    let winner = winner.get().copied();
    debug!("race of {started} tasks won by {winner:?}");
    winner
}

/// Runs every task and returns once all of them have finished.
///
/// Tasks may borrow from the caller. Failures follow the default
/// [`FailurePolicy`](crate::FailurePolicy), with the task's position as the unit index.
pub fn all<I, F>(tasks: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send,
{
    all_with(ExecutionOptions::default(), tasks)
}

/// Like [`all`], using the first of `options`.
pub fn all_with<I, F>(options: impl IntoIterator<Item = ExecutionOptions>, tasks: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send,
{
    let slots = TaskSlots::new(tasks);
    for_range_with(0, slots.len()?, options, |index| slots.run(index))
}

/// Like [`all_with`], but returns early if `token` fires.
///
/// Tasks that already started keep running in the background after the call returned.
/// See [`for_range_with_cancel`] for the exact contract.
pub fn all_with_cancel<I, F>(
    token: &CancellationToken,
    options: impl IntoIterator<Item = ExecutionOptions>,
    tasks: I,
) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send + 'static,
{
    let slots = Arc::new(TaskSlots::new(tasks));
    let len = slots.len()?;
    for_range_with_cancel(token, 0, len, options, move |index| slots.run(index))
}

/// Tasks waiting to be claimed by the unit with the same index.
struct TaskSlots<F>(Vec<Mutex<Option<F>>>);

impl<F: FnOnce()> TaskSlots<F> {
    fn new(tasks: impl IntoIterator<Item = F>) -> Self {
        TaskSlots(tasks.into_iter().map(|task| Mutex::new(Some(task))).collect())
    }

    fn len(&self) -> Result<i64> {
        i64::try_from(self.0.len()).map_err(|_| Error::invalid_arg("tasks", "too many tasks"))
    }

    fn run(&self, index: i64) {
        let task = usize::try_from(index)
            .ok()
            .and_then(|index| self.0.get(index))
            .and_then(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).take());
        if let Some(task) = task {
            task();
        }
    }
}
