//! Bounded, fault-tolerant parallel iteration.
//!
//! `fanout` runs one function over every index of a range `[begin, end)` on parallel
//! worker threads, waits for the units to finish (or for a cancellation token to fire),
//! and turns panics inside individual units into a single recoverable error instead of
//! tearing down the process.
//!
//! # Key Components
//!
//! - [`scheduler`] - The range scheduler: [`for_range`], [`for_range_with`],
//!   [`try_for_range`] and the cancellable [`for_range_with_cancel`]
//! - [`combinators`] - [`race`] (first finisher wins) and [`all`] (wait for every task)
//! - [`adapters`] - Typed `for_each_*` entry points over slices and maps
//! - [`options::ExecutionOptions`] - Per-call worker count, failure handler and policy
//! - [`failure`] - The per-unit failure model and the aggregation policy
//!
//! # Execution Modes
//!
//! With `worker_count == 0` (the default) every index gets its own thread. With
//! `worker_count == K` exactly `K` workers are started and indices are handed to them
//! one at a time through a zero-capacity queue, so at most `K` units run at once and
//! dispatch blocks while all of them are busy. Unit bodies never run on the caller's
//! thread.
//!
//! # Failures
//!
//! Each unit runs behind a panic boundary. A failing unit never aborts its siblings.
//! When a panic handler is registered it receives every failure and the call succeeds;
//! otherwise the call's [`FailurePolicy`] decides whether failures are dropped, or the
//! last one or all of them are returned as an [`Error`] once every unit has finished.
//!
//! # Cancellation
//!
//! [`for_range_with_cancel`] and [`all_with_cancel`] return as soon as the supplied
//! [`CancellationToken`] fires. Cancellation is cooperative: units that already started
//! are not interrupted and keep running in the background after the call returned,
//! possibly still writing to data they captured. Only dispatch of new units stops.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let squares: Vec<AtomicU64> = (0..16).map(|_| AtomicU64::new(0)).collect();
//! fanout::for_range(0, 16, |i| {
//!     squares[i as usize].store((i * i) as u64, Ordering::Relaxed);
//! })
//! .unwrap();
//! assert_eq!(squares[5].load(Ordering::Relaxed), 25);
//! ```

pub mod adapters;
pub mod combinators;
pub mod error;
pub mod failure;
pub mod options;
pub mod scheduler;

pub use adapters::{
    for_each_element, for_each_entry, for_each_index, for_each_indexed, for_each_key, repeat,
};
pub use combinators::{Task, all, all_with, all_with_cancel, race, race_with_cancel};
pub use error::{Error, ErrorKind, Result};
pub use failure::{FailureCause, FailurePolicy, FailureSummary, UnitFailure};
pub use fanout_workflow::cancel::{CancelReason, CancellationToken};
pub use options::ExecutionOptions;
pub use scheduler::{WorkRange, for_range, for_range_with, for_range_with_cancel, try_for_range};
