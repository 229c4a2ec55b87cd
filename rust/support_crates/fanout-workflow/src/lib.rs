//! Synchronization building blocks for the `fanout` scheduler.
//!
//! This crate holds the low-level pieces that a single scheduling call is assembled
//! from. None of them keep process-wide state: every instance is created for one
//! call and dropped when that call (or the units it detached) is done.
//!
//! # Key Components
//!
//! - [`cancel::CancellationToken`] - A one-shot, idempotent stop signal with an optional
//!   deadline, parent/child propagation and blocking waits.
//! - [`barrier::CompletionBarrier`] - Counts outstanding units and releases exactly once,
//!   either unconditionally or racing against a cancellation token.
//! - [`simple_mpmc`] - A blocking multi-producer, multi-consumer queue. A capacity of 0
//!   gives a synchronous hand-off: `send` returns only once a consumer took the item.
//! - [`worker_pool::WorkerPool`] - A fixed set of worker threads draining a hand-off
//!   queue, in both `'static` and scoped flavours.

pub mod barrier;
pub mod cancel;
pub mod simple_mpmc;
pub mod worker_pool;
