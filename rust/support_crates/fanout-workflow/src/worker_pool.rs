//! Fixed-size worker pools fed through a synchronous hand-off queue.
//!
//! A [`WorkerPool`] starts a fixed number of worker threads up front. Items submitted
//! through [`submit`](WorkerPool::submit) are handed directly to an idle worker: the
//! submitting thread blocks while every worker is busy. Each worker applies the same
//! handler to every item it receives, in the order it receives them.
//!
//! Pools are not shared between scheduling calls. Dropping the pool disconnects the
//! queue; workers finish the item they hold and exit.
//!
//! Two flavours exist:
//!
//! - [`WorkerPool::spawn`] for `'static` handlers, whose workers may outlive the caller
//! - [`WorkerPool::spawn_scoped`] for handlers borrowing from the caller, whose workers
//!   are joined by the enclosing [`std::thread::scope`]

use crate::simple_mpmc::{self, Closer, Receiver, Sender};
use log::trace;
use std::{io, sync::Arc, thread};

/// A fixed set of worker threads consuming items of type `T`.
pub struct WorkerPool<T> {
    tx: Sender<T>,
}

impl<T: Send> WorkerPool<T> {
    /// Starts `num_workers` detached worker threads applying `handler` to each item.
    ///
    /// `thread_name` is called with each worker's index (0-based); an empty name leaves
    /// the thread unnamed.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a worker thread could not be started. Workers that did
    /// start exit on their own once the partially built pool is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `num_workers` is 0.
    pub fn spawn<F>(
        num_workers: usize,
        thread_name: impl Fn(usize) -> String,
        handler: F,
    ) -> io::Result<WorkerPool<T>>
    where
        T: 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        assert_ne!(num_workers, 0);

        let (tx, rx) = simple_mpmc::sync_channel::<T>(0);
        let handler = Arc::new(handler);
        for i in 0..num_workers {
            let rx = rx.clone();
            let handler = handler.clone();
            thread_builder(thread_name(i)).spawn(move || Self::thread_fn(i, rx, &*handler))?;
        }

        Ok(WorkerPool { tx })
    }

    /// Starts `num_workers` worker threads inside `scope`, applying a borrowed `handler`
    /// to each item.
    ///
    /// The workers are joined when the scope ends, so they must be released by dropping
    /// the pool before that.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a worker thread could not be started.
    ///
    /// # Panics
    ///
    /// Panics if `num_workers` is 0.
    pub fn spawn_scoped<'scope, 'env, F>(
        scope: &'scope thread::Scope<'scope, 'env>,
        num_workers: usize,
        thread_name: impl Fn(usize) -> String,
        handler: &'scope F,
    ) -> io::Result<WorkerPool<T>>
    where
        T: 'scope,
        F: Fn(T) + Sync,
    {
        assert_ne!(num_workers, 0);

        let (tx, rx) = simple_mpmc::sync_channel::<T>(0);
        for i in 0..num_workers {
            let rx = rx.clone();
            thread_builder(thread_name(i))
                .spawn_scoped(scope, move || Self::thread_fn(i, rx, handler))?;
        }

        Ok(WorkerPool { tx })
    }

    /// Hands `item` to an idle worker, blocking until one takes it.
    ///
    /// Returns the item back if the pool was closed before a worker took it.
    pub fn submit(&self, item: T) -> Result<(), T> {
        self.tx.send(item).map_err(|e| e.0)
    }

    /// Returns a handle that closes the pool's queue, making pending and future
    /// [`submit`](Self::submit) calls fail without dropping the pool.
    pub fn closer(&self) -> Closer<T> {
        self.tx.closer()
    }

    fn thread_fn<F>(index: usize, rx: Receiver<T>, handler: &F)
    where
        F: Fn(T) + ?Sized,
    {
        trace!("worker {index} started");
        while let Ok(item) = rx.recv() {
            handler(item);
        }
        trace!("worker {index} stopped");
    }
}

/// Returns a thread builder, named unless `name` is empty.
pub fn thread_builder(name: String) -> thread::Builder {
    let builder = thread::Builder::new();
    if name.is_empty() {
        builder
    } else {
        builder.name(name)
    }
}
