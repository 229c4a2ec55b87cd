//! A simple blocking multi-producer, multi-consumer (MPMC) queue.
//!
//! The queue is bounded. A capacity of 0 turns it into a synchronous hand-off point:
//! [`Sender::send`] does not return until some consumer has taken the item, which is
//! how the bounded scheduler applies backpressure to its dispatch loop.
//!
//! Besides the usual "all producers gone" and "all consumers gone" disconnects, the
//! queue can be closed explicitly through a [`Closer`]. Closing stops new items from
//! being accepted, returns a not-yet-taken hand-off item to its producer, and lets
//! consumers drain whatever was already queued before they see the disconnect.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

/// Creates a new bounded channel, returning the sender/receiver halves.
///
/// `bound` is the number of items that can wait in the queue. With `bound == 0` every
/// [`send`](Sender::send) blocks until a [`Receiver`] takes the item.
///
/// The [`Sender`] and the [`Receiver`] can both be cloned.
pub fn sync_channel<T>(bound: usize) -> (Sender<T>, Receiver<T>) {
    let queue = SimpleMpmcQueue::<T>::new(bound);
    (Sender(queue.clone()), Receiver(queue))
}

/// The sending half of a [`sync_channel`].
pub struct Sender<T>(SimpleMpmcQueue<T>);

impl<T> Sender<T> {
    /// Sends a value, blocking while the queue is full (or, for a hand-off queue, until
    /// a consumer takes it).
    ///
    /// Returns the value back if the queue was closed or all receivers are gone before
    /// the value was accepted.
    pub fn send(&self, msg: T) -> Result<(), std::sync::mpsc::SendError<T>> {
        self.0.enqueue(msg).map_err(std::sync::mpsc::SendError)
    }

    /// Returns a handle that can close the queue without keeping it connected.
    pub fn closer(&self) -> Closer<T> {
        Closer(Arc::downgrade(&self.0.inner))
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.add_producer();
        Self(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.0.drop_producer();
    }
}

/// The receiving half of a [`sync_channel`].
///
/// Different threads can share the queue by cloning the receiver.
pub struct Receiver<T>(SimpleMpmcQueue<T>);

impl<T> Receiver<T> {
    /// Blocks until a value is available.
    ///
    /// Returns [`Err`] once the queue is empty and either all senders are gone or the
    /// queue was closed.
    pub fn recv(&self) -> Result<T, std::sync::mpsc::RecvError> {
        self.0.dequeue().map_err(|_| std::sync::mpsc::RecvError)
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0.add_consumer();
        Self(self.0.clone())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.0.drop_consumer();
    }
}

/// Closes a queue from outside, e.g. from a cancellation callback.
///
/// A `Closer` holds only a weak reference: it neither counts as a producer nor keeps
/// the queue alive.
pub struct Closer<T>(Weak<Inner<T>>);

impl<T> Closer<T> {
    /// Closes the queue. Does nothing if the queue no longer exists.
    pub fn close(&self) {
        if let Some(inner) = self.0.upgrade() {
            SimpleMpmcQueue { inner }.close();
        }
    }
}

impl<T> Clone for Closer<T> {
    fn clone(&self) -> Self {
        Closer(self.0.clone())
    }
}

/// An error returned from the `dequeue` method.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum DequeueError {
    /// The queue is empty and either all producers have been dropped or the queue was
    /// closed, so no more items will ever be added.
    Disconnected,
}

/// A simple, blocking, bounded multi-producer, multi-consumer queue.
///
/// The queue can be cloned to create multiple handles for producers and consumers.
pub(crate) struct SimpleMpmcQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SimpleMpmcQueue<T> {
    /// Clones the handle to the queue.
    ///
    /// This does NOT register a producer or a consumer; use `add_producer` or
    /// `add_consumer` for that.
    fn clone(&self) -> Self {
        SimpleMpmcQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SimpleMpmcQueue<T> {
    /// Creates a new queue holding at most `capacity` waiting items.
    ///
    /// A capacity of 0 makes every `enqueue` a synchronous hand-off. The queue starts
    /// with one producer and one consumer registered.
    pub(crate) fn new(capacity: usize) -> Self {
        let inner_state = InnerState {
            queue: VecDeque::new(),
            capacity,
            producers: 1,
            consumers: 1,
            closed: false,
            enqueued: 0,
            dequeued: 0,
        };

        let inner = Inner {
            state: Mutex::new(inner_state),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        };

        SimpleMpmcQueue {
            inner: Arc::new(inner),
        }
    }

    /// Registers an additional producer for this queue.
    pub(crate) fn add_producer(&self) {
        let mut state = self.lock();
        assert!(
            state.producers != 0,
            "Attempt to add producer when the queue is half-closed"
        );
        state.producers += 1;
    }

    /// De-registers a producer.
    ///
    /// When the producer count reaches zero, consumers drain the remaining items and
    /// then see the queue as disconnected.
    pub(crate) fn drop_producer(&self) {
        let mut state = self.lock();
        assert!(
            state.producers >= 1,
            "drop_producer is called more times than add_producer"
        );
        state.producers -= 1;
        if state.producers == 0 {
            self.inner.not_empty.notify_all();
        }
    }

    /// Registers an additional consumer for this queue.
    pub(crate) fn add_consumer(&self) {
        let mut state = self.lock();
        assert!(
            state.consumers > 0,
            "Attempt to add consumer when the queue is closed"
        );
        state.consumers += 1;
    }

    /// De-registers a consumer.
    ///
    /// When the consumer count reaches zero, blocked and future `enqueue` calls fail.
    pub(crate) fn drop_consumer(&self) {
        let mut state = self.lock();
        assert!(
            state.consumers > 0,
            "drop_consumer is called more times than add_consumer"
        );
        state.consumers -= 1;
        if state.consumers == 0 {
            self.inner.not_full.notify_all();
        }
    }

    /// Stops the queue from accepting items.
    ///
    /// Producers blocked in `enqueue` get their item back; consumers drain already
    /// accepted items and then get `Disconnected`.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.inner.not_full.notify_all();
        self.inner.not_empty.notify_all();
    }

    /// Enqueues an item.
    ///
    /// - Blocks while the queue is full.
    /// - With capacity 0, additionally blocks until a consumer has taken the item.
    /// - Returns `Err(item)` if the queue is closed or has no consumers before the item
    ///   was accepted.
    pub(crate) fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();

        loop {
            if state.is_shut() {
                return Err(item);
            }
            // A hand-off queue still needs one slot to park the item in.
            if state.queue.len() >= state.capacity.max(1) {
                state = self
                    .inner
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            break;
        }

        state.queue.push_back(item);
        state.enqueued += 1;
        let ticket = state.enqueued;
        self.inner.not_empty.notify_one();

        if state.capacity == 0 {
            while state.dequeued < ticket {
                if state.is_shut() {
                    // Not taken yet: the parked item is the only one in the queue.
                    if let Some(item) = state.queue.pop_back() {
                        state.enqueued -= 1;
                        return Err(item);
                    }
                }
                state = self
                    .inner
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        Ok(())
    }

    /// Dequeues an item, blocking while the queue is empty and still connected.
    pub(crate) fn dequeue(&self) -> Result<T, DequeueError> {
        let mut state = self.lock();

        loop {
            if let Some(item) = state.queue.pop_front() {
                state.dequeued += 1;
                drop(state);
                // Both capacity waiters and hand-off waiters sleep on `not_full`.
                self.inner.not_full.notify_all();
                return Ok(item);
            }

            if state.producers == 0 || state.closed {
                return Err(DequeueError::Disconnected);
            }

            state = self
                .inner
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, InnerState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The state of the queue that is protected by the Mutex.
struct InnerState<T> {
    queue: VecDeque<T>,
    capacity: usize,
    producers: usize,
    consumers: usize,
    closed: bool,
    /// Number of items ever accepted; a hand-off producer's ticket.
    enqueued: u64,
    /// Number of items ever taken by consumers.
    dequeued: u64,
}

impl<T> InnerState<T> {
    fn is_shut(&self) -> bool {
        self.closed || self.consumers == 0
    }
}

/// The shared core of the queue, containing the state and condition variables.
struct Inner<T> {
    state: Mutex<InnerState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_buffered_queue_keeps_order() {
        let q = SimpleMpmcQueue::<i64>::new(16);
        for i in -8..8 {
            q.enqueue(i).unwrap();
        }
        let drained: Vec<_> = (0..16).map(|_| q.dequeue().unwrap()).collect();
        assert_eq!(drained, (-8..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_send_waits_for_taker() {
        let (tx, rx) = sync_channel::<i32>(0);
        let start = Instant::now();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            rx.recv().unwrap()
        });

        tx.send(7).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn test_second_hand_off_waits_for_slot() {
        let (tx, rx) = sync_channel::<u32>(0);
        let tx2 = tx.clone();
        let first = thread::spawn(move || tx.send(1));
        let second = thread::spawn(move || tx2.send(2));

        thread::sleep(Duration::from_millis(30));
        let mut taken = vec![rx.recv().unwrap(), rx.recv().unwrap()];
        taken.sort();
        assert_eq!(taken, vec![1, 2]);
        assert!(first.join().unwrap().is_ok());
        assert!(second.join().unwrap().is_ok());
    }

    #[test]
    fn test_last_sender_disconnects_after_drain() {
        let (tx, rx) = sync_channel::<&str>(2);
        tx.send("a").unwrap();
        tx.send("b").unwrap();
        drop(tx);

        assert_eq!(rx.recv(), Ok("a"));
        assert_eq!(rx.recv(), Ok("b"));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_send_fails_without_receivers() {
        let (tx, rx) = sync_channel::<u8>(0);
        drop(rx);
        assert_eq!(tx.send(9).map_err(|e| e.0), Err(9));
    }

    #[test]
    fn test_close_returns_parked_item() {
        let (tx, rx) = sync_channel::<i32>(0);
        let closer = tx.closer();

        let handle = thread::spawn(move || tx.send(42));
        thread::sleep(Duration::from_millis(50));
        closer.close();

        match handle.join().unwrap() {
            Err(std::sync::mpsc::SendError(value)) => assert_eq!(value, 42),
            Ok(()) => panic!("item must not be handed off after close"),
        }
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_close_lets_consumers_drain() {
        let (tx, rx) = sync_channel::<i32>(4);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.closer().close();

        assert!(tx.send(3).is_err());
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_closer_does_not_keep_queue_connected() {
        let (tx, rx) = sync_channel::<i32>(0);
        let closer = tx.closer();
        drop(tx);
        assert!(rx.recv().is_err());
        closer.close();
    }

    #[test]
    fn test_every_item_handed_off_once() {
        let (tx, rx) = sync_channel::<usize>(0);
        let received = std::sync::Mutex::new(Vec::new());

        thread::scope(|scope| {
            for producer in 0..4 {
                let tx = tx.clone();
                scope.spawn(move || {
                    for item in (producer * 100)..(producer + 1) * 100 {
                        tx.send(item).unwrap();
                    }
                });
            }
            drop(tx);
            for _ in 0..3 {
                let rx = rx.clone();
                let received = &received;
                scope.spawn(move || {
                    while let Ok(item) = rx.recv() {
                        received.lock().unwrap().push(item);
                    }
                });
            }
        });

        let mut received = received.into_inner().unwrap();
        received.sort_unstable();
        assert_eq!(received, (0..400).collect::<Vec<_>>());
    }
}
