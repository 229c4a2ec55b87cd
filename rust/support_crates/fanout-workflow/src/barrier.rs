//! Completion barrier for a single scheduling call.
//!
//! A [`CompletionBarrier`] is created with the number of units a call is going to
//! dispatch. Every unit arrives exactly once when it returns, normally or by unwinding,
//! and units that will never be dispatched are abandoned in bulk. The barrier releases
//! exactly once, when the outstanding count reaches zero.
//!
//! The caller either blocks until release ([`wait`](CompletionBarrier::wait)) or until
//! release or cancellation, whichever comes first
//! ([`wait_or_cancel`](CompletionBarrier::wait_or_cancel)).

use crate::cancel::{CancelReason, CancellationToken};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

/// How [`CompletionBarrier::wait_or_cancel`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// Every unit arrived or was abandoned.
    Released,
    /// The token fired while units were still outstanding.
    Cancelled(CancelReason),
}

/// Counts outstanding units of one scheduling call.
///
/// The barrier is shared (through an [`Arc`]) between the caller and the workers of a
/// single call and is never reused.
pub struct CompletionBarrier {
    state: Mutex<BarrierState>,
    released: Condvar,
}

struct BarrierState {
    outstanding: usize,
    /// Set by the cancellation callback registered in `wait_or_cancel`.
    cancel_seen: bool,
}

impl CompletionBarrier {
    /// Creates a barrier expecting `count` arrivals.
    ///
    /// A barrier created with a count of 0 is released from the start.
    pub fn new(count: usize) -> Arc<CompletionBarrier> {
        Arc::new(CompletionBarrier {
            state: Mutex::new(BarrierState {
                outstanding: count,
                cancel_seen: false,
            }),
            released: Condvar::new(),
        })
    }

    /// Returns the number of units that have neither arrived nor been abandoned.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Returns `true` once the outstanding count has reached zero.
    pub fn is_released(&self) -> bool {
        self.outstanding() == 0
    }

    /// Records the completion of one unit.
    ///
    /// # Panics
    ///
    /// Panics if the barrier has already been released.
    pub fn arrive(&self) {
        self.arrive_many(1);
    }

    /// Records `count` units that will never be dispatched.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the outstanding count.
    pub fn abandon(&self, count: usize) {
        if count != 0 {
            self.arrive_many(count);
        }
    }

    /// Returns a guard that arrives on the barrier when dropped, including while
    /// unwinding.
    pub fn arrival(&self) -> Arrival<'_> {
        Arrival(self)
    }

    /// Blocks until the barrier is released.
    pub fn wait(&self) {
        let mut state = self.lock();
        while state.outstanding != 0 {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the barrier is released or `token` fires.
    ///
    /// Release wins if both have happened by the time this returns. The token's deadline
    /// is honored even if nobody else observes the token.
    pub fn wait_or_cancel(self: &Arc<Self>, token: &CancellationToken) -> BarrierWait {
        let weak = Arc::downgrade(self);
        token.on_cancel(move |_| {
            if let Some(barrier) = weak.upgrade() {
                barrier.lock().cancel_seen = true;
                barrier.released.notify_all();
            }
        });

        let mut state = self.lock();
        loop {
            if state.outstanding == 0 {
                return BarrierWait::Released;
            }
            if state.cancel_seen {
                drop(state);
                return self.cancelled(token, CancelReason::Cancelled);
            }
            match token.deadline() {
                None => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(state);
                        return self.cancelled(token, CancelReason::DeadlineExceeded);
                    }
                    state = self
                        .released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Resolves a cancelled wait. Must be called without holding the state lock, since
    /// observing the token may run the callback registered in `wait_or_cancel`.
    fn cancelled(&self, token: &CancellationToken, fallback: CancelReason) -> BarrierWait {
        let reason = token.reason().unwrap_or(fallback);
        if self.is_released() {
            BarrierWait::Released
        } else {
            BarrierWait::Cancelled(reason)
        }
    }

    fn arrive_many(&self, count: usize) {
        let mut state = self.lock();
        assert!(
            state.outstanding >= count,
            "more arrivals than dispatched units"
        );
        state.outstanding -= count;
        let released = state.outstanding == 0;
        drop(state);
        if released {
            self.released.notify_all();
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Arrives on its [`CompletionBarrier`] when dropped.
pub struct Arrival<'a>(&'a CompletionBarrier);

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        self.0.arrive();
    }
}
