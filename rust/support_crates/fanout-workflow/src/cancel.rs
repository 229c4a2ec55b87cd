//! A one-shot cancellation signal with an optional deadline.
//!
//! A [`CancellationToken`] starts out live and fires at most once, either because
//! [`cancel`](CancellationToken::cancel) was called, because its deadline elapsed, or
//! because its parent fired. Once fired it stays fired and reports the
//! [`CancelReason`] that won.
//!
//! ## Deadlines
//!
//! There is no timer thread behind a deadline. The token notices an elapsed deadline
//! the first time anyone looks at it after the fact ([`reason`](CancellationToken::reason),
//! [`is_cancelled`](CancellationToken::is_cancelled), [`on_cancel`](CancellationToken::on_cancel)
//! or one of the waits) and fires right there, running its callbacks on the observing
//! thread. Blocking waits compute their own timeout from the deadline, so a thread that
//! waits on a token is always woken in time.
//!
//! ## Thread Safety
//!
//! Tokens are cheap to clone; all clones share the same state. All methods can be
//! called concurrently from any thread.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

/// Why a [`CancellationToken`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// [`CancellationToken::cancel`] was called on the token or one of its ancestors.
    Cancelled,
    /// The deadline of the token (or an ancestor) elapsed first.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "operation cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

impl std::error::Error for CancelReason {}

/// A cloneable, one-shot stop signal.
///
/// ## Lifecycle
///
/// 1. **Live**: created by [`new`](Self::new), [`with_deadline`](Self::with_deadline),
///    [`with_timeout`](Self::with_timeout) or derived via [`child`](Self::child)
/// 2. **Fired**: cancelled explicitly, by deadline, or by its parent; the first cause wins
///    and later calls are no-ops
///
/// A token built with [`new`](Self::new) never fires on its own. It is the value to pass
/// when the caller has nothing to cancel with; there is no shared global token.
#[derive(Clone)]
pub struct CancellationToken(Arc<TokenCell>);

impl CancellationToken {
    /// Creates a live token without a deadline.
    pub fn new() -> CancellationToken {
        Self::with_optional_deadline(None)
    }

    /// Creates a live token that fires with [`CancelReason::DeadlineExceeded`] at `deadline`.
    pub fn with_deadline(deadline: Instant) -> CancellationToken {
        Self::with_optional_deadline(Some(deadline))
    }

    /// Creates a live token that fires with [`CancelReason::DeadlineExceeded`] once
    /// `timeout` has elapsed from now.
    ///
    /// A timeout too large to be represented as an [`Instant`] means no deadline.
    pub fn with_timeout(timeout: Duration) -> CancellationToken {
        Self::with_optional_deadline(Instant::now().checked_add(timeout))
    }

    fn with_optional_deadline(deadline: Option<Instant>) -> CancellationToken {
        CancellationToken(Arc::new(TokenCell::new(deadline)))
    }

    /// Derives a child token.
    ///
    /// The child inherits the deadline of this token and fires, with the same reason,
    /// whenever this token fires. Cancelling the child does not affect this token.
    pub fn child(&self) -> CancellationToken {
        self.derive(self.0.deadline)
    }

    /// Derives a child token whose deadline is the earlier of this token's deadline
    /// and `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> CancellationToken {
        let deadline = match (self.0.deadline, Instant::now().checked_add(timeout)) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        self.derive(deadline)
    }

    fn derive(&self, deadline: Option<Instant>) -> CancellationToken {
        let child = Self::with_optional_deadline(deadline);
        // The parent only keeps a weak reference, so dropped children are not kept alive.
        let weak = Arc::downgrade(&child.0);
        let key = self.0.register(Box::new(move |reason| {
            if let Some(cell) = weak.upgrade() {
                cell.fire(reason);
            }
        }));
        if let Some(key) = key {
            // The child removes this registration once it fires or is dropped.
            let mut state = child.0.lock();
            if state.reason.is_none() {
                state.parent = Some((Arc::downgrade(&self.0), key));
            }
        }
        child
    }

    /// Fires the token with [`CancelReason::Cancelled`].
    ///
    /// Does nothing if the token has already fired.
    pub fn cancel(&self) {
        self.0.fire(CancelReason::Cancelled);
    }

    /// Returns the reason the token fired, or `None` while it is still live.
    ///
    /// Observing a token past its deadline fires it.
    pub fn reason(&self) -> Option<CancelReason> {
        self.0.poll()
    }

    /// Returns `true` once the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Returns the deadline of the token, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.0.deadline
    }

    /// Returns the time left until the deadline, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Registers a callback to run once when the token fires.
    ///
    /// If the token has already fired, `callback` runs immediately on the calling
    /// thread. Otherwise it runs on whichever thread fires the token. Callbacks must
    /// not block for long, since they delay every other callback of the token.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        self.0.register(Box::new(callback));
    }

    /// Blocks until the token fires and returns the reason.
    ///
    /// A token without a deadline that nobody cancels blocks forever.
    pub fn wait(&self) -> CancelReason {
        let mut state = self.0.lock();
        loop {
            if let Some(reason) = state.reason {
                return reason;
            }
            match self.0.deadline {
                None => {
                    state = self
                        .0
                        .condvar
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.0.fire_locked(state, CancelReason::DeadlineExceeded);
                    }
                    state = self
                        .0
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Blocks until the token fires or `timeout` elapses.
    ///
    /// Returns `Some(reason)` if the token fired, `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CancelReason> {
        let Some(limit) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut state = self.0.lock();
        loop {
            if let Some(reason) = state.reason {
                return Some(reason);
            }
            let now = Instant::now();
            if self.0.deadline.is_some_and(|deadline| now >= deadline) {
                return Some(self.0.fire_locked(state, CancelReason::DeadlineExceeded));
            }
            if now >= limit {
                return None;
            }
            let until = self.0.deadline.map_or(limit, |deadline| deadline.min(limit));
            state = self
                .0
                .condvar
                .wait_timeout(state, until - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
impl CancellationToken {
    /// Number of callbacks waiting for this token to fire.
    pub(crate) fn pending_callbacks(&self) -> usize {
        self.0.lock().callbacks.len()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = self.0.lock().reason;
        f.debug_struct("CancellationToken")
            .field("reason", &reason)
            .field("deadline", &self.0.deadline)
            .finish()
    }
}

type Callback = Box<dyn FnOnce(CancelReason) + Send + 'static>;

struct TokenState {
    reason: Option<CancelReason>,
    /// Pending callbacks keyed by registration order.
    callbacks: BTreeMap<u64, Callback>,
    next_key: u64,
    /// The parent and the key of the callback through which it fires this token.
    parent: Option<(Weak<TokenCell>, u64)>,
}

struct TokenCell {
    state: Mutex<TokenState>,
    condvar: Condvar,
    deadline: Option<Instant>,
}

impl TokenCell {
    fn new(deadline: Option<Instant>) -> TokenCell {
        TokenCell {
            state: Mutex::new(TokenState {
                reason: None,
                callbacks: BTreeMap::new(),
                next_key: 0,
                parent: None,
            }),
            condvar: Condvar::new(),
            deadline,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn poll(&self) -> Option<CancelReason> {
        let state = self.lock();
        if let Some(reason) = state.reason {
            return Some(reason);
        }
        if self.is_past_deadline() {
            return Some(self.fire_locked(state, CancelReason::DeadlineExceeded));
        }
        None
    }

    /// Adds a callback and returns its key, or runs it right away if the token has
    /// already fired and returns `None`.
    fn register(&self, callback: Callback) -> Option<u64> {
        let mut state = self.lock();
        if state.reason.is_none() && self.is_past_deadline() {
            drop(state);
            self.fire(CancelReason::DeadlineExceeded);
            state = self.lock();
        }
        match state.reason {
            Some(reason) => {
                drop(state);
                callback(reason);
                None
            }
            None => {
                let key = state.next_key;
                state.next_key += 1;
                state.callbacks.insert(key, callback);
                Some(key)
            }
        }
    }

    /// Removes a pending callback. Does nothing if it already ran.
    fn unregister(&self, key: u64) {
        // The callback is dropped after the lock is released.
        let removed = self.lock().callbacks.remove(&key);
        drop(removed);
    }

    fn fire(&self, reason: CancelReason) -> CancelReason {
        let state = self.lock();
        self.fire_locked(state, reason)
    }

    /// Transitions to the fired state and runs the callbacks outside of the lock.
    ///
    /// Returns the reason the token ended up with, which is the earlier one if the
    /// token had already fired.
    fn fire_locked(
        &self,
        mut state: MutexGuard<'_, TokenState>,
        reason: CancelReason,
    ) -> CancelReason {
        if let Some(existing) = state.reason {
            return existing;
        }
        state.reason = Some(reason);
        let callbacks = std::mem::take(&mut state.callbacks);
        let parent = state.parent.take();
        drop(state);
        self.condvar.notify_all();
        detach(parent);
        for callback in callbacks.into_values() {
            callback(reason);
        }
        reason
    }
}

impl Drop for TokenCell {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        detach(state.parent.take());
    }
}

fn detach(parent: Option<(Weak<TokenCell>, u64)>) {
    if let Some((parent, key)) = parent
        && let Some(parent) = parent.upgrade()
    {
        parent.unregister(key);
    }
}
