//! Single-shot completion cells.
//!
//! Every channel operation returns a [`Promise`]: a one-time completion cell
//! carrying either success or a [`ChannelError`]. Listeners registered before
//! completion run exactly once, on the completing thread. A promise can be
//! latched *uncancellable* once the core accepts the operation; the connect
//! promise deliberately stays cancellable so user cancellation can abort the
//! connect.
//!
//! The close promise is a *guarded* cell: its public completion methods
//! always refuse, and only the channel core can complete it.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::warn;

use crate::error::ChannelError;

type Listener<T> = Box<dyn FnOnce(&Result<T, ChannelError>) + Send>;

enum State<T> {
    Pending {
        listeners: SmallVec<[Listener<T>; 2]>,
        uncancellable: bool,
    },
    Done(Result<T, ChannelError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
    /// Guarded cells refuse external completion (close promise).
    guarded: bool,
}

/// A single-shot completion cell with listeners.
pub struct Promise<T = ()> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Create a new pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self::with_guard(false)
    }

    /// Create a guarded promise: `succeed`/`fail`/`cancel` always refuse.
    /// Only the owning core completes it, via the `force_*` methods.
    pub(crate) fn new_guarded() -> Self {
        Self::with_guard(true)
    }

    fn with_guard(guarded: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    listeners: SmallVec::new(),
                    uncancellable: false,
                }),
                done: Condvar::new(),
                guarded,
            }),
        }
    }

    /// Returns true once the promise has completed (success, failure, or
    /// cancellation).
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// Returns true if completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(Ok(_)))
    }

    /// Returns true if completed with a failure (including cancellation).
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(Err(_)))
    }

    /// Returns true if completed by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            *self.inner.state.lock(),
            State::Done(Err(ChannelError::Cancelled))
        )
    }

    /// Latch the promise so later `cancel` calls refuse.
    ///
    /// Returns true if the operation may proceed: the promise is now
    /// uncancellable, or already completed by something other than
    /// cancellation.
    pub fn set_uncancellable(&self) -> bool {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending { uncancellable, .. } => {
                *uncancellable = true;
                true
            }
            State::Done(Err(ChannelError::Cancelled)) => false,
            State::Done(_) => true,
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Complete with success. Returns false if already complete or guarded.
    pub fn succeed(&self, value: T) -> bool {
        if self.inner.guarded {
            warn!("refusing external completion of a guarded promise");
            return false;
        }
        self.complete(Ok(value))
    }

    /// Complete with failure. Returns false if already complete or guarded.
    pub fn fail(&self, err: ChannelError) -> bool {
        if self.inner.guarded {
            warn!("refusing external completion of a guarded promise");
            return false;
        }
        self.complete(Err(err))
    }

    /// Cancel the promise. Refused when uncancellable, guarded, or already
    /// complete.
    pub fn cancel(&self) -> bool {
        if self.inner.guarded {
            return false;
        }
        {
            let state = self.inner.state.lock();
            if let State::Pending { uncancellable, .. } = &*state {
                if *uncancellable {
                    return false;
                }
            } else {
                return false;
            }
        }
        self.complete(Err(ChannelError::Cancelled))
    }

    /// Core-internal completion that bypasses the guard.
    pub(crate) fn force_succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Core-internal failure that bypasses the guard.
    pub(crate) fn force_fail(&self, err: ChannelError) -> bool {
        self.complete(Err(err))
    }

    fn complete(&self, result: Result<T, ChannelError>) -> bool {
        let (listeners, shared) = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { listeners, .. } => {
                    let taken = mem::take(listeners);
                    let shared = result.clone();
                    *state = State::Done(result);
                    self.inner.done.notify_all();
                    (taken, shared)
                }
            }
        };
        for listener in listeners {
            listener(&shared);
        }
        true
    }

    /// Register a completion listener. Runs immediately (on the calling
    /// thread) if the promise is already complete, otherwise on the
    /// completing thread.
    pub fn on_complete(&self, f: impl FnOnce(&Result<T, ChannelError>) + Send + 'static) {
        let ready = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { listeners, .. } => {
                    listeners.push(Box::new(f));
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        f(&ready);
    }

    /// Snapshot the result, if complete.
    #[must_use]
    pub fn result(&self) -> Option<Result<T, ChannelError>> {
        match &*self.inner.state.lock() {
            State::Done(result) => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Block until completion or timeout. Test/embedder helper; never call
    /// from an event loop thread.
    pub fn wait(&self, timeout: Duration) -> Option<Result<T, ChannelError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return Some(result.clone());
            }
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    State::Done(result) => Some(result.clone()),
                    State::Pending { .. } => None,
                };
            }
        }
    }
}

/// Complete with success, logging a warning if the promise was already done.
pub fn safe_succeed<T: Clone + Send + 'static>(promise: &Promise<T>, value: T) {
    if !promise.succeed(value) {
        warn!("promise already complete, dropping success");
    }
}

/// Complete with failure, logging a warning if the promise was already done.
pub fn safe_fail<T: Clone + Send + 'static>(promise: &Promise<T>, err: ChannelError) {
    if !promise.fail(err.clone()) {
        warn!(error = %err, "promise already complete, dropping failure");
    }
}
