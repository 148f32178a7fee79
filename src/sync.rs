// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blocking primitives shared by the connection engine.
//!
//! [`Completion`] is a re-armable single-shot signal: the connect path arms it
//! per attempt, the dispatcher completes it when the reply lands, and the
//! crash path completes it to unblock every pending waiter. [`CancelToken`]
//! carries external cancellation into every suspension point; waits poll it
//! at a bounded slice so a cancel is observed within tens of milliseconds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Upper bound on how long a wait sleeps before rechecking its cancel token.
pub(crate) const CANCEL_SLICE: Duration = Duration::from_millis(20);

/// Cooperative cancellation handle checked at every blocking suspension point.
///
/// Cancelling is sticky until [`CancelToken::reset`]; a waiter that observes
/// it unwinds with [`crate::Error::Interrupted`], which is safe to retry once
/// the token is reset.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every wait holding a clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clears the cancelled state so the operation can be retried.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// How a [`Completion::wait`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The completion was signalled.
    Completed,
    /// The deadline expired before the signal.
    TimedOut,
    /// The cancel token fired before the signal.
    Interrupted,
}

/// Re-armable single-shot completion signal.
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    /// Creates a completion in the not-signalled state.
    pub fn new() -> Self {
        Self { done: Mutex::new(false), cv: Condvar::new() }
    }

    /// Re-arms the completion for a fresh attempt.
    pub fn reset(&self) {
        *self.done.lock() = false;
    }

    /// Signals the completion, waking every current and future waiter.
    ///
    /// Completing an already-complete signal is a no-op, so concurrent
    /// response and crash paths release waiters exactly once.
    pub fn complete(&self) {
        let mut done = self.done.lock();
        if !*done {
            *done = true;
            self.cv.notify_all();
        }
    }

    /// Returns `true` once the completion has been signalled.
    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    /// Waits for the signal, a deadline, or cancellation, whichever first.
    pub fn wait(&self, timeout: Option<Duration>, cancel: &CancelToken) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = self.done.lock();
        loop {
            if *done {
                return WaitOutcome::Completed;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Interrupted;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    (deadline - now).min(CANCEL_SLICE)
                }
                None => CANCEL_SLICE,
            };
            self.cv.wait_for(&mut done, slice);
        }
    }
}
