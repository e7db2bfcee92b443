//! Callback-to-suspension adapter.
//!
//! Turns a foreign API that reports its result through a callback into a
//! single suspension point inside a task body:
//!
//! ```ignore
//! let sum = callback(|handle: CallbackHandle<i32>| {
//!     foreign_api.add_async(2, 3, move |r| handle.resume(r));
//! })
//! .await?;
//! ```
//!
//! The start function runs immediately, on the constructing thread. The
//! handle may be resumed from any thread, before or after the task suspends.
//! Resumption drives the task forward on the resuming thread; the next
//! hand-off of the chain goes through its scheduler as usual.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{Failure, TaskError};
use crate::sync::lock;

// =============================================================================
// Slot - outcome hand-off between handle and awaitable
// =============================================================================

enum SlotState<T> {
    /// No outcome yet. Holds the suspended task's waker once it has polled.
    Waiting(Option<Waker>),
    Ready(Result<T, Failure>),
    Taken,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            state: Mutex::new(SlotState::Waiting(None)),
        }
    }

    fn fill(&self, outcome: Result<T, Failure>) {
        let waker = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, SlotState::Ready(outcome)) {
                SlotState::Waiting(waker) => waker,
                other => {
                    *state = other;
                    return;
                }
            }
        };
        // Wake outside the lock: the task polls this slot again right away.
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

// =============================================================================
// CallbackHandle
// =============================================================================

/// The resumer handed to a foreign callback API.
///
/// Exactly one of [`resume`](Self::resume) or [`error`](Self::error) is
/// called, exactly once; both take `self`. Dropping the handle unresumed fails
/// the awaiting task with [`TaskError::Abandoned`].
pub struct CallbackHandle<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> CallbackHandle<T> {
    /// Resume the suspended task with a value.
    pub fn resume(mut self, value: T) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Ok(value));
        }
    }

    /// Resume the suspended task with a failure.
    pub fn error(mut self, failure: impl Into<Failure>) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(failure.into()));
        }
    }

    /// Resume with whichever outcome the foreign side produced.
    pub fn complete(self, outcome: Result<T, Failure>) {
        match outcome {
            Ok(value) => self.resume(value),
            Err(failure) => self.error(failure),
        }
    }
}

impl<T> Drop for CallbackHandle<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            log::warn!("callback handle dropped without being resumed");
            slot.fill(Err(Failure::new(TaskError::Abandoned)));
        }
    }
}

impl<T> fmt::Debug for CallbackHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("pending", &self.slot.is_some())
            .finish()
    }
}

// =============================================================================
// CallbackAwaitable
// =============================================================================

/// A suspension point fed by a [`CallbackHandle`].
#[must_use = "the outcome is only observed by awaiting"]
pub struct CallbackAwaitable<T> {
    slot: Arc<Slot<T>>,
}

impl<T> CallbackAwaitable<T> {
    /// Invoke `start` with a fresh handle, right away.
    pub fn new<F>(start: F) -> Self
    where
        F: FnOnce(CallbackHandle<T>),
    {
        let slot = Arc::new(Slot::new());
        start(CallbackHandle {
            slot: Some(slot.clone()),
        });
        CallbackAwaitable { slot }
    }

    /// True once the handle has been resumed (or dropped).
    pub fn is_resumed(&self) -> bool {
        !matches!(*lock(&self.slot.state), SlotState::Waiting(_))
    }
}

/// Shorthand for [`CallbackAwaitable::new`].
pub fn callback<T, F>(start: F) -> CallbackAwaitable<T>
where
    F: FnOnce(CallbackHandle<T>),
{
    CallbackAwaitable::new(start)
}

impl<T> Future for CallbackAwaitable<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.slot.state);
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(outcome) => Poll::Ready(outcome),
            SlotState::Waiting(waker) => {
                let waker = match waker {
                    Some(w) if w.will_wake(cx.waker()) => w,
                    _ => cx.waker().clone(),
                };
                *state = SlotState::Waiting(Some(waker));
                Poll::Pending
            }
            SlotState::Taken => Poll::Ready(Err(Failure::new(TaskError::OutcomeTaken))),
        }
    }
}

impl<T> fmt::Debug for CallbackAwaitable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackAwaitable")
            .field("resumed", &self.is_resumed())
            .finish()
    }
}
