//! Synchronization primitives abstraction for loom testing.
//!
//! When compiled with `--cfg loom`, the queue uses loom's types which allow
//! deterministic concurrency testing. Otherwise, it uses crossbeam/std types.

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering from poisoning.
///
/// Every critical section in this crate either completes its update or
/// leaves the protected state untouched, so a poisoned lock still guards
/// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// RemoteQueue - lock-free queue for cross-thread continuation hand-off
// =============================================================================
//
// Under loom, we use a Mutex<VecDeque> since loom doesn't provide SegQueue.

#[cfg(not(loom))]
mod queue {
    use crossbeam_queue::SegQueue;

    pub struct RemoteQueue<T>(SegQueue<T>);

    impl<T> RemoteQueue<T> {
        pub const fn new() -> Self {
            Self(SegQueue::new())
        }

        pub fn push(&self, value: T) {
            self.0.push(value);
        }

        pub fn pop(&self) -> Option<T> {
            self.0.pop()
        }

        pub fn len(&self) -> usize {
            self.0.len()
        }
    }
}

#[cfg(loom)]
mod queue {
    use loom::sync::Mutex;
    use std::collections::VecDeque;

    pub struct RemoteQueue<T>(Mutex<VecDeque<T>>);

    impl<T> RemoteQueue<T> {
        pub fn new() -> Self {
            Self(Mutex::new(VecDeque::new()))
        }

        pub fn push(&self, value: T) {
            self.0.lock().unwrap_or_else(|p| p.into_inner()).push_back(value);
        }

        pub fn pop(&self) -> Option<T> {
            self.0.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
        }

        pub fn len(&self) -> usize {
            self.0.lock().unwrap_or_else(|p| p.into_inner()).len()
        }
    }
}

pub(crate) use queue::RemoteQueue;
