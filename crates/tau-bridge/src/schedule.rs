//! Schedulers - caller-supplied resumption policy.
//!
//! The runtime never decides where a continuation runs. Every time a task
//! finishes it packages "what happens next" into a [`ContinuationRunner`] and
//! hands it to the chain's [`Scheduler`]. The scheduler may run it inline,
//! push it to a thread, or queue it for a foreign runtime's loop.
//!
//! ```text
//!   task completes ──► ContinuationRunner ──► Scheduler ──► runner.run()
//!                      (completed, resumes)   (policy)      resume parent
//!                                                           or notify observers
//! ```

use std::fmt;
use std::sync::Arc;

use crate::sync::RemoteQueue;
use crate::task::TaskId;

// =============================================================================
// ContinuationRunner
// =============================================================================

/// A pending resumption, handed to the scheduler exactly once.
///
/// Running it fires the completed task's observer, if any, and then resumes
/// the task that awaited it, if any.
pub struct ContinuationRunner {
    completed: TaskId,
    resumes: Option<TaskId>,
    resume: Box<dyn FnOnce() + Send>,
}

impl ContinuationRunner {
    pub(crate) fn new(
        completed: TaskId,
        resumes: Option<TaskId>,
        resume: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            completed,
            resumes,
            resume: Box::new(resume),
        }
    }

    /// The task whose completion produced this runner.
    pub fn completed(&self) -> TaskId {
        self.completed
    }

    /// The awaiting task this runner resumes, `None` for the end of a chain.
    /// Fixed when the runner is built; a parent that starts awaiting later
    /// is still resumed.
    pub fn resumes(&self) -> Option<TaskId> {
        self.resumes
    }

    pub fn run(self) {
        log::trace!("running continuation {:?} -> {:?}", self.completed, self.resumes);
        (self.resume)()
    }
}

impl fmt::Debug for ContinuationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationRunner")
            .field("completed", &self.completed)
            .field("resumes", &self.resumes)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// The resumption policy of a task chain. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler(Arc<dyn Fn(ContinuationRunner) + Send + Sync>);

impl Scheduler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ContinuationRunner) + Send + Sync + 'static,
    {
        Scheduler(Arc::new(f))
    }

    /// Run every continuation inline on the completing thread.
    pub fn synchronous() -> Self {
        Scheduler::new(ContinuationRunner::run)
    }

    /// Run every continuation on a fresh detached thread.
    pub fn thread() -> Self {
        Scheduler::new(|runner| {
            std::thread::spawn(move || runner.run());
        })
    }

    pub fn schedule(&self, runner: ContinuationRunner) {
        log::trace!("scheduling {:?}", runner);
        (self.0)(runner)
    }

    /// True if both handles wrap the same policy.
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<F> From<F> for Scheduler
where
    F: Fn(ContinuationRunner) + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        Scheduler::new(f)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scheduler({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

// =============================================================================
// DeferredQueue
// =============================================================================

/// Queue of continuations drained by whoever owns the loop.
///
/// This is the shape of "post to the host runtime's dispatch queue": any
/// thread may push, the host pumps with [`run_pending`](Self::run_pending).
pub struct DeferredQueue {
    queue: Arc<RemoteQueue<ContinuationRunner>>,
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(RemoteQueue::new()),
        }
    }

    /// A scheduler that pushes onto this queue.
    pub fn scheduler(&self) -> Scheduler {
        let queue = self.queue.clone();
        Scheduler::new(move |runner| queue.push(runner))
    }

    /// Run one queued continuation. Returns false if the queue was empty.
    pub fn run_one(&self) -> bool {
        match self.queue.pop() {
            Some(runner) => {
                runner.run();
                true
            }
            None => false,
        }
    }

    /// Run until the queue is empty, including continuations queued by the
    /// ones being run. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueue").field("len", &self.len()).finish()
    }
}
