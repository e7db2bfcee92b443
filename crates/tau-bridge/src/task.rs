//! Suspend/resume tasks that cross the boundary.
//!
//! A [`Task`] wraps a future producing `Result<T, Failure>`. It is created
//! suspended, runs synchronously from [`Task::start`] until it completes or
//! reaches a suspension point, and from then on is resumed only through the
//! chain's [`Scheduler`].
//!
//! # Lifecycle
//!
//! ```text
//!   Created ──start──► Running ⇄ Suspended ──► Completed | Failed
//! ```
//!
//! # Chains
//!
//! Awaiting a task inside another task's body (`sub.await`) links them: the
//! sub-task inherits the chain's scheduler, the parent's waker becomes the
//! sub-task's continuation, and the sub-task is started inline. When any
//! task finishes it hands one [`ContinuationRunner`] to the scheduler. The
//! runner fires the task's `on_success`/`on_error` observer, if one is
//! attached, and then resumes the awaiting parent, if there is one.
//!
//! # Re-entrancy
//!
//! A task's lock is never held while its body is polled, while observers run,
//! or while the scheduler is called. A wake that arrives while the body is
//! being polled (a synchronous scheduler resuming the parent from inside the
//! child's completion) marks the task notified, and the poller polls again
//! instead of re-entering.

use std::cell::RefCell;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{Failure, TaskError};
use crate::schedule::{ContinuationRunner, Scheduler};
use crate::sync::lock;

/// The body of a task.
pub type TaskBody<T> = Pin<Box<dyn Future<Output = Result<T, Failure>> + Send + 'static>>;

type SuccessFn<T> = Box<dyn FnOnce(T) + Send>;
type ErrorFn = Box<dyn FnOnce(Failure) + Send>;
/// An observer plus the clone that feeds it, so the outcome itself stays put.
type SuccessObserver<T> = (SuccessFn<T>, fn(&T) -> T);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Identity and observable state
// =============================================================================

/// Process-unique task id, for logging and scheduler bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not started yet.
    Created,
    /// The body is being polled.
    Running,
    /// Waiting at a suspension point.
    Suspended,
    Completed,
    Failed,
}

// =============================================================================
// Chain context (thread-local)
// =============================================================================

#[derive(Clone)]
struct Current {
    task: TaskId,
    scheduler: Option<Scheduler>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Installs the polled task as current; restores the previous one on drop.
struct ChainGuard {
    prev: Option<Current>,
}

impl ChainGuard {
    fn enter(current: Current) -> Self {
        let prev = CURRENT.with(|c| c.replace(Some(current)));
        ChainGuard { prev }
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// The scheduler of the task being polled on this thread.
pub fn current_scheduler() -> Option<Scheduler> {
    CURRENT.with(|c| c.borrow().as_ref().and_then(|cur| cur.scheduler.clone()))
}

/// The task being polled on this thread.
pub fn current_task() -> Option<TaskId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|cur| cur.task))
}

// =============================================================================
// Continuation
// =============================================================================

/// The resumption of a suspended task. Owned by the task it waits on and
/// consumed by [`resume`](Self::resume), so it runs at most once.
pub(crate) struct Continuation {
    waker: Waker,
    task: Option<TaskId>,
}

impl Continuation {
    fn new(waker: Waker, task: Option<TaskId>) -> Self {
        Self { waker, task }
    }

    /// The task this continuation resumes, if it is one of ours.
    fn task(&self) -> Option<TaskId> {
        self.task
    }

    fn resume(self) {
        self.waker.wake()
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").field("task", &self.task).finish()
    }
}

// =============================================================================
// Task core
// =============================================================================

enum Stage<T> {
    Created(TaskBody<T>),
    /// Started and parked at a suspension point.
    Suspended(TaskBody<T>),
    /// The body is out of the core, being polled.
    Polling,
    /// `None` once the outcome has been handed on.
    Done(Option<Result<T, Failure>>),
}

struct Inner<T> {
    stage: Stage<T>,
    /// Woken while being polled; poll again before parking.
    notified: bool,
    failed: bool,
    scheduler: Option<Scheduler>,
    continuation: Option<Continuation>,
    /// The completion runner has run: observers may fire and the outcome
    /// may be handed on.
    delivered: bool,
    on_success: Option<SuccessObserver<T>>,
    on_error: Option<ErrorFn>,
    /// Where a blocked `join` waits for the outcome.
    joiner: Option<mpsc::Sender<Result<T, Failure>>>,
}

struct TaskCore<T> {
    id: TaskId,
    inner: Mutex<Inner<T>>,
}

enum Notification<T> {
    Success(SuccessFn<T>, T),
    Error(ErrorFn, Failure),
}

impl<T> Notification<T> {
    fn fire(self) {
        match self {
            Notification::Success(cb, value) => cb(value),
            Notification::Error(cb, failure) => cb(failure),
        }
    }
}

impl<T: Send + 'static> TaskCore<T> {
    fn new(stage: Stage<T>) -> Arc<Self> {
        Arc::new(TaskCore {
            id: TaskId::next(),
            inner: Mutex::new(Inner {
                stage,
                notified: false,
                failed: false,
                scheduler: None,
                continuation: None,
                delivered: false,
                on_success: None,
                on_error: None,
                joiner: None,
            }),
        })
    }

    fn state(&self) -> TaskState {
        let inner = lock(&self.inner);
        match inner.stage {
            Stage::Created(_) => TaskState::Created,
            Stage::Suspended(_) => TaskState::Suspended,
            Stage::Polling => TaskState::Running,
            Stage::Done(_) if inner.failed => TaskState::Failed,
            Stage::Done(_) => TaskState::Completed,
        }
    }

    /// `Created → Running`, then poll until the first suspension or completion.
    ///
    /// `scheduler` is installed only on that transition; a task that has
    /// already started keeps the scheduler of its chain.
    fn begin(self: &Arc<Self>, scheduler: Option<Scheduler>) {
        {
            let mut inner = lock(&self.inner);
            match std::mem::replace(&mut inner.stage, Stage::Polling) {
                Stage::Created(body) => {
                    inner.stage = Stage::Suspended(body);
                    if scheduler.is_some() {
                        inner.scheduler = scheduler;
                    }
                }
                other => {
                    inner.stage = other;
                    log::warn!("task {:?} started more than once; ignored", self.id);
                    return;
                }
            }
        }
        self.drive();
    }

    /// Poll the body. Called on start and on every wake.
    fn drive(self: &Arc<Self>) {
        loop {
            let (mut body, scheduler) = {
                let mut inner = lock(&self.inner);
                match std::mem::replace(&mut inner.stage, Stage::Polling) {
                    Stage::Suspended(body) => (body, inner.scheduler.clone()),
                    Stage::Polling => {
                        inner.notified = true;
                        return;
                    }
                    other => {
                        // Not started, or already finished: a stale wake
                        inner.stage = other;
                        return;
                    }
                }
            };

            log::trace!("task {:?}: polling", self.id);
            let waker = Waker::from(self.clone());
            let mut cx = Context::from_waker(&waker);
            let polled = {
                let _chain = ChainGuard::enter(Current {
                    task: self.id,
                    scheduler,
                });
                panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)))
            };

            let outcome = match polled {
                Ok(Poll::Pending) => {
                    let mut inner = lock(&self.inner);
                    inner.stage = Stage::Suspended(body);
                    if std::mem::take(&mut inner.notified) {
                        continue;
                    }
                    log::trace!("task {:?}: suspended", self.id);
                    return;
                }
                Ok(Poll::Ready(outcome)) => outcome,
                Err(payload) => Err(Failure::from_panic(payload)),
            };

            drop(body);
            self.complete(outcome);
            return;
        }
    }

    /// Store the outcome and hand one runner to the scheduler.
    fn complete(self: &Arc<Self>, outcome: Result<T, Failure>) {
        let (scheduler, resumes) = {
            let mut inner = lock(&self.inner);
            inner.failed = outcome.is_err();
            inner.stage = Stage::Done(Some(outcome));
            let resumes = inner.continuation.as_ref().and_then(|c| c.task());
            (inner.scheduler.clone(), resumes)
        };

        log::trace!("task {:?}: completed, next {:?}", self.id, resumes);
        let core = self.clone();
        let runner = ContinuationRunner::new(self.id, resumes, move || core.finish());

        match scheduler {
            Some(scheduler) => scheduler.schedule(runner),
            None => {
                log::warn!("task {:?} completed with no scheduler installed; resuming inline", self.id);
                runner.run();
            }
        }
    }

    /// The completion runner: fire the observer, then hand the outcome to
    /// whoever waits for it. A parent that starts awaiting after this has run
    /// takes the outcome directly.
    fn finish(&self) {
        let (notification, continuation, joined) = {
            let mut inner = lock(&self.inner);
            inner.delivered = true;
            let notification = self.take_notification(&mut inner);
            let continuation = inner.continuation.take();
            let joined = if continuation.is_none() {
                inner.joiner.take().map(|tx| (tx, Self::take_outcome(&mut inner)))
            } else {
                None
            };
            (notification, continuation, joined)
        };

        if let Some(n) = notification {
            n.fire();
        }
        if let Some(continuation) = continuation {
            continuation.resume();
        } else if let Some((tx, outcome)) = joined {
            let _ = tx.send(outcome);
        }
    }

    /// The observer call that is due now, if any. The outcome stays in place
    /// for an awaiting parent.
    fn take_notification(&self, inner: &mut Inner<T>) -> Option<Notification<T>> {
        if !inner.delivered {
            return None;
        }
        match &inner.stage {
            Stage::Done(Some(Ok(value))) => inner
                .on_success
                .take()
                .map(|(cb, duplicate)| Notification::Success(cb, duplicate(value))),
            Stage::Done(Some(Err(failure))) => inner
                .on_error
                .take()
                .map(|cb| Notification::Error(cb, failure.clone())),
            Stage::Done(None) => {
                log::warn!("task {:?}: outcome already handed on; observer will not fire", self.id);
                None
            }
            _ => None,
        }
    }

    fn take_outcome(inner: &mut Inner<T>) -> Result<T, Failure> {
        match std::mem::replace(&mut inner.stage, Stage::Done(None)) {
            Stage::Done(Some(outcome)) => outcome,
            other => {
                inner.stage = other;
                Err(Failure::new(TaskError::OutcomeTaken))
            }
        }
    }
}

impl<T: Send + 'static> Wake for TaskCore<T> {
    fn wake(self: Arc<Self>) {
        self.drive();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.drive();
    }
}

// =============================================================================
// Task
// =============================================================================

/// A deferred computation producing `T` or a [`Failure`].
pub struct Task<T> {
    core: Arc<TaskCore<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Create a suspended task. Nothing runs until [`start`](Self::start) or
    /// until it is awaited by a running task.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Task {
            core: TaskCore::new(Stage::Created(Box::pin(body))),
        }
    }

    /// A task that completes with `value` once started.
    pub fn ready(value: T) -> Self {
        Task::new(async move { Ok(value) })
    }

    /// A task that fails with `failure` once started.
    pub fn failed(failure: impl Into<Failure>) -> Self {
        let failure = failure.into();
        Task::new(async move { Err(failure) })
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Start the task as the outermost of a chain, installing `scheduler`
    /// for it and every task it awaits.
    ///
    /// Returns once the task has completed synchronously or reached its
    /// first suspension point. Starting a task that has already started
    /// logs a warning and leaves its scheduler alone.
    pub fn start(&self, scheduler: impl Into<Scheduler>) {
        log::trace!("task {:?}: started", self.core.id);
        self.core.begin(Some(scheduler.into()));
    }

    /// Observe a successful outcome.
    ///
    /// At most one success observer is kept: attaching a second before the
    /// first fires replaces it and logs a warning. The observer fires once,
    /// when the completion runner runs, or right away if it already has. It
    /// receives a clone of the value, so a parent awaiting this task still
    /// gets the original.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
        T: Clone,
    {
        let callback: SuccessFn<T> = Box::new(callback);
        let duplicate: fn(&T) -> T = T::clone;
        let notification = {
            let mut inner = lock(&self.core.inner);
            if inner.on_success.is_some() {
                log::warn!("task {:?}: on_success observer replaced", self.core.id);
            }
            inner.on_success = Some((callback, duplicate));
            self.core.take_notification(&mut inner)
        };
        if let Some(n) = notification {
            n.fire();
        }
        self
    }

    /// Observe a failure.
    ///
    /// At most one error observer is kept: attaching a second before the
    /// first fires replaces it and logs a warning. Fires like
    /// [`on_success`](Self::on_success), with a clone of the failure that
    /// shares its payload.
    pub fn on_error<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Failure) + Send + 'static,
    {
        let notification = {
            let mut inner = lock(&self.core.inner);
            if inner.on_error.is_some() {
                log::warn!("task {:?}: on_error observer replaced", self.core.id);
            }
            inner.on_error = Some(Box::new(callback));
            self.core.take_notification(&mut inner)
        };
        if let Some(n) = notification {
            n.fire();
        }
        self
    }

    /// Start the task and block the calling thread until it finishes.
    ///
    /// The scheduler must make progress without this thread: a
    /// [`DeferredQueue`](crate::schedule::DeferredQueue) pumped by the joining
    /// thread would never run. If the scheduler drops the completion runner
    /// the result is [`TaskError::Dropped`].
    pub fn join(self, scheduler: impl Into<Scheduler>) -> Result<T, Failure> {
        let rx = {
            let mut inner = lock(&self.core.inner);
            if inner.delivered {
                return TaskCore::take_outcome(&mut inner);
            }
            let (tx, rx) = mpsc::channel();
            inner.joiner = Some(tx);
            rx
        };
        self.start(scheduler);
        drop(self);
        rx.recv()
            .unwrap_or_else(|_| Err(Failure::new(TaskError::Dropped)))
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.core.id).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> IntoFuture for Task<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = Awaiting<T>;

    fn into_future(self) -> Awaiting<T> {
        Awaiting {
            core: self.core,
            registered: false,
        }
    }
}

// =============================================================================
// Awaiting - `sub.await` inside a task body
// =============================================================================

/// Future returned by awaiting a [`Task`].
pub struct Awaiting<T> {
    core: Arc<TaskCore<T>>,
    registered: bool,
}

impl<T: Send + 'static> Future for Awaiting<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.registered {
            this.registered = true;
            let launch = {
                let mut inner = lock(&this.core.inner);
                if inner.delivered {
                    // Finished and handed off before anyone awaited it: no suspension
                    return Poll::Ready(TaskCore::take_outcome(&mut inner));
                }
                // A finished task whose runner is still queued resumes us from it
                inner.continuation = Some(Continuation::new(cx.waker().clone(), current_task()));
                if inner.scheduler.is_none() {
                    inner.scheduler = current_scheduler();
                    if inner.scheduler.is_none() {
                        log::warn!("task {:?} awaited outside a running chain", this.core.id);
                    }
                }
                matches!(inner.stage, Stage::Created(_))
            };
            if launch {
                this.core.begin(None);
            }
        }

        let mut inner = lock(&this.core.inner);
        if inner.delivered {
            return Poll::Ready(TaskCore::take_outcome(&mut inner));
        }
        if let Some(continuation) = inner.continuation.as_mut() {
            if !continuation.waker.will_wake(cx.waker()) {
                continuation.waker = cx.waker().clone();
            }
        }
        Poll::Pending
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{callback, CallbackHandle};
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Scheduler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let scheduler = Scheduler::new(move |runner| {
            c.fetch_add(1, Ordering::SeqCst);
            runner.run();
        });
        (scheduler, count)
    }

    fn capture<T: Send + 'static>() -> (Arc<Mutex<Option<T>>>, impl FnOnce(T) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        (slot, move |v| *s.lock().unwrap() = Some(v))
    }

    #[test]
    fn returning_value_schedules_once() {
        let (scheduler, count) = counting();
        let (result, store) = capture::<i32>();

        Task::new(async { Ok(5) }).on_success(store).start(scheduler);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*result.lock().unwrap(), Some(5));
    }

    #[test]
    fn returning_unit() {
        let (scheduler, count) = counting();
        let (called, store) = capture::<()>();

        Task::new(async { Ok(()) }).on_success(store).start(scheduler);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(called.lock().unwrap().is_some());
    }

    #[test]
    fn awaiting_others_schedules_per_task() {
        fn int() -> Task<i32> {
            Task::new(async { Ok(5) })
        }
        fn unit() -> Task<()> {
            Task::new(async { Ok(()) })
        }
        fn calling_others() -> Task<i32> {
            Task::new(async {
                unit().await?;
                int().await
            })
        }

        let (scheduler, count) = counting();
        let (result, store) = capture::<i32>();
        calling_others().on_success(store).start(scheduler);

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(*result.lock().unwrap(), Some(5));
    }

    #[test]
    fn failure_reaches_error_observer() {
        let (scheduler, count) = counting();
        let (error, store) = capture::<Failure>();

        Task::<()>::failed(Failure::msg("this is an expected exception"))
            .on_error(store)
            .start(scheduler);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let error = error.lock().unwrap().take().unwrap();
        assert_eq!(error.to_string(), "this is an expected exception");
    }

    #[test]
    fn failure_three_deep_is_the_same_failure() {
        let original = Failure::msg("from C");
        let raised = original.clone();

        let c = Task::<i32>::new(async move { Err(raised) });
        let b = Task::new(async move { c.await.map(|v| v + 1) });
        let a = Task::new(async move { b.await.map(|v| v + 1) });

        let (scheduler, count) = counting();
        let (error, store) = capture::<Failure>();
        let (success, store_ok) = capture::<i32>();
        a.on_error(store).on_success(store_ok).start(scheduler);

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(error.lock().unwrap().as_ref().unwrap().ptr_eq(&original));
        assert!(success.lock().unwrap().is_none());
        assert_eq!(a.state(), TaskState::Failed);
    }

    #[test]
    fn panic_becomes_failure() {
        fn explode() -> Result<(), Failure> {
            panic!("kaboom")
        }

        let (error, store) = capture::<Failure>();
        Task::new(async { explode() })
            .on_error(store)
            .start(Scheduler::synchronous());

        let error = error.lock().unwrap().take().unwrap();
        assert_eq!(error.downcast_ref::<TaskError>(), Some(&TaskError::Panicked("kaboom".into())));
    }

    #[test]
    fn sub_task_inherits_scheduler() {
        let (scheduler, _) = counting();
        let expected = scheduler.clone();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();

        let child = Task::new(async move {
            *s.lock().unwrap() = current_scheduler();
            Ok(())
        });
        Task::new(async move { child.await }).start(scheduler);

        let seen = seen.lock().unwrap().take().unwrap();
        assert!(seen.ptr_eq(&expected));
    }

    #[test]
    fn observer_attached_after_completion_fires() {
        let task = Task::ready(7);
        task.start(Scheduler::synchronous());
        assert_eq!(task.state(), TaskState::Completed);

        let (result, store) = capture::<i32>();
        task.on_success(store);
        assert_eq!(*result.lock().unwrap(), Some(7));
    }

    #[test]
    fn observer_waits_for_deferred_delivery() {
        let queue = crate::schedule::DeferredQueue::new();
        let task = Task::ready(1);
        task.start(queue.scheduler());
        assert_eq!(task.state(), TaskState::Completed);

        let (result, store) = capture::<i32>();
        task.on_success(store);
        assert!(result.lock().unwrap().is_none(), "runner not pumped yet");

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*result.lock().unwrap(), Some(1));
    }

    #[test]
    fn states_follow_the_lifecycle() {
        let queue = crate::schedule::DeferredQueue::new();
        let child = Task::ready(());
        let task = Task::new(async move { child.await });
        assert_eq!(task.state(), TaskState::Created);

        task.start(queue.scheduler());
        assert_eq!(task.state(), TaskState::Suspended);

        queue.run_pending();
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn join_blocks_until_done() {
        let task = Task::new(async { Ok::<_, Failure>("done") });
        assert_eq!(task.join(Scheduler::thread()).unwrap(), "done");

        let task = Task::<()>::failed(Failure::msg("nope"));
        assert_eq!(task.join(Scheduler::synchronous()).unwrap_err().to_string(), "nope");
    }

    #[test]
    fn awaiting_a_finished_task_does_not_suspend() {
        let done = Task::ready(3);
        done.start(Scheduler::synchronous());

        let (scheduler, count) = counting();
        let (result, store) = capture::<i32>();
        Task::new(async move { done.await }).on_success(store).start(scheduler);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*result.lock().unwrap(), Some(3));
    }

    #[test]
    fn chain_context_is_restored() {
        assert!(current_task().is_none());
        let inner_id = Arc::new(Mutex::new(None));
        let i = inner_id.clone();
        let task = Task::new(async move {
            *i.lock().unwrap() = current_task();
            Ok(())
        });
        let id = task.id();
        task.start(Scheduler::synchronous());
        assert_eq!(*inner_id.lock().unwrap(), Some(id));
        assert!(current_task().is_none());
        assert!(current_scheduler().is_none());
    }

    // ── observers on awaited tasks ──

    #[test]
    fn awaited_task_still_notifies_its_observer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let (seen, store_seen) = capture::<i32>();

        let b = Task::ready(5);
        b.on_success(move |v: i32| {
            f.fetch_add(1, Ordering::SeqCst);
            store_seen(v);
        });
        let (result, store) = capture::<i32>();
        Task::new(async move { b.await }).on_success(store).start(Scheduler::synchronous());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(5));
        assert_eq!(*result.lock().unwrap(), Some(5));
    }

    #[test]
    fn awaited_failure_notifies_once_and_propagates() {
        let original = Failure::msg("from b");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let (seen, store_seen) = capture::<Failure>();

        let b = Task::<i32>::failed(original.clone());
        b.on_error(move |failure| {
            f.fetch_add(1, Ordering::SeqCst);
            store_seen(failure);
        });
        let (error, store) = capture::<Failure>();
        Task::new(async move { b.await }).on_error(store).start(Scheduler::synchronous());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().as_ref().unwrap().ptr_eq(&original));
        assert!(error.lock().unwrap().as_ref().unwrap().ptr_eq(&original));
    }

    #[test]
    fn awaiting_before_deferred_delivery_notifies_and_resumes() {
        let queue = crate::schedule::DeferredQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        let b = Task::ready(5);
        b.on_success(move |_: i32| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        b.start(queue.scheduler());
        assert_eq!(b.state(), TaskState::Completed);

        let (result, store) = capture::<Result<i32, Failure>>();
        let a = Task::new(async move {
            store(b.await);
            Ok(())
        });
        a.start(queue.scheduler());
        assert_eq!(a.state(), TaskState::Suspended);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // b's runner notifies and resumes a; a's own runner follows
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(result.lock().unwrap().take().unwrap().unwrap(), 5);
        assert_eq!(a.state(), TaskState::Completed);
    }

    #[test]
    fn error_observer_attached_after_completion_fires() {
        let task = Task::<i32>::failed(Failure::msg("late"));
        task.start(Scheduler::synchronous());
        assert_eq!(task.state(), TaskState::Failed);

        let (error, store) = capture::<Failure>();
        task.on_error(store);
        assert_eq!(error.lock().unwrap().as_ref().unwrap().to_string(), "late");
    }

    // ── start and join ──

    #[test]
    fn second_start_keeps_the_first_scheduler() {
        let stash: Arc<Mutex<Option<CallbackHandle<i32>>>> = Arc::new(Mutex::new(None));
        let s = stash.clone();
        let task = Task::new(async move {
            callback(move |handle| *s.lock().unwrap() = Some(handle)).await
        });

        let (first, first_count) = counting();
        let (second, second_count) = counting();
        task.start(first);
        assert_eq!(task.state(), TaskState::Suspended);
        task.start(second);

        let handle = stash.lock().unwrap().take().unwrap();
        handle.resume(1);

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn join_reports_a_dropped_runner() {
        let discard = Scheduler::new(|runner: ContinuationRunner| drop(runner));
        let failure = Task::ready(1).join(discard).unwrap_err();
        assert_eq!(failure.downcast_ref::<TaskError>(), Some(&TaskError::Dropped));
    }
}
