//! Work items and their completion sinks.
//!
//! A [`WorkItem`] is one deferred unit of executable work plus the sink its
//! completion or fault is delivered to. The variants form a closed set:
//! plain actions (including actions with captured state and fire-and-forget
//! posts), result-producing jobs observed through a [`JobHandle`], and
//! synchronous sends whose producer blocks on a waiter. Exactly one of
//! `run` / `cancel` executes per item; sinks are always satisfied, including
//! when an item is dropped while still pending.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::context::ExecutionContext;
use crate::error::{JoinError, PanicPayload};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELLED: u8 = 3;

/// A deferred unit of work queued on the pool.
pub(crate) struct WorkItem {
    body: Option<Box<dyn FnOnce() + Send + 'static>>,
    completion: Completion,
    prefer_fairness: bool,
    allow_context_flow: bool,
    captured_context: Option<ExecutionContext>,
    enqueued_at: Option<Instant>,
    phase: AtomicU8,
}

/// Completion sink attached to a work item variant.
pub(crate) enum Completion {
    /// Plain action, action-with-state, or fire-and-forget post.
    Detached,
    /// Result-producing job; the sink backs a `JobHandle`.
    Job(Arc<dyn CompletionSink>),
    /// Synchronization send; the sink unblocks the waiting producer.
    Sync(Arc<dyn CompletionSink>),
}

/// Cancellation notification for an item that will never run.
pub(crate) trait CompletionSink: Send + Sync {
    fn cancelled(&self);
}

/// Observes the result of a work item submitted with
/// [`ThreadPool::submit`](crate::ThreadPool::submit).
pub struct JobHandle<T> {
    shared: Arc<JobShared<T>>,
}

struct JobShared<T> {
    slot: Mutex<Option<Result<T, JoinError>>>,
    signal: Condvar,
}

/// Blocks the producer of a synchronous send until the item finishes.
pub(crate) struct SendWaiter {
    shared: Arc<SendShared>,
}

struct SendShared {
    slot: Mutex<Option<SendOutcome>>,
    signal: Condvar,
}

/// Terminal outcome observed by a synchronous send.
pub(crate) enum SendOutcome {
    Completed,
    Panicked(PanicPayload),
    Cancelled,
}

// ===== impl WorkItem =====

impl WorkItem {
    /// A plain action.
    pub fn action<F>(f: F, prefer_fairness: bool, allow_context_flow: bool) -> WorkItem
    where
        F: FnOnce() + Send + 'static,
    {
        WorkItem::with_completion(Box::new(f), Completion::Detached, prefer_fairness, allow_context_flow)
    }

    /// An action carrying a state value passed to the body at run time.
    pub fn action_with_state<S, F>(
        f: F,
        state: S,
        prefer_fairness: bool,
        allow_context_flow: bool,
    ) -> WorkItem
    where
        S: Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        WorkItem::action(move || f(state), prefer_fairness, allow_context_flow)
    }

    /// A fire-and-forget post on behalf of a foreign continuation system.
    ///
    /// Posts always prefer fairness so the caller's cross-item ordering
    /// expectations hold.
    pub fn post<F>(f: F) -> WorkItem
    where
        F: FnOnce() + Send + 'static,
    {
        WorkItem::action(f, true, true)
    }

    /// A result-producing job; faults are captured into the returned handle.
    pub fn job<T, F>(f: F, prefer_fairness: bool) -> (WorkItem, JobHandle<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let shared = Arc::new(JobShared {
            slot: Mutex::new(None),
            signal: Condvar::new(),
        });
        let sink = shared.clone();
        let body = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => sink.complete(Ok(value)),
            Err(payload) => sink.complete(Err(JoinError::Panicked(PanicPayload::new(payload)))),
        });

        let item = WorkItem::with_completion(body, Completion::Job(shared.clone()), prefer_fairness, true);
        (item, JobHandle { shared })
    }

    /// A synchronous send; the returned waiter blocks until the item
    /// completes, faults, or is cancelled.
    pub fn sync_send<F>(f: F) -> (WorkItem, SendWaiter)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(SendShared {
            slot: Mutex::new(None),
            signal: Condvar::new(),
        });
        let sink = shared.clone();
        let body = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => sink.complete(SendOutcome::Completed),
            Err(payload) => sink.complete(SendOutcome::Panicked(PanicPayload::new(payload))),
        });

        let item = WorkItem::with_completion(body, Completion::Sync(shared.clone()), true, true);
        (item, SendWaiter { shared })
    }

    fn with_completion(
        body: Box<dyn FnOnce() + Send + 'static>,
        completion: Completion,
        prefer_fairness: bool,
        allow_context_flow: bool,
    ) -> WorkItem {
        WorkItem {
            body: Some(body),
            completion,
            prefer_fairness,
            allow_context_flow,
            captured_context: None,
            enqueued_at: None,
            phase: AtomicU8::new(PENDING),
        }
    }

    pub fn prefer_fairness(&self) -> bool {
        self.prefer_fairness
    }

    pub fn allow_context_flow(&self) -> bool {
        self.allow_context_flow
    }

    /// Attach the captured ambient context snapshot.
    pub fn set_captured_context(&mut self, context: ExecutionContext) {
        self.captured_context = Some(context);
    }

    /// Stamp the item as entering a queue, for queue-wait metrics.
    pub fn mark_enqueued(&mut self) {
        self.enqueued_at = Some(Instant::now());
    }

    /// How long the item sat in queues, if it was stamped.
    pub fn queue_wait(&self) -> Option<Duration> {
        self.enqueued_at.map(|at| at.elapsed())
    }

    /// Execute the item on the current thread.
    ///
    /// Restores the captured context (if any) around the body, captures any
    /// panic into the item's completion sink, and marks the item `Completed`.
    /// A panicking body never propagates to the worker loop.
    pub fn run(mut self) {
        let transition = self.phase.compare_exchange(PENDING, RUNNING, SeqCst, SeqCst);
        assert!(
            transition.is_ok(),
            "work item executed after completion or cancellation"
        );

        let _guard = self.captured_context.take().map(ExecutionContext::install);
        let body = self.body.take().expect("work item body already consumed");
        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        self.phase.store(COMPLETED, SeqCst);

        if let Err(payload) = outcome {
            // Job and sync bodies capture their own panics into their sinks;
            // reaching here means a detached action faulted.
            tracing::error!(
                message = PanicPayload::new(payload).message(),
                "work item panicked"
            );
        }
    }

    /// Transition the item to `Cancelled` and notify its sink instead of
    /// running the body.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        if self
            .phase
            .compare_exchange(PENDING, CANCELLED, SeqCst, SeqCst)
            .is_ok()
        {
            match &self.completion {
                Completion::Detached => {}
                Completion::Job(sink) | Completion::Sync(sink) => sink.cancelled(),
            }
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        // An item dropped while still pending (rejected enqueue, abandoned
        // queue) must still satisfy its sink.
        self.cancel_in_place();
    }
}

// ===== impl JobHandle =====

impl<T> JobHandle<T> {
    /// Block until the job completes, is cancelled, or panics.
    pub fn wait(self) -> Result<T, JoinError> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.signal.wait(&mut slot);
        }
        slot.take().expect("job completed without an outcome")
    }

    /// Whether an outcome is already available.
    pub fn is_finished(&self) -> bool {
        self.shared.slot.lock().is_some()
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("JobHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Send> JobShared<T> {
    fn complete(&self, outcome: Result<T, JoinError>) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "job completion sink satisfied twice");
        *slot = Some(outcome);
        self.signal.notify_all();
    }
}

impl<T: Send + 'static> CompletionSink for JobShared<T> {
    fn cancelled(&self) {
        self.complete(Err(JoinError::Cancelled));
    }
}

// ===== impl SendWaiter =====

impl SendWaiter {
    /// Block until the sent item reaches a terminal state.
    pub fn wait(self) -> SendOutcome {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.signal.wait(&mut slot);
        }
        slot.take().expect("send completed without an outcome")
    }
}

impl SendShared {
    fn complete(&self, outcome: SendOutcome) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "send completion sink satisfied twice");
        *slot = Some(outcome);
        self.signal.notify_all();
    }
}

impl CompletionSink for SendShared {
    fn cancelled(&self) {
        self.complete(SendOutcome::Cancelled);
    }
}
