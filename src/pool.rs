use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::adapter::PoolContext;
use crate::cancel::CancelSource;
use crate::context::ExecutionContext;
use crate::error::{EnqueueError, RunError, SpawnError};
use crate::queue::{LocalSlot, QueueStore, TakeOptions};
use crate::state::{AtomicState, PoolState};
use crate::work::{JobHandle, WorkItem};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Pool id of the pool the current thread works for; 0 when not a worker.
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Execute deferred work on one of possibly several pooled threads.
///
/// The pool owns a global bounded queue, one local queue per worker thread
/// and an explicit lifecycle: it starts `Created`, becomes `Running` when the
/// first worker starts, and moves through `StopRequested` to `Stopped` during
/// shutdown. The state only ever moves forward.
///
/// Dropping the pool handle with the pool still live requests a non-blocking
/// stop that abandons queued items; call [`stop`](ThreadPool::stop) for
/// controlled shutdown.
pub struct ThreadPool {
    inner: Arc<Inner>,
}

/// Thread pool configuration.
///
/// Provide detailed control over the properties and behavior of the thread
/// pool.
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    thread_count: usize,
    queue_capacity: Option<usize>,
    steal_awake_period: Duration,
    flow_execution_context: bool,
    install_pool_context: bool,
}

/// Flags controlling the shutdown protocol.
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Block the caller until every worker thread has exited.
    pub wait_for_stop: bool,
    /// Drain already-queued items before stopping instead of abandoning them.
    pub let_finish_process: bool,
    /// Reject any further enqueues.
    pub complete_adding: bool,
}

pub(crate) struct Inner {
    name: String,
    pool_id: usize,
    target_threads: usize,
    flow_execution_context: bool,
    install_pool_context: bool,
    state: AtomicState,
    queues: QueueStore,
    registry: Mutex<Vec<Arc<WorkerEntry>>>,
    active_count: AtomicUsize,
    next_worker_id: AtomicUsize,
    cancel: CancelSource,
    stop_event: StopEvent,
    let_finish_process: AtomicBool,
    complete_adding: AtomicBool,
    stop_signalled: AtomicBool,
}

struct WorkerEntry {
    worker_id: usize,
    thread_id: thread::ThreadId,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// All data a newly spawned thread needs before it may run user work.
struct StartupData {
    inner: Arc<Inner>,
    token: Arc<StartToken>,
    worker_id: usize,
    create_local_queue: bool,
}

/// Start barrier released by `add_new_thread` once the thread is registered.
struct StartToken {
    state: AtomicU8,
}

const TOKEN_PENDING: u8 = 0;
const TOKEN_OK: u8 = 1;
const TOKEN_FAILED: u8 = 2;

/// One-shot wait handle signaled at the `Stopped` transition.
struct StopEvent {
    set: Mutex<bool>,
    signal: Condvar,
}

// ===== impl Builder =====

impl Builder {
    /// Returns a builder with default values.
    pub fn new() -> Builder {
        Builder {
            name: None,
            thread_count: num_cpus::get(),
            queue_capacity: None,
            steal_awake_period: Duration::from_millis(100),
            flow_execution_context: true,
            install_pool_context: false,
        }
    }

    /// Set the name of the pool, used as the prefix for worker thread names.
    pub fn name<S: Into<String>>(mut self, val: S) -> Self {
        self.name = Some(val.into());
        self
    }

    /// Set the number of worker threads the pool grows to.
    pub fn thread_count(mut self, val: usize) -> Self {
        self.thread_count = val;
        self
    }

    /// Bound the global work queue to `val` items.
    ///
    /// Unbounded by default; zero also means unbounded. The bound applies
    /// only to the global queue; local queues are never bounded.
    pub fn queue_capacity(mut self, val: usize) -> Self {
        self.queue_capacity = if val == 0 { None } else { Some(val) };
        self
    }

    /// Period between checks for the possibility to steal a work item from
    /// other workers' local queues while a worker is blocked on empty queues.
    pub fn steal_awake_period(mut self, val: Duration) -> Self {
        self.steal_awake_period = val;
        self
    }

    /// Whether the ambient [`ExecutionContext`] is captured at enqueue time
    /// and restored around work item execution. Enabled by default.
    pub fn flow_execution_context(mut self, val: bool) -> Self {
        self.flow_execution_context = val;
        self
    }

    /// Install a [`PoolContext`] as the current context on every worker
    /// thread, so work items can reach their own pool via
    /// [`PoolContext::current`]. Disabled by default.
    pub fn install_pool_context(mut self, val: bool) -> Self {
        self.install_pool_context = val;
        self
    }

    /// Build and return the configured thread pool.
    pub fn build(self) -> ThreadPool {
        assert!(self.thread_count >= 1, "at least one thread required");

        let pool_id = NEXT_POOL_ID.fetch_add(1, Relaxed) + 1;
        let name = self
            .name
            .unwrap_or_else(|| format!("threadmill-{}", pool_id));

        let inner = Arc::new(Inner {
            queues: QueueStore::new(pool_id, self.queue_capacity, self.steal_awake_period),
            name,
            pool_id,
            target_threads: self.thread_count,
            flow_execution_context: self.flow_execution_context,
            install_pool_context: self.install_pool_context,
            state: AtomicState::new(),
            registry: Mutex::new(Vec::new()),
            active_count: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            cancel: CancelSource::new(),
            stop_event: StopEvent::new(),
            let_finish_process: AtomicBool::new(false),
            complete_adding: AtomicBool::new(false),
            stop_signalled: AtomicBool::new(false),
        });

        tracing::debug!(pool = %inner.name, threads = inner.target_threads, "thread pool created");

        ThreadPool { inner }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

// ===== impl ThreadPool =====

impl ThreadPool {
    /// Create a pool that grows to a fixed number of threads operating off an
    /// unbounded global queue.
    pub fn fixed_size(size: usize) -> ThreadPool {
        Builder::new().thread_count(size).build()
    }

    /// Create a pool with a single worker thread operating off an unbounded
    /// global queue. Items enqueued with fairness preferred are guaranteed to
    /// execute sequentially in enqueue order.
    pub fn single_thread() -> ThreadPool {
        Builder::new().thread_count(1).build()
    }

    /// Enqueue an action, blocking while the bounded global queue is full.
    ///
    /// When `prefer_fairness` is true the item always goes to the global
    /// queue, preserving cross-producer ordering; otherwise an item enqueued
    /// from a pool worker lands in that worker's local queue.
    pub fn run<F>(&self, f: F, prefer_fairness: bool) -> Result<(), RunError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .enqueue(&self.inner, WorkItem::action(f, prefer_fairness, true), true)
    }

    /// Attempt to enqueue an action without blocking.
    ///
    /// Fails with [`EnqueueError::QueueFull`] when the bounded global queue
    /// is at capacity and the item could not be placed locally.
    pub fn try_run<F>(&self, f: F, prefer_fairness: bool) -> Result<(), RunError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .enqueue(&self.inner, WorkItem::action(f, prefer_fairness, true), false)
    }

    /// Enqueue an action carrying a state value, blocking if necessary.
    pub fn run_with_state<S, F>(&self, f: F, state: S, prefer_fairness: bool) -> Result<(), RunError>
    where
        S: Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        let item = WorkItem::action_with_state(f, state, prefer_fairness, true);
        self.inner.enqueue(&self.inner, item, true)
    }

    /// Attempt to enqueue an action carrying a state value without blocking.
    pub fn try_run_with_state<S, F>(
        &self,
        f: F,
        state: S,
        prefer_fairness: bool,
    ) -> Result<(), RunError>
    where
        S: Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        let item = WorkItem::action_with_state(f, state, prefer_fairness, true);
        self.inner.enqueue(&self.inner, item, false)
    }

    /// Enqueue a result-producing job and return a handle observing its
    /// completion, fault or cancellation.
    pub fn submit<T, F>(&self, f: F) -> Result<JobHandle<T>, RunError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (item, handle) = WorkItem::job(f, false);
        self.inner.enqueue(&self.inner, item, true)?;
        Ok(handle)
    }

    /// Start worker threads up to the configured count, causing them to idly
    /// wait for work. Returns the number of threads started.
    ///
    /// This overrides the default policy of starting threads only when new
    /// work is enqueued.
    pub fn prestart_threads(&self) -> Result<usize, SpawnError> {
        let mut started = 0;
        while self.inner.add_new_thread(&self.inner, true)? {
            started += 1;
        }
        Ok(started)
    }

    /// Stop the pool.
    ///
    /// Items already picked up by workers run to completion. Queued items are
    /// drained or abandoned according to
    /// [`let_finish_process`](StopOptions::let_finish_process); abandoned
    /// items are cancelled once the pool reaches `Stopped` if
    /// [`complete_adding`](StopOptions::complete_adding) is set. Stopping an
    /// already-stopped pool is idempotent.
    pub fn stop(&self, options: StopOptions) {
        self.inner.stop_pool(options);
    }

    /// Mark that no further work items will be accepted.
    pub fn complete_adding(&self) {
        self.inner.set_complete_adding();
        if self.inner.state.read() == PoolState::Stopped {
            self.inner.queues.drain_cancel();
        }
    }

    /// Block the current thread until the pool reaches `Stopped`.
    pub fn wait_until_stopped(&self) {
        self.inner.stop_event.wait();
        debug_assert_eq!(PoolState::Stopped, self.inner.state.read());
    }

    /// Block until the pool reaches `Stopped` or `timeout` elapses. Returns
    /// true when the pool stopped in time.
    pub fn wait_until_stopped_timeout(&self, timeout: Duration) -> bool {
        if self.inner.state.read() == PoolState::Stopped {
            return true;
        }
        self.inner.stop_event.wait_timeout(timeout)
    }

    /// Raise the bounded capacity of the global queue by `extra`.
    ///
    /// Capacity only ever grows. A no-op for unbounded pools.
    ///
    /// # Panics
    ///
    /// Panics when the pool is already `Stopped`.
    pub fn extend_queue_capacity(&self, extra: usize) {
        assert!(
            self.inner.state.read() != PoolState::Stopped,
            "cannot extend the queue of a stopped pool"
        );
        self.inner.queues.extend_capacity(extra);
    }

    /// An adapter exposing this pool to foreign continuation systems.
    pub fn context(&self) -> PoolContext {
        PoolContext::from_inner(self.inner.clone())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.inner.state.read()
    }

    /// Number of live worker threads.
    pub fn thread_count(&self) -> usize {
        self.inner.active_count.load(SeqCst)
    }

    /// Number of items currently in the global queue.
    pub fn queued(&self) -> usize {
        self.inner.queues.global_len()
    }

    /// Current bounded capacity of the global queue, `None` when unbounded.
    pub fn queue_capacity(&self) -> Option<usize> {
        self.inner.queues.capacity()
    }

    /// Whether the pool was marked as completed for adding.
    pub fn is_adding_completed(&self) -> bool {
        self.inner.complete_adding.load(SeqCst)
    }

    /// Whether the current thread is one of this pool's workers.
    pub fn is_pool_thread(&self) -> bool {
        self.inner.is_current_pool_thread()
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.inner.state.read() != PoolState::Stopped {
            self.inner.stop_pool(StopOptions {
                wait_for_stop: false,
                let_finish_process: false,
                complete_adding: true,
            });
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ThreadPool")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.read())
            .field("threads", &self.thread_count())
            .finish()
    }
}

// ===== impl StopOptions =====

impl StopOptions {
    /// Wait for stop, processing every already-queued item first.
    pub fn drain() -> StopOptions {
        StopOptions {
            wait_for_stop: true,
            let_finish_process: true,
            complete_adding: true,
        }
    }

    /// Wait for stop, cancelling queued items instead of running them.
    pub fn abandon() -> StopOptions {
        StopOptions {
            wait_for_stop: true,
            let_finish_process: false,
            complete_adding: true,
        }
    }
}

impl Default for StopOptions {
    fn default() -> StopOptions {
        StopOptions::drain()
    }
}

// ===== impl Inner =====

impl Inner {
    pub(crate) fn enqueue(
        &self,
        arc: &Arc<Inner>,
        mut item: WorkItem,
        blocking: bool,
    ) -> Result<(), RunError> {
        self.check_can_add()?;
        self.prepare_item(&mut item);

        if blocking {
            self.queues.add(item)?;
        } else {
            self.queues.try_add(item)?;
        }

        self.ensure_worker(arc)?;
        Ok(())
    }

    fn check_can_add(&self) -> Result<(), EnqueueError> {
        if self.state.read() == PoolState::Stopped {
            return Err(EnqueueError::Stopped);
        }
        if self.complete_adding.load(SeqCst) {
            return Err(EnqueueError::AddingCompleted);
        }
        Ok(())
    }

    /// Capture the ambient execution context and stamp the enqueue time.
    fn prepare_item(&self, item: &mut WorkItem) {
        if self.flow_execution_context && item.allow_context_flow() {
            if let Some(context) = ExecutionContext::capture() {
                item.set_captured_context(context);
            }
        }
        item.mark_enqueued();
    }

    /// Spawn an additional worker when the pool is below its target size.
    fn ensure_worker(&self, arc: &Arc<Inner>) -> Result<(), SpawnError> {
        if self.active_count.load(SeqCst) < self.target_threads
            && self.state.read() < PoolState::StopRequested
        {
            self.add_new_thread(arc, true)?;
        }
        Ok(())
    }

    /// Register and start one worker thread behind a start barrier.
    ///
    /// Returns `Ok(false)` without creating a thread when the pool is
    /// `Stopped` or already at its target size. A thread-creation failure is
    /// fatal to the operation (the barrier is released as failed) but leaves
    /// the pool usable.
    fn add_new_thread(
        &self,
        arc: &Arc<Inner>,
        create_local_queue: bool,
    ) -> Result<bool, SpawnError> {
        if self.state.read() == PoolState::Stopped {
            return Ok(false);
        }

        let mut registry = self.registry.lock();
        if self.state.read() == PoolState::Stopped {
            return Ok(false);
        }
        if registry.len() >= self.target_threads {
            return Ok(false);
        }

        let worker_id = self.next_worker_id.fetch_add(1, Relaxed) + 1;
        let token = Arc::new(StartToken::new());
        let data = StartupData {
            inner: arc.clone(),
            token: token.clone(),
            worker_id,
            create_local_queue,
        };

        let spawned = thread::Builder::new()
            .name(format!("{} (#{})", self.name, worker_id))
            .spawn(move || worker_main(data));

        match spawned {
            Ok(handle) => {
                let thread_id = handle.thread().id();
                registry.push(Arc::new(WorkerEntry {
                    worker_id,
                    thread_id,
                    handle: Mutex::new(Some(handle)),
                }));
                self.active_count.fetch_add(1, SeqCst);
                debug_assert_eq!(registry.len(), self.active_count.load(SeqCst));
                token.set_ok();
                tracing::debug!(pool = %self.name, worker = worker_id, "worker thread registered");
                Ok(true)
            }
            Err(source) => {
                token.set_fail();
                Err(SpawnError {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Remove an exiting worker from the registry; the last removal while
    /// `StopRequested` drives the `Stopped` transition.
    fn deregister_worker(&self, worker_id: usize) {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|entry| entry.worker_id != worker_id);
        debug_assert_eq!(before, registry.len() + 1, "worker missing from registry");
        self.active_count.fetch_sub(1, SeqCst);
        debug_assert_eq!(registry.len(), self.active_count.load(SeqCst));

        if registry.is_empty()
            && self.state.read() == PoolState::StopRequested
            && self.state.try_transition(PoolState::Stopped)
        {
            self.on_stopped();
        }
    }

    /// One-time side effect of the `Stopped` transition.
    fn on_stopped(&self) {
        let signalled_before = self.stop_signalled.swap(true, SeqCst);
        assert!(!signalled_before, "stopped transition handled twice");

        if self.complete_adding.load(SeqCst) {
            self.queues.drain_cancel();
        }
        self.queues.close();
        self.stop_event.set();
        tracing::debug!(pool = %self.name, "thread pool stopped");
    }

    fn is_stop_requested_or_stopped(&self) -> bool {
        self.state.read() >= PoolState::StopRequested
    }

    fn set_complete_adding(&self) {
        self.complete_adding.store(true, SeqCst);
        self.queues.complete_adding();
    }

    fn stop_pool(&self, options: StopOptions) {
        let StopOptions {
            wait_for_stop,
            let_finish_process,
            complete_adding,
        } = options;

        if self.is_stop_requested_or_stopped() {
            self.finish_stop(wait_for_stop, complete_adding);
            return;
        }

        let mut join_list = Vec::new();
        let initiated;
        {
            let registry = self.registry.lock();
            initiated = !self.is_stop_requested_or_stopped();
            if initiated {
                self.let_finish_process.store(let_finish_process, SeqCst);
                if wait_for_stop {
                    join_list = registry.clone();
                }

                let transitioned = self.state.try_transition(PoolState::StopRequested);
                debug_assert!(transitioned || self.state.read() == PoolState::Stopped);
                if registry.is_empty()
                    && self.state.read() != PoolState::Stopped
                    && self.state.try_transition(PoolState::Stopped)
                {
                    self.on_stopped();
                }

                self.cancel.cancel();
                self.queues.interrupt_waiters();
                if complete_adding {
                    self.set_complete_adding();
                }
                tracing::debug!(
                    pool = %self.name,
                    let_finish_process,
                    complete_adding,
                    "stop requested"
                );
            }
        }

        if !initiated {
            // Lost the race to a concurrent stop; behave like a repeat call.
            self.finish_stop(wait_for_stop, complete_adding);
            return;
        }

        if wait_for_stop {
            let self_id = thread::current().id();
            loop {
                // A worker calling stop on its own pool cannot join itself.
                join_list.retain(|entry| entry.thread_id != self_id);
                if join_list.is_empty() {
                    break;
                }
                for entry in join_list.drain(..) {
                    entry.join();
                }
                // Catch any thread that started concurrently with the
                // StopRequested transition.
                join_list = self.registry.lock().clone();
            }
        }

        if complete_adding && self.state.read() == PoolState::Stopped {
            self.queues.drain_cancel();
        }
    }

    /// Repeat-call path of the shutdown protocol.
    fn finish_stop(&self, wait_for_stop: bool, complete_adding: bool) {
        if complete_adding {
            self.set_complete_adding();
        }
        if self.state.read() == PoolState::Stopped && self.complete_adding.load(SeqCst) {
            self.queues.drain_cancel();
        }
        if wait_for_stop {
            self.stop_event.wait();
        }
    }

    /// Main processing loop of one worker thread.
    fn process_loop(&self, slot: Option<&LocalSlot>) {
        let cancel = self.cancel.token();

        loop {
            // Hot path: skip the stealer scan before committing to a wait.
            let quick = TakeOptions {
                local: true,
                steal: false,
            };
            if let Some(item) = self.queues.try_take(slot, quick) {
                self.run_item(item);
                continue;
            }

            match self.queues.take(slot, &cancel, None) {
                Ok(item) => self.run_item(item),
                Err(_) => break,
            }
        }

        if self.let_finish_process.load(SeqCst) {
            while let Some(item) = self.queues.try_take(slot, TakeOptions::default()) {
                self.run_item(item);
            }
        }
    }

    fn run_item(&self, item: WorkItem) {
        if let Some(wait) = item.queue_wait() {
            tracing::trace!(
                pool = %self.name,
                wait_us = wait.as_micros() as u64,
                "dequeued work item"
            );
        }
        item.run();
    }

    pub(crate) fn is_current_pool_thread(&self) -> bool {
        CURRENT_POOL.with(|current| current.get() == self.pool_id)
    }

    pub(crate) fn queues_bounded(&self) -> bool {
        self.queues.is_bounded()
    }

    pub(crate) fn extend_capacity_for_send(&self) {
        self.queues.extend_capacity(1);
    }
}

// ===== worker thread body =====

fn worker_main(data: StartupData) {
    if !data.token.wait() {
        // Registration failed; this thread was never accounted for.
        return;
    }
    let inner = data.inner;

    inner.state.try_transition(PoolState::Running);
    if inner.state.read() == PoolState::Stopped {
        inner.deregister_worker(data.worker_id);
        return;
    }

    CURRENT_POOL.with(|current| current.set(inner.pool_id));
    let slot = if data.create_local_queue {
        let slot = inner.queues.create_local(data.worker_id);
        LocalSlot::install(slot.clone());
        Some(slot)
    } else {
        None
    };
    if inner.install_pool_context {
        PoolContext::install(PoolContext::from_inner(inner.clone()));
    }

    let loop_outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        inner.process_loop(slot.as_deref());
    }));
    if loop_outcome.is_err() {
        tracing::error!(pool = %inner.name, worker = data.worker_id, "worker loop panicked");
    }

    if inner.install_pool_context {
        PoolContext::uninstall();
    }
    if let Some(slot) = slot {
        LocalSlot::uninstall();
        inner.queues.release_local(&slot);
    }
    CURRENT_POOL.with(|current| current.set(0));

    tracing::debug!(pool = %inner.name, worker = data.worker_id, "worker thread exiting");
    inner.deregister_worker(data.worker_id);
}

// ===== impl WorkerEntry =====

impl WorkerEntry {
    fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // Worker panics are caught inside the loop; a join error here
            // would mean the catch itself failed.
            let _ = handle.join();
        }
    }
}

// ===== impl StartToken =====

impl StartToken {
    fn new() -> StartToken {
        StartToken {
            state: AtomicU8::new(TOKEN_PENDING),
        }
    }

    /// Spin-then-yield until the barrier is released; true when released ok.
    fn wait(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.state.load(SeqCst) {
                TOKEN_PENDING => backoff.snooze(),
                TOKEN_OK => return true,
                _ => return false,
            }
        }
    }

    fn set_ok(&self) {
        self.state.store(TOKEN_OK, SeqCst);
    }

    fn set_fail(&self) {
        self.state.store(TOKEN_FAILED, SeqCst);
    }
}

// ===== impl StopEvent =====

impl StopEvent {
    fn new() -> StopEvent {
        StopEvent {
            set: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.signal.notify_all();
    }

    fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.signal.wait(&mut set);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.signal.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }
}
