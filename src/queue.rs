//! Queue storage for the pool: one global bounded queue plus per-worker
//! local queues exposed to other workers for stealing.
//!
//! Placement rule: an item preferring fairness, or enqueued from a thread
//! without a local queue, goes to the global queue (blocking when bounded and
//! full); otherwise it goes to the calling worker's local queue. Takes search
//! local-first, then global, then steal. Local pushes by other workers are
//! invisible to a sleeping taker, so blocking waits are bounded by a steal
//! awake period after which the steal scan is retried.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::time::{Duration, Instant};

use crossbeam_deque::{Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::{EnqueueError, TakeError};
use crate::work::WorkItem;

thread_local! {
    static LOCAL_SLOT: RefCell<Option<Rc<LocalSlot>>> = const { RefCell::new(None) };
}

/// Owns the global queue and the registry of local-queue stealers.
pub(crate) struct QueueStore {
    pool_id: usize,
    global: Mutex<GlobalQueue>,
    item_available: Condvar,
    space_available: Condvar,
    stealers: Mutex<Vec<StealerEntry>>,
    closed: AtomicBool,
    adding_completed: AtomicBool,
    steal_tick: AtomicUsize,
    steal_awake_period: Duration,
}

struct GlobalQueue {
    items: VecDeque<WorkItem>,
    // Effective capacity; grows monotonically via `extend_capacity`.
    capacity: Option<usize>,
}

struct StealerEntry {
    worker_id: usize,
    stealer: Stealer<WorkItem>,
}

/// A worker thread's local queue, owned by that thread for push/pop and
/// exposed to other workers only through its registered stealer.
pub(crate) struct LocalSlot {
    pool_id: usize,
    worker_id: usize,
    deque: Deque<WorkItem>,
}

/// Which search steps a non-blocking take performs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TakeOptions {
    /// Search the caller's own local queue first.
    pub local: bool,
    /// Attempt to steal from other workers' local queues.
    pub steal: bool,
}

impl Default for TakeOptions {
    fn default() -> TakeOptions {
        TakeOptions {
            local: true,
            steal: true,
        }
    }
}

// ===== impl QueueStore =====

impl QueueStore {
    pub fn new(pool_id: usize, capacity: Option<usize>, steal_awake_period: Duration) -> QueueStore {
        QueueStore {
            pool_id,
            global: Mutex::new(GlobalQueue {
                items: VecDeque::new(),
                capacity,
            }),
            item_available: Condvar::new(),
            space_available: Condvar::new(),
            stealers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            adding_completed: AtomicBool::new(false),
            steal_tick: AtomicUsize::new(0),
            steal_awake_period,
        }
    }

    /// Place an item, blocking while the bounded global queue is full.
    pub fn add(&self, item: WorkItem) -> Result<(), EnqueueError> {
        let item = match self.try_push_local(item) {
            Ok(()) => return Ok(()),
            Err(item) => item,
        };
        self.push_global(item, true)
    }

    /// Place an item without blocking.
    pub fn try_add(&self, item: WorkItem) -> Result<(), EnqueueError> {
        let item = match self.try_push_local(item) {
            Ok(()) => return Ok(()),
            Err(item) => item,
        };
        self.push_global(item, false)
    }

    /// Push to the calling worker's local queue when fairness allows it and
    /// the thread belongs to this pool.
    fn try_push_local(&self, item: WorkItem) -> Result<(), WorkItem> {
        if item.prefer_fairness() {
            return Err(item);
        }

        LOCAL_SLOT.with(|cell| match cell.borrow().as_ref() {
            Some(slot) if slot.pool_id == self.pool_id => {
                slot.deque.push(item);
                // Give a sleeping peer a chance to steal it promptly.
                self.item_available.notify_one();
                Ok(())
            }
            _ => Err(item),
        })
    }

    fn push_global(&self, item: WorkItem, block: bool) -> Result<(), EnqueueError> {
        let mut global = self.global.lock();
        loop {
            if self.closed.load(SeqCst) {
                return Err(EnqueueError::Stopped);
            }
            if self.adding_completed.load(SeqCst) {
                return Err(EnqueueError::AddingCompleted);
            }

            let has_space = global
                .capacity
                .map_or(true, |capacity| global.items.len() < capacity);
            if has_space {
                global.items.push_back(item);
                drop(global);
                self.item_available.notify_one();
                return Ok(());
            }
            if !block {
                return Err(EnqueueError::QueueFull);
            }

            self.space_available.wait(&mut global);
        }
    }

    /// Push ignoring the capacity bound; items hitting a closed store are
    /// cancelled instead. Used when returning a leftover local queue to the
    /// global queue on worker exit.
    fn force_push_global(&self, item: WorkItem) {
        let mut global = self.global.lock();
        if self.closed.load(SeqCst) {
            drop(global);
            item.cancel();
            return;
        }
        global.items.push_back(item);
        drop(global);
        self.item_available.notify_one();
    }

    /// Blocking take: local, then global, then steal; waits (bounded by the
    /// steal awake period, and by `timeout` if given) until an item shows up
    /// anywhere or the cancel token fires.
    pub fn take(
        &self,
        slot: Option<&LocalSlot>,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<WorkItem, TakeError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if cancel.is_cancelled() {
                return Err(TakeError::Cancelled);
            }
            if let Some(item) = self.try_take(slot, TakeOptions::default()) {
                return Ok(item);
            }

            let mut global = self.global.lock();
            if let Some(item) = global.items.pop_front() {
                drop(global);
                self.space_available.notify_one();
                return Ok(item);
            }
            if cancel.is_cancelled() {
                return Err(TakeError::Cancelled);
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(TakeError::Timeout);
            }
            let mut wake_at = now + self.steal_awake_period;
            if let Some(deadline) = deadline {
                wake_at = wake_at.min(deadline);
            }
            let _ = self.item_available.wait_until(&mut global, wake_at);
        }
    }

    /// Non-blocking take with configurable search steps.
    pub fn try_take(&self, slot: Option<&LocalSlot>, options: TakeOptions) -> Option<WorkItem> {
        if options.local {
            if let Some(slot) = slot {
                if let Some(item) = slot.deque.pop() {
                    return Some(item);
                }
            }
        }

        {
            let mut global = self.global.lock();
            if let Some(item) = global.items.pop_front() {
                drop(global);
                self.space_available.notify_one();
                return Some(item);
            }
        }

        if options.steal {
            return self.try_steal(slot.map(|slot| slot.worker_id));
        }
        None
    }

    /// Steal one item from another worker's local queue.
    ///
    /// The scan starts from a rotating index so no single victim is starved.
    fn try_steal(&self, own_id: Option<usize>) -> Option<WorkItem> {
        let stealers = self.stealers.lock();
        if stealers.is_empty() {
            return None;
        }

        let start = self.steal_tick.fetch_add(1, Relaxed) % stealers.len();
        for offset in 0..stealers.len() {
            let entry = &stealers[(start + offset) % stealers.len()];
            if Some(entry.worker_id) == own_id {
                continue;
            }
            loop {
                match entry.stealer.steal() {
                    Steal::Success(item) => return Some(item),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    /// Create and register a local queue for `worker_id`.
    pub fn create_local(&self, worker_id: usize) -> Rc<LocalSlot> {
        let deque = Deque::new_fifo();
        self.stealers.lock().push(StealerEntry {
            worker_id,
            stealer: deque.stealer(),
        });
        Rc::new(LocalSlot {
            pool_id: self.pool_id,
            worker_id,
            deque,
        })
    }

    /// Unregister a worker's local queue and return its leftovers to the
    /// global queue (or cancel them when the store is already closed).
    pub fn release_local(&self, slot: &LocalSlot) {
        self.stealers
            .lock()
            .retain(|entry| entry.worker_id != slot.worker_id);

        while let Some(item) = slot.deque.pop() {
            self.force_push_global(item);
        }
    }

    /// Raise the bounded capacity of the global queue by `extra`.
    pub fn extend_capacity(&self, extra: usize) {
        let mut global = self.global.lock();
        if let Some(capacity) = global.capacity.as_mut() {
            *capacity += extra;
        }
        drop(global);
        self.space_available.notify_all();
    }

    /// Reject further adds and wake any producer blocked on capacity.
    pub fn complete_adding(&self) {
        self.adding_completed.store(true, SeqCst);
        self.space_available.notify_all();
    }

    /// Release queue resources at the `Stopped` transition.
    pub fn close(&self) {
        self.closed.store(true, SeqCst);
        self.item_available.notify_all();
        self.space_available.notify_all();
    }

    /// Wake every blocked producer and consumer so they re-observe flags.
    pub fn interrupt_waiters(&self) {
        self.item_available.notify_all();
        self.space_available.notify_all();
    }

    /// Remove and cancel every item left in the global queue.
    pub fn drain_cancel(&self) {
        let drained: Vec<WorkItem> = {
            let mut global = self.global.lock();
            global.items.drain(..).collect()
        };
        self.space_available.notify_all();

        let cancelled = drained.len();
        for item in drained {
            item.cancel();
        }
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled abandoned work items");
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.global.lock().capacity.is_some()
    }

    pub fn global_len(&self) -> usize {
        self.global.lock().items.len()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.global.lock().capacity
    }
}

// ===== impl LocalSlot =====

impl LocalSlot {
    /// Install this slot as the calling thread's local queue.
    pub fn install(slot: Rc<LocalSlot>) {
        LOCAL_SLOT.with(|cell| *cell.borrow_mut() = Some(slot));
    }

    /// Remove the calling thread's local queue association.
    pub fn uninstall() {
        LOCAL_SLOT.with(|cell| *cell.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn store(capacity: Option<usize>) -> QueueStore {
        QueueStore::new(1, capacity, Duration::from_millis(10))
    }

    fn noop() -> WorkItem {
        WorkItem::action(|| {}, true, false)
    }

    #[test]
    fn bounded_try_add_rejects_at_capacity() {
        let store = store(Some(2));

        assert!(store.try_add(noop()).is_ok());
        assert!(store.try_add(noop()).is_ok());
        assert_eq!(Err(EnqueueError::QueueFull), store.try_add(noop()));
        assert_eq!(2, store.global_len());
    }

    #[test]
    fn extend_capacity_makes_room() {
        let store = store(Some(1));

        assert!(store.try_add(noop()).is_ok());
        assert_eq!(Err(EnqueueError::QueueFull), store.try_add(noop()));

        store.extend_capacity(1);
        assert!(store.try_add(noop()).is_ok());
        assert_eq!(Some(2), store.capacity());
    }

    #[test]
    fn take_prefers_local_then_global() {
        let store = store(None);
        let cancel = CancelSource::new();
        let slot = store.create_local(1);

        let order = Arc::new(AtomicUsize::new(0));
        let o = order.clone();
        slot.deque
            .push(WorkItem::action(move || o.store(1, SeqCst), false, false));
        store.try_add(noop()).unwrap();

        let first = store.take(Some(&slot), &cancel.token(), None).unwrap();
        first.run();
        assert_eq!(1, order.load(SeqCst));
        assert_eq!(1, store.global_len());
    }

    #[test]
    fn steal_from_another_local_queue() {
        let store = store(None);
        let victim = store.create_local(1);
        let thief = store.create_local(2);

        victim.deque.push(noop());

        let stolen = store.try_take(Some(&thief), TakeOptions::default());
        assert!(stolen.is_some());
        assert!(victim.deque.pop().is_none());
    }

    #[test]
    fn no_steal_mode_skips_other_queues() {
        let store = store(None);
        let victim = store.create_local(1);
        let thief = store.create_local(2);

        victim.deque.push(noop());

        let options = TakeOptions {
            local: true,
            steal: false,
        };
        assert!(store.try_take(Some(&thief), options).is_none());
    }

    #[test]
    fn no_local_mode_skips_own_queue() {
        let store = store(None);
        let slot = store.create_local(1);

        slot.deque.push(noop());
        store.try_add(noop()).unwrap();

        let options = TakeOptions {
            local: false,
            steal: false,
        };
        assert!(store.try_take(Some(&slot), options).is_some());
        assert_eq!(0, store.global_len());
        // The own local queue was left untouched.
        assert!(slot.deque.pop().is_some());
    }

    #[test]
    fn cancelled_take_fails() {
        let store = store(None);
        let cancel = CancelSource::new();
        cancel.cancel();

        let result = store.take(None, &cancel.token(), None);
        assert_eq!(Some(TakeError::Cancelled), result.err());
    }

    #[test]
    fn timed_take_on_empty_store_times_out() {
        let store = store(None);
        let cancel = CancelSource::new();

        let result = store.take(None, &cancel.token(), Some(Duration::from_millis(30)));
        assert_eq!(Some(TakeError::Timeout), result.err());
    }

    #[test]
    fn release_local_returns_items_to_global() {
        let store = store(None);
        let slot = store.create_local(1);

        slot.deque.push(noop());
        slot.deque.push(noop());
        store.release_local(&slot);

        assert_eq!(2, store.global_len());
        assert!(store.try_take(None, TakeOptions::default()).is_some());
    }

    #[test]
    fn drain_cancel_empties_global_queue() {
        let store = store(None);
        store.try_add(noop()).unwrap();
        store.try_add(noop()).unwrap();

        store.drain_cancel();
        assert_eq!(0, store.global_len());
    }

    #[test]
    fn closed_store_rejects_adds() {
        let store = store(None);
        store.close();
        assert_eq!(Err(EnqueueError::Stopped), store.try_add(noop()));
    }

    #[test]
    fn completed_store_rejects_adds() {
        let store = store(None);
        store.complete_adding();
        assert_eq!(Err(EnqueueError::AddingCompleted), store.try_add(noop()));
    }
}
