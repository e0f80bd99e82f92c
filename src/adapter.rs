//! Adapters exposing a pool to foreign continuation systems.
//!
//! A [`PoolContext`] is a cheap cloneable handle that schedules callbacks on
//! its pool through the [`ScheduleTarget`] trait: `post` is fire-and-forget,
//! `send` blocks the caller until the callback has run. Pools built with
//! [`Builder::install_pool_context`](crate::Builder::install_pool_context)
//! install a context on every worker thread so callbacks can reach their own
//! pool via [`PoolContext::current`].

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::error::{RunError, SendError};
use crate::pool::Inner;
use crate::work::{SendOutcome, WorkItem};

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<PoolContext>> = const { RefCell::new(None) };
}

/// Targets that accept callbacks from a foreign continuation system.
pub trait ScheduleTarget {
    /// Schedule a callback without waiting for it to run.
    fn post(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Result<(), RunError>;

    /// Schedule a callback and block until it has run.
    ///
    /// A panic inside the callback is re-raised on the calling thread.
    ///
    /// The callback always runs on a pool thread, never inline in the
    /// caller. A send from the only worker of a single-thread pool therefore
    /// deadlocks: no other thread exists to pick the callback up while the
    /// sender blocks.
    fn send(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Result<(), SendError>;
}

/// Schedules callbacks onto the thread pool it was created from.
#[derive(Clone)]
pub struct PoolContext {
    inner: Arc<Inner>,
}

// ===== impl PoolContext =====

impl PoolContext {
    pub(crate) fn from_inner(inner: Arc<Inner>) -> PoolContext {
        PoolContext { inner }
    }

    /// The context installed on the current thread, if any.
    ///
    /// Worker threads of pools configured with
    /// [`install_pool_context`](crate::Builder::install_pool_context) carry
    /// one for the duration of their processing loop.
    pub fn current() -> Option<PoolContext> {
        CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
    }

    pub(crate) fn install(context: PoolContext) {
        CURRENT_CONTEXT.with(|slot| *slot.borrow_mut() = Some(context));
    }

    pub(crate) fn uninstall() {
        CURRENT_CONTEXT.with(|slot| *slot.borrow_mut() = None);
    }
}

impl ScheduleTarget for PoolContext {
    /// Posted callbacks always go through the global queue, preserving the
    /// caller's cross-callback ordering expectations.
    fn post(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Result<(), RunError> {
        self.inner.enqueue(&self.inner, WorkItem::post(f), true)
    }

    fn send(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Result<(), SendError> {
        let (item, waiter) = WorkItem::sync_send(f);

        // A worker sending into its own bounded pool could otherwise block on
        // a queue it is responsible for draining.
        if self.inner.is_current_pool_thread() && self.inner.queues_bounded() {
            self.inner.extend_capacity_for_send();
        }
        self.inner.enqueue(&self.inner, item, true)?;

        match waiter.wait() {
            SendOutcome::Completed => Ok(()),
            SendOutcome::Panicked(payload) => payload.resume(),
            SendOutcome::Cancelled => Err(SendError::Cancelled),
        }
    }
}

impl fmt::Debug for PoolContext {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PoolContext").finish()
    }
}
