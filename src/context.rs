//! Ambient execution context captured at enqueue time and restored around
//! work item execution.
//!
//! The context is an immutable snapshot value. Producers set an ambient
//! context on their thread; when a work item is enqueued with context flowing
//! enabled, the current ambient value is captured into the item and installed
//! on the worker thread for the duration of the item's body, then the
//! worker's previous ambient value is restored. Flowing can be suppressed for
//! a scope with [`suppress_flow`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;

thread_local! {
    static AMBIENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
    static SUPPRESSED: Cell<bool> = const { Cell::new(false) };
}

/// An immutable snapshot of ambient execution state.
///
/// The payload is an opaque shared value; cloning a context is cheap.
#[derive(Clone)]
pub struct ExecutionContext {
    value: Arc<dyn Any + Send + Sync>,
}

/// Restores the previous ambient context when dropped.
///
/// Returned by the internal install step around work item execution; the
/// guard is held across the item body so the restore also happens when the
/// body panics.
#[must_use]
#[derive(Debug)]
pub struct ContextGuard {
    previous: Option<ExecutionContext>,
}

/// Re-enables context flowing for the suppressing thread when dropped.
#[must_use]
#[derive(Debug)]
pub struct SuppressGuard {
    previous: bool,
}

/// Suppress execution context capture on the current thread until the
/// returned guard is dropped.
pub fn suppress_flow() -> SuppressGuard {
    let previous = SUPPRESSED.with(|flag| flag.replace(true));
    SuppressGuard { previous }
}

// ===== impl ExecutionContext =====

impl ExecutionContext {
    /// Create a context snapshot carrying `value`.
    pub fn new<T: Any + Send + Sync>(value: T) -> ExecutionContext {
        ExecutionContext {
            value: Arc::new(value),
        }
    }

    /// Access the carried value if it has type `T`.
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Set (or clear) the ambient context for the current thread.
    pub fn set_ambient(context: Option<ExecutionContext>) {
        AMBIENT.with(|slot| *slot.borrow_mut() = context);
    }

    /// The ambient context of the current thread, if any.
    pub fn ambient() -> Option<ExecutionContext> {
        AMBIENT.with(|slot| slot.borrow().clone())
    }

    /// Snapshot the ambient context, honoring flow suppression.
    pub fn capture() -> Option<ExecutionContext> {
        if SUPPRESSED.with(|flag| flag.get()) {
            return None;
        }
        ExecutionContext::ambient()
    }

    /// Install this snapshot as the thread's ambient context; the previous
    /// ambient value is restored when the returned guard drops.
    pub fn install(self) -> ContextGuard {
        let previous = AMBIENT.with(|slot| slot.borrow_mut().replace(self));
        ContextGuard { previous }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ExecutionContext").finish()
    }
}

// ===== impl ContextGuard =====

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        AMBIENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

// ===== impl SuppressGuard =====

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESSED.with(|flag| flag.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_returns_ambient_snapshot() {
        ExecutionContext::set_ambient(Some(ExecutionContext::new(7usize)));
        let captured = ExecutionContext::capture().unwrap();
        assert_eq!(Some(&7usize), captured.value::<usize>());
        ExecutionContext::set_ambient(None);
    }

    #[test]
    fn suppression_blocks_capture() {
        ExecutionContext::set_ambient(Some(ExecutionContext::new("ctx")));
        {
            let _guard = suppress_flow();
            assert!(ExecutionContext::capture().is_none());
        }
        assert!(ExecutionContext::capture().is_some());
        ExecutionContext::set_ambient(None);
    }

    #[test]
    fn install_restores_previous_on_drop() {
        ExecutionContext::set_ambient(Some(ExecutionContext::new(1u32)));
        {
            let _guard = ExecutionContext::new(2u32).install();
            let inner = ExecutionContext::ambient().unwrap();
            assert_eq!(Some(&2u32), inner.value::<u32>());
        }
        let outer = ExecutionContext::ambient().unwrap();
        assert_eq!(Some(&1u32), outer.value::<u32>());
        ExecutionContext::set_ambient(None);
    }

    #[test]
    fn value_with_wrong_type_is_none() {
        let context = ExecutionContext::new(3i64);
        assert!(context.value::<String>().is_none());
    }
}
