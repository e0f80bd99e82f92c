use std::any::Any;
use std::fmt;
use std::io;
use std::panic;

use thiserror::Error;

/// Reasons a work item could not be placed into the pool's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The global queue is at its bounded capacity (non-blocking path only).
    #[error("the global work queue is at capacity")]
    QueueFull,
    /// The pool was marked as completed for adding; no further work accepted.
    #[error("the pool no longer accepts new work items")]
    AddingCompleted,
    /// The pool has reached the `Stopped` state and released its queues.
    #[error("the pool has stopped")]
    Stopped,
}

/// Worker thread creation failed at the OS level.
///
/// This is fatal for the operation that triggered thread creation, but the
/// pool itself remains usable.
#[derive(Debug, Error)]
#[error("failed to spawn a worker thread for pool '{name}'")]
pub struct SpawnError {
    pub(crate) name: String,
    #[source]
    pub(crate) source: io::Error,
}

/// Errors surfaced by enqueue operations that may also create threads.
#[derive(Debug, Error)]
pub enum RunError {
    /// The work item was rejected by the queues.
    #[error(transparent)]
    Rejected(#[from] EnqueueError),
    /// The item was enqueued, but spawning an additional worker failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// Outcome of a blocking or timed take from the queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum TakeError {
    /// The shared cancellation signal fired while waiting.
    #[error("the take was cancelled")]
    Cancelled,
    /// The bounded wait elapsed without an item becoming available.
    #[error("the take timed out")]
    Timeout,
}

/// The payload of a panic captured inside a work item body.
pub struct PanicPayload(Box<dyn Any + Send + 'static>);

/// Why waiting on a [`JobHandle`](crate::JobHandle) did not produce a value.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The work item was cancelled before it ran.
    #[error("the work item was cancelled before execution")]
    Cancelled,
    /// The work item body panicked; the payload is carried for re-raising.
    #[error("the work item panicked: {}", .0.message())]
    Panicked(PanicPayload),
}

/// Errors surfaced by [`PoolContext::send`](crate::PoolContext::send).
#[derive(Debug, Error)]
pub enum SendError {
    /// The callback could not be enqueued.
    #[error(transparent)]
    Rejected(#[from] RunError),
    /// The callback was cancelled by pool shutdown before it ran.
    #[error("the callback was cancelled before execution")]
    Cancelled,
}

// ===== impl PanicPayload =====

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> PanicPayload {
        PanicPayload(payload)
    }

    /// Best-effort extraction of the panic message.
    pub fn message(&self) -> &str {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s.as_str()
        } else {
            "non-string panic payload"
        }
    }

    /// Re-raise the captured panic on the calling thread.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.0)
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}
