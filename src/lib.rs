//! Execute deferred work on a pool of threads with explicit lifecycle control.
//!
//! A thread pool contains a set of previously spawned threads enabling running
//! work items in parallel without having to spawn a new thread for each one.
//! Compared to a platform-default pool, this one offers explicit lifecycle
//! control (`Created → Running → StopRequested → Stopped`), per-thread local
//! queues with work stealing, bounded backpressure on the global queue, and
//! adapters that let continuation systems target the pool transparently.
//!
//! Work enters through [`ThreadPool::run`] and friends, lands either in the
//! global bounded queue or in the calling worker's local queue (controlled by
//! a per-item fairness flag), and is consumed by worker loops that search
//! local-first, then global, then steal from other workers. Shutdown is
//! race-free: a one-shot cancellation signal stops the loops, queued items are
//! either drained or cancelled, and the last exiting thread flips the pool to
//! `Stopped` exactly once.
//!
//! Programmers are urged to use the convenient builder methods
//! [`fixed_size`](struct.ThreadPool.html#method.fixed_size) and
//! [`single_thread`](struct.ThreadPool.html#method.single_thread) that
//! preconfigure settings for the most common usage scenarios; otherwise use
//! [`Builder`] to tune queue capacity, context flowing and steal timing.

#![warn(missing_docs, missing_debug_implementations)]

mod adapter;
mod cancel;
mod context;
mod error;
mod pool;
mod queue;
mod state;
mod work;

pub use adapter::{PoolContext, ScheduleTarget};
pub use context::{suppress_flow, ContextGuard, ExecutionContext, SuppressGuard};
pub use error::{EnqueueError, JoinError, PanicPayload, RunError, SendError, SpawnError};
pub use pool::{Builder, StopOptions, ThreadPool};
pub use state::PoolState;
pub use work::JobHandle;
