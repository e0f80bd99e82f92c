use std::panic;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use threadmill::{
    suppress_flow, Builder, EnqueueError, ExecutionContext, JoinError, PoolContext, PoolState,
    RunError, ScheduleTarget, StopOptions, ThreadPool,
};

fn await_state(pool: &ThreadPool, expected: PoolState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.state() != expected {
        assert!(Instant::now() < deadline, "pool never reached {:?}", expected);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_type_bounds() {
    fn assert_bounds<T: Send + Sync>() {}
    assert_bounds::<ThreadPool>();
    assert_bounds::<PoolContext>();
}

#[test]
fn test_run_basic() {
    let pool = ThreadPool::single_thread();
    let (tx, rx) = channel();

    pool.run(move || tx.send("hi").unwrap(), false).unwrap();

    assert_eq!("hi", rx.recv_timeout(Duration::from_secs(5)).unwrap());
    pool.stop(StopOptions::drain());
}

#[test]
fn test_run_with_state() {
    let pool = ThreadPool::single_thread();
    let (tx, rx) = channel();

    pool.run_with_state(move |n: u32| tx.send(n * 2).unwrap(), 21, false)
        .unwrap();

    assert_eq!(42, rx.recv_timeout(Duration::from_secs(5)).unwrap());
    pool.stop(StopOptions::drain());
}

#[test]
fn test_submit_returns_value() {
    let pool = ThreadPool::fixed_size(2);

    let handle = pool.submit(|| "done".to_string()).unwrap();
    assert_eq!("done", handle.wait().unwrap());

    pool.stop(StopOptions::drain());
}

#[test]
fn test_submit_captures_panic() {
    let pool = ThreadPool::single_thread();

    let handle = pool.submit::<u32, _>(|| panic!("kaboom")).unwrap();
    match handle.wait() {
        Err(JoinError::Panicked(payload)) => assert_eq!("kaboom", payload.message()),
        other => panic!("unexpected outcome: {:?}", other.err()),
    }

    // The worker survives a panicking item.
    let handle = pool.submit(|| 7u32).unwrap();
    assert_eq!(7, handle.wait().unwrap());

    pool.stop(StopOptions::drain());
}

#[test]
fn test_every_item_runs_exactly_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;

    let pool = Arc::new(ThreadPool::fixed_size(4));
    let count = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let pool = pool.clone();
            let count = count.clone();
            thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    let count = count.clone();
                    pool.run(
                        move || {
                            count.fetch_add(1, SeqCst);
                        },
                        false,
                    )
                    .unwrap();
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    pool.stop(StopOptions::drain());
    assert_eq!(PRODUCERS * PER_PRODUCER, count.load(SeqCst));
    assert_eq!(PoolState::Stopped, pool.state());
}

#[test]
fn test_bounded_queue_backpressure() {
    let pool = Arc::new(
        Builder::new()
            .name("bounded")
            .thread_count(1)
            .queue_capacity(2)
            .build(),
    );

    let (started_tx, started_rx) = channel();
    let (release_tx, release_rx) = channel::<()>();
    let count = Arc::new(AtomicUsize::new(0));

    // Occupy the single worker so queued items pile up.
    pool.run(
        move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        },
        true,
    )
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    for _ in 0..2 {
        let count = count.clone();
        pool.try_run(
            move || {
                count.fetch_add(1, SeqCst);
            },
            true,
        )
        .unwrap();
    }
    assert_eq!(2, pool.queued());

    let overflow = pool.try_run(|| {}, true);
    assert!(matches!(
        overflow,
        Err(RunError::Rejected(EnqueueError::QueueFull))
    ));

    // A blocking enqueue parks until the worker makes room.
    let (done_tx, done_rx) = channel();
    let blocked = {
        let pool = pool.clone();
        let count = count.clone();
        thread::spawn(move || {
            pool.run(
                move || {
                    count.fetch_add(1, SeqCst);
                },
                true,
            )
            .unwrap();
            done_tx.send(()).unwrap();
        })
    };
    assert_eq!(
        Err(RecvTimeoutError::Timeout),
        done_rx.recv_timeout(Duration::from_millis(100))
    );

    release_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    blocked.join().unwrap();

    pool.stop(StopOptions::drain());
    assert_eq!(3, count.load(SeqCst));
}

#[test]
fn test_extend_queue_capacity() {
    let pool = Builder::new().thread_count(1).queue_capacity(1).build();

    let (started_tx, started_rx) = channel();
    let (release_tx, release_rx) = channel::<()>();
    pool.run(
        move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        },
        true,
    )
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    pool.try_run(|| {}, true).unwrap();
    assert!(matches!(
        pool.try_run(|| {}, true),
        Err(RunError::Rejected(EnqueueError::QueueFull))
    ));

    pool.extend_queue_capacity(1);
    assert_eq!(Some(2), pool.queue_capacity());
    pool.try_run(|| {}, true).unwrap();

    release_tx.send(()).unwrap();
    pool.stop(StopOptions::drain());
}

#[test]
fn test_zero_queue_capacity_is_unbounded() {
    let pool = Builder::new().thread_count(1).queue_capacity(0).build();
    assert_eq!(None, pool.queue_capacity());

    let (tx, rx) = channel();
    pool.try_run(move || tx.send(()).unwrap(), true).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    pool.stop(StopOptions::drain());
}

#[test]
fn test_stop_abandon_cancels_queued_items() {
    let pool = Arc::new(ThreadPool::single_thread());

    let (started_tx, started_rx) = channel();
    let (release_tx, release_rx) = channel::<()>();
    pool.run(
        move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        },
        true,
    )
    .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let handles: Vec<_> = (0..5).map(|i| pool.submit(move || i).unwrap()).collect();

    let stopper = {
        let pool = pool.clone();
        thread::spawn(move || pool.stop(StopOptions::abandon()))
    };

    // Hold the worker until the stop request is fully published.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pool.is_adding_completed() {
        assert!(Instant::now() < deadline, "stop request never published");
        thread::sleep(Duration::from_millis(1));
    }
    release_tx.send(()).unwrap();
    stopper.join().unwrap();

    assert_eq!(PoolState::Stopped, pool.state());
    for handle in handles {
        assert!(matches!(handle.wait(), Err(JoinError::Cancelled)));
    }
}

#[test]
fn test_stop_before_any_thread_started() {
    let pool = ThreadPool::fixed_size(2);
    assert_eq!(PoolState::Created, pool.state());

    pool.stop(StopOptions::drain());
    assert_eq!(PoolState::Stopped, pool.state());
    pool.wait_until_stopped();
}

#[test]
fn test_stop_is_idempotent_and_rejects_new_work() {
    let pool = ThreadPool::single_thread();
    pool.run(|| {}, false).unwrap();
    await_state(&pool, PoolState::Running);

    pool.stop(StopOptions::drain());
    pool.stop(StopOptions::drain());
    assert_eq!(PoolState::Stopped, pool.state());
    assert_eq!(0, pool.thread_count());

    let rejected = pool.run(|| {}, false);
    assert!(matches!(
        rejected,
        Err(RunError::Rejected(EnqueueError::Stopped))
    ));
}

#[test]
fn test_complete_adding_rejects_new_work() {
    let pool = ThreadPool::single_thread();
    pool.run(|| {}, false).unwrap();

    pool.complete_adding();
    assert!(pool.is_adding_completed());

    let rejected = pool.run(|| {}, false);
    assert!(matches!(
        rejected,
        Err(RunError::Rejected(EnqueueError::AddingCompleted))
    ));

    pool.stop(StopOptions::drain());
}

#[test]
fn test_wait_until_stopped_timeout() {
    let pool = Arc::new(ThreadPool::single_thread());
    pool.run(|| thread::sleep(Duration::from_millis(50)), false)
        .unwrap();

    assert!(!pool.wait_until_stopped_timeout(Duration::from_millis(10)));

    let stopper = {
        let pool = pool.clone();
        thread::spawn(move || pool.stop(StopOptions::drain()))
    };
    assert!(pool.wait_until_stopped_timeout(Duration::from_secs(5)));
    stopper.join().unwrap();
}

#[test]
fn test_prestart_threads() {
    let pool = ThreadPool::fixed_size(3);

    assert_eq!(3, pool.prestart_threads().unwrap());
    assert_eq!(3, pool.thread_count());
    await_state(&pool, PoolState::Running);

    // Already at target size.
    assert_eq!(0, pool.prestart_threads().unwrap());

    pool.stop(StopOptions::drain());
    assert_eq!(0, pool.thread_count());
}

#[test]
fn test_is_pool_thread() {
    let pool = Arc::new(ThreadPool::single_thread());
    assert!(!pool.is_pool_thread());

    let (tx, rx) = channel();
    let inner = pool.clone();
    pool.run(move || tx.send(inner.is_pool_thread()).unwrap(), false)
        .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    pool.stop(StopOptions::drain());
}

#[test]
fn test_single_thread_fair_ordering() {
    let pool = ThreadPool::single_thread();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let seen = seen.clone();
        pool.run(move || seen.lock().push(i), true).unwrap();
    }

    pool.stop(StopOptions::drain());
    assert_eq!((0..10).collect::<Vec<_>>(), *seen.lock());
}

#[test]
fn test_work_spreads_across_workers() {
    let pool = ThreadPool::fixed_size(4);
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let count = count.clone();
        pool.run(
            move || {
                thread::sleep(Duration::from_millis(1));
                count.fetch_add(1, SeqCst);
            },
            false,
        )
        .unwrap();
    }

    pool.stop(StopOptions::drain());
    assert_eq!(100, count.load(SeqCst));
}

#[test]
fn test_context_flows_to_worker() {
    let pool = ThreadPool::single_thread();
    let (tx, rx) = channel();

    ExecutionContext::set_ambient(Some(ExecutionContext::new(99u32)));
    pool.run(
        move || {
            let seen = ExecutionContext::ambient().and_then(|cx| cx.value::<u32>().copied());
            tx.send(seen).unwrap();
        },
        false,
    )
    .unwrap();
    ExecutionContext::set_ambient(None);

    assert_eq!(Some(99), rx.recv_timeout(Duration::from_secs(5)).unwrap());

    // The worker's ambient context does not leak into later items.
    let (tx, rx) = channel();
    pool.run(
        move || tx.send(ExecutionContext::ambient().is_none()).unwrap(),
        false,
    )
    .unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

    pool.stop(StopOptions::drain());
}

#[test]
fn test_suppressed_context_does_not_flow() {
    let pool = ThreadPool::single_thread();
    let (tx, rx) = channel();

    ExecutionContext::set_ambient(Some(ExecutionContext::new(7u32)));
    {
        let _guard = suppress_flow();
        pool.run(
            move || tx.send(ExecutionContext::ambient().is_none()).unwrap(),
            false,
        )
        .unwrap();
    }
    ExecutionContext::set_ambient(None);

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    pool.stop(StopOptions::drain());
}

#[test]
fn test_context_post() {
    let pool = ThreadPool::single_thread();
    let context = pool.context();
    let (tx, rx) = channel();

    context
        .post(Box::new(move || tx.send("posted").unwrap()))
        .unwrap();

    assert_eq!("posted", rx.recv_timeout(Duration::from_secs(5)).unwrap());
    pool.stop(StopOptions::drain());
}

#[test]
fn test_context_send_blocks_until_run() {
    let pool = ThreadPool::fixed_size(2);
    let context = pool.context();
    let count = Arc::new(AtomicUsize::new(0));

    {
        let count = count.clone();
        context
            .send(Box::new(move || {
                count.fetch_add(1, SeqCst);
            }))
            .unwrap();
    }
    // Send returns only after the callback ran.
    assert_eq!(1, count.load(SeqCst));

    pool.stop(StopOptions::drain());
}

#[test]
fn test_context_send_reraises_panic() {
    let pool = ThreadPool::single_thread();
    let context = pool.context();

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(move || {
        context.send(Box::new(|| panic!("sendfail")))
    }));
    let payload = outcome.unwrap_err();
    assert_eq!(Some(&"sendfail"), payload.downcast_ref::<&str>());

    // The pool is still healthy after the re-raise.
    let handle = pool.submit(|| 5u32).unwrap();
    assert_eq!(5, handle.wait().unwrap());

    pool.stop(StopOptions::drain());
}

#[test]
fn test_pool_context_current_on_worker() {
    let pool = Builder::new()
        .thread_count(1)
        .install_pool_context(true)
        .build();
    let (tx, rx) = channel();

    assert!(PoolContext::current().is_none());
    pool.run(move || tx.send(PoolContext::current().is_some()).unwrap(), false)
        .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    pool.stop(StopOptions::drain());
}

#[test]
fn test_worker_thread_names() {
    let pool = Builder::new().name("custom").thread_count(1).build();
    let (tx, rx) = channel();

    pool.run(
        move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        },
        false,
    )
    .unwrap();

    let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(name.starts_with("custom (#"), "unexpected name: {}", name);
    assert_eq!("custom", pool.name());

    pool.stop(StopOptions::drain());
}

#[test]
fn test_drop_requests_stop() {
    let count = Arc::new(AtomicUsize::new(0));
    {
        let pool = ThreadPool::single_thread();
        let count = count.clone();
        pool.run(
            move || {
                count.fetch_add(1, SeqCst);
            },
            false,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(1, count.load(SeqCst));
}
