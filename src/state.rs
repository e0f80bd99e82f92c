use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;

use crossbeam_utils::Backoff;

/// Lifecycle state of a thread pool.
///
/// The state only ever moves forward: `Created → Running → StopRequested →
/// Stopped`, with the short-circuits `Created → StopRequested` and
/// `Created → Stopped` for pools stopped before any thread started. The
/// numerical order among these values matters, to allow ordered comparisons.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PoolState {
    /// The pool exists but no worker thread has started yet.
    Created = 0,
    /// At least one worker thread has started processing.
    Running = 1,
    /// A stop was requested; workers are winding down.
    StopRequested = 2,
    /// All worker threads have exited and resources are released.
    Stopped = 3,
}

pub(crate) struct AtomicState {
    atomic: AtomicU8,
}

// ===== impl AtomicState =====

impl AtomicState {
    pub fn new() -> AtomicState {
        AtomicState {
            atomic: AtomicU8::new(PoolState::Created as u8),
        }
    }

    pub fn read(&self) -> PoolState {
        PoolState::from_u8(self.atomic.load(SeqCst))
    }

    /// Attempt a validated transition to `new`.
    ///
    /// Runs a CAS ladder: while a concurrent transition changes the observed
    /// state, the attempt is retried as long as `new` is still reachable from
    /// whatever the current state has become. Returns false once it is not.
    pub fn try_transition(&self, new: PoolState) -> bool {
        let backoff = Backoff::new();
        let mut current = self.read();

        loop {
            if !is_valid_transition(current, new) {
                return false;
            }

            match self
                .atomic
                .compare_exchange(current as u8, new as u8, SeqCst, SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => {
                    backoff.snooze();
                    current = PoolState::from_u8(actual);
                }
            }
        }
    }
}

// ===== impl PoolState =====

impl PoolState {
    fn from_u8(val: u8) -> PoolState {
        match val {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::StopRequested,
            3 => PoolState::Stopped,
            _ => panic!("unexpected state value"),
        }
    }
}

fn is_valid_transition(from: PoolState, to: PoolState) -> bool {
    match from {
        PoolState::Created => {
            to == PoolState::Running || to == PoolState::StopRequested || to == PoolState::Stopped
        }
        PoolState::Running => to == PoolState::StopRequested,
        PoolState::StopRequested => to == PoolState::Stopped,
        PoolState::Stopped => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_created() {
        assert_eq!(PoolState::Created, AtomicState::new().read());
    }

    #[test]
    fn forward_path() {
        let state = AtomicState::new();

        assert!(state.try_transition(PoolState::Running));
        assert!(state.try_transition(PoolState::StopRequested));
        assert!(state.try_transition(PoolState::Stopped));
        assert_eq!(PoolState::Stopped, state.read());
    }

    #[test]
    fn short_circuit_from_created() {
        let state = AtomicState::new();
        assert!(state.try_transition(PoolState::Stopped));

        let state = AtomicState::new();
        assert!(state.try_transition(PoolState::StopRequested));
        assert!(state.try_transition(PoolState::Stopped));
    }

    #[test]
    fn no_backward_moves() {
        let state = AtomicState::new();
        assert!(state.try_transition(PoolState::Running));

        assert!(!state.try_transition(PoolState::Created));
        assert!(state.try_transition(PoolState::StopRequested));
        assert!(!state.try_transition(PoolState::Running));
        assert!(state.try_transition(PoolState::Stopped));
        assert!(!state.try_transition(PoolState::StopRequested));
        assert!(!state.try_transition(PoolState::Stopped));
    }

    #[test]
    fn running_cannot_skip_to_stopped() {
        let state = AtomicState::new();
        assert!(state.try_transition(PoolState::Running));
        assert!(!state.try_transition(PoolState::Stopped));
    }
}
