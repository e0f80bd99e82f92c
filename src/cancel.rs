use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

/// One-shot cancellation signal shared between the pool and its worker loops.
///
/// The signal fires once and never resets; it is the sole authority for
/// "stop pulling new work". Waking any blocked waiters is the caller's
/// responsibility (the queue store exposes `interrupt_waiters` for that).
pub(crate) struct CancelSource {
    flag: Arc<AtomicBool>,
}

#[derive(Clone)]
pub(crate) struct CancelToken {
    flag: Arc<AtomicBool>,
}

// ===== impl CancelSource =====

impl CancelSource {
    pub fn new() -> CancelSource {
        CancelSource {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            flag: self.flag.clone(),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, SeqCst);
    }
}

// ===== impl CancelToken =====

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_for_all_tokens() {
        let source = CancelSource::new();
        let a = source.token();
        let b = source.token();

        assert!(!a.is_cancelled());
        source.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(source.token().is_cancelled());
    }
}
