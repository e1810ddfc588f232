//! Coalescing wake signal shared by the interrupt path and the worker loops.
//!
//! A [`WakeSignal`] is a binary semaphore backed by a single atomic word. Any
//! number of [`WakeSignal::notify`] calls between two waits collapse into one
//! wakeup, and `notify` never blocks or allocates, so it is safe to call from
//! interrupt context.

use crate::wait::{self, AtomicU32, Ordering};

const IDLE: u32 = 0;
const PENDING: u32 = 1;
const CLOSED: u32 = 2;

/// Outcome of [`WakeSignal::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// At least one notification arrived.
    Notified,
    /// The signal was closed; the waiter should shut down.
    Closed,
}

/// Capacity-one wake primitive.
#[derive(Debug)]
pub struct WakeSignal {
    state: AtomicU32,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(IDLE),
        }
    }

    /// Marks the signal pending and wakes the waiter if it was idle.
    #[inline]
    pub fn notify(&self) {
        if self
            .state
            .compare_exchange(IDLE, PENDING, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            wait::wake_one(&self.state);
        }
    }

    /// Consumes a pending notification without blocking.
    pub fn try_take(&self) -> Option<Wake> {
        match self
            .state
            .compare_exchange(PENDING, IDLE, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => Some(Wake::Notified),
            Err(CLOSED) => Some(Wake::Closed),
            Err(_) => None,
        }
    }

    /// Blocks until a notification is pending (consuming it) or the signal closes.
    pub fn wait(&self) -> Wake {
        loop {
            if let Some(wake) = self.try_take() {
                return wake;
            }
            wait::wait_u32(&self.state, IDLE);
        }
    }

    /// Permanently wakes every current and future waiter.
    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        wait::wake_all(&self.state);
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    #[ignore]
    fn slow_loom_notify_is_never_lost() {
        loom::model(|| {
            let signal = Arc::new(WakeSignal::new());
            let notifier = Arc::clone(&signal);
            let handle = thread::spawn(move || notifier.notify());
            assert_eq!(signal.wait(), Wake::Notified);
            handle.join().unwrap();
        });
    }

    #[test]
    #[ignore]
    fn slow_loom_close_wins_over_pending_notify() {
        loom::model(|| {
            let signal = Arc::new(WakeSignal::new());
            let a = {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.notify())
            };
            let b = {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.close())
            };
            a.join().unwrap();
            b.join().unwrap();
            assert_eq!(signal.wait(), Wake::Closed);
        });
    }
}
