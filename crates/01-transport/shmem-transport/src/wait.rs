//! Atomic wait/notify shims used by the worker wake signals.
//!
//! Native targets park on the `atomic-wait` crate (futex-backed where
//! available). Loom builds replace parking with a scheduler yield so the
//! model checker can explore every interleaving of the wait loops.

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{AtomicU32, Ordering};

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller parked and was woken (or woke spuriously).
    Ok,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
}

#[cfg(feature = "loom")]
mod imp {
    use super::{AtomicU32, Ordering, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        if atomic.load(Ordering::Acquire) != expected {
            return WaitResult::NotEqual;
        }
        loom::thread::yield_now();
        WaitResult::Ok
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        let _ = atomic;
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        let _ = atomic;
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use super::{AtomicU32, Ordering, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        if atomic.load(Ordering::Acquire) != expected {
            return WaitResult::NotEqual;
        }
        atomic_wait::wait(atomic, expected);
        WaitResult::Ok
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        atomic_wait::wake_one(atomic as *const AtomicU32);
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

/// Blocks the current caller until the atomic differs from `expected` or a wakeup occurs.
#[inline]
pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    imp::wait_u32(atomic, expected)
}

/// Wakes at most one waiter parked on `atomic`.
#[inline]
pub(crate) fn wake_one(atomic: &AtomicU32) {
    imp::wake_one(atomic)
}

/// Wakes all waiters parked on `atomic`.
#[inline]
pub(crate) fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}
