//! Bounded busy-wait used by the in-place handshakes.
//!
//! Every poll is preceded by a full fence so each iteration observes the
//! peer's latest stores, the way the firmware issues a memory barrier per
//! loop. The wait gives up after a poll count or a wall-clock timeout,
//! whichever comes first.

use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use crate::{TransportError, TransportResult};

/// Limits for one [`spin_until`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpinBudget {
    pub max_polls: u64,
    pub timeout: Duration,
}

impl Default for SpinBudget {
    fn default() -> Self {
        Self {
            max_polls: u64::MAX,
            timeout: Duration::from_secs(1),
        }
    }
}

impl SpinBudget {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Verdict of one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpinStep<T> {
    Done(T),
    Continue,
    /// The observed value is outside the protocol; stop immediately.
    Abort(u32),
}

const YIELD_EVERY: u64 = 256;
const CLOCK_EVERY: u64 = 64;

/// Polls `check` until it returns `Done` or `Abort`, or the budget runs out.
pub fn spin_until<T>(budget: &SpinBudget, mut check: impl FnMut() -> SpinStep<T>) -> TransportResult<T> {
    let started = Instant::now();
    let mut polls: u64 = 0;
    loop {
        fence(Ordering::SeqCst);
        match check() {
            SpinStep::Done(value) => return Ok(value),
            SpinStep::Abort(value) => return Err(TransportError::UnexpectedState { value }),
            SpinStep::Continue => {}
        }

        polls += 1;
        if polls >= budget.max_polls
            || (polls % CLOCK_EVERY == 0 && started.elapsed() >= budget.timeout)
        {
            return Err(TransportError::SpinTimeout { polls });
        }
        if polls % YIELD_EVERY == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}
