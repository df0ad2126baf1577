//! Real-time clock and cooperative cancellation
//!
//! The scheduler measures register I/O and sleeps out wait windows through
//! the [`Clock`] trait so playback runs unchanged against the wall clock or
//! a [`VirtualClock`] under test. Sleeps are interruptible by a
//! [`StopSignal`].

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative stop request shared between a session and its controller
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Create a signal in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake any sleeper
    pub fn stop(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock() = true;
        wake.notify_all();
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Clear a previous stop request
    pub fn reset(&self) {
        *self.inner.0.lock() = false;
    }

    /// Block for up to `timeout`, returning early on a stop request
    ///
    /// Returns `true` when a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock();
        while !*stopped {
            if wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Microsecond time source with an interruptible sleep
pub trait Clock {
    /// Microseconds since an arbitrary fixed origin
    fn now_micros(&self) -> u64;

    /// Sleep until `deadline` (in [`Clock::now_micros`] units)
    ///
    /// Returns `false` when the sleep was cut short by `stop`.
    fn sleep_until(&self, deadline: u64, stop: &StopSignal) -> bool;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a clock at zero
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep_until(&self, deadline: u64, stop: &StopSignal) -> bool {
        let now = self.now_micros();
        if deadline <= now {
            return !stop.is_stopped();
        }
        !stop.wait_timeout(Duration::from_micros(deadline - now))
    }
}

/// Manually driven clock
///
/// Sleeping jumps straight to the deadline. Clones share the same time, so
/// a simulated device can charge transfer time to the clock the scheduler
/// reads.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: Arc<AtomicU64>,
    slept: Arc<AtomicU64>,
}

impl VirtualClock {
    /// Create a clock at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }

    /// Total time spent in [`Clock::sleep_until`]
    pub fn slept_micros(&self) -> u64 {
        self.slept.load(Ordering::SeqCst)
    }
}

impl Clock for VirtualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_until(&self, deadline: u64, stop: &StopSignal) -> bool {
        if stop.is_stopped() {
            return false;
        }
        let now = self.now_micros();
        if deadline > now {
            self.now.store(deadline, Ordering::SeqCst);
            self.slept.fetch_add(deadline - now, Ordering::SeqCst);
        }
        true
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_micros(&self) -> u64 {
        (**self).now_micros()
    }

    fn sleep_until(&self, deadline: u64, stop: &StopSignal) -> bool {
        (**self).sleep_until(deadline, stop)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_micros(&self) -> u64 {
        (**self).now_micros()
    }

    fn sleep_until(&self, deadline: u64, stop: &StopSignal) -> bool {
        (**self).sleep_until(deadline, stop)
    }
}
