// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker parking.
//!
//! [`Signal`] is a counting permit primitive (the portable rendition of a
//! semaphore) and [`ParkingLot`] layers the executor park/wake protocol on
//! top of it. The protocol invariant:
//!
//! - a producer that adds work and observes `parked > 0` CAS-decrements the
//!   counter and posts exactly one permit;
//! - a worker entering the protected sleep region increments the counter
//!   *first*, then re-checks the queue snapshot and self-wakes on observed
//!   backlog, then waits.
//!
//! The increment-snapshot-wait order is load-bearing: inverting it lets a
//! producer observe `parked == 0` while the worker is already committed to
//! sleeping, stranding a task.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::loom::sync::{Condvar, Mutex};
use core::time::Duration;

/// A counting signal: `notify` posts a permit, `wait` consumes one, sleeping
/// until a permit is available.
#[derive(Debug)]
pub(crate) struct Signal {
    permits: Mutex<usize>,
    cv: Condvar,
}

/// Outcome of a timed park.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ParkTimeout {
    /// A permit arrived within the timeout.
    Woken,
    /// The wait timed out, but a producer had already claimed this worker's
    /// park slot; a permit is in flight and the worker should re-check for
    /// work rather than retire.
    Claimed,
    /// The wait timed out and the park slot was withdrawn.
    TimedOut,
}

/// The executor park/wake protocol over an atomic park counter and a
/// [`Signal`].
#[derive(Debug)]
pub(crate) struct ParkingLot {
    parked: AtomicUsize,
    signal: Signal,
}

// === impl Signal ===

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Waits for a permit for at most `timeout`. Returns `true` when a
    /// permit was consumed and `false` on timeout.
    #[cfg(not(loom))]
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            let now = std::time::Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return false;
            };
            let (guard, _timed_out) = self.cv.wait_timeout(permits, remaining).unwrap();
            permits = guard;
        }
        *permits -= 1;
        true
    }

    // loom has no clock; a timed wait degrades to an untimed one in models.
    #[cfg(loom)]
    pub(crate) fn wait_timeout(&self, _timeout: Duration) -> bool {
        self.wait();
        true
    }
}

// === impl ParkingLot ===

impl ParkingLot {
    pub(crate) fn new() -> Self {
        Self {
            parked: AtomicUsize::new(0),
            signal: Signal::new(),
        }
    }

    /// Number of workers currently inside the protected sleep region.
    pub(crate) fn num_parked(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    /// Claims one parked worker and posts a permit for it. Returns `false`
    /// when no worker is parked (some worker is still running and will see
    /// new work before it parks).
    pub(crate) fn wake_one(&self) -> bool {
        loop {
            let parked = self.parked.load(Ordering::Acquire);
            if parked == 0 {
                return false;
            }
            if self
                .parked
                .compare_exchange(parked, parked - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.signal.notify();
                return true;
            }
        }
    }

    pub(crate) fn wake_all(&self) {
        while self.wake_one() {}
    }

    /// Parks the calling worker until a producer wakes it.
    ///
    /// `backlog` is the queue snapshot: when it observes pending work after
    /// the counter increment, a producer may have missed this worker going
    /// to sleep, so one wake (possibly of this very worker) is issued before
    /// waiting.
    pub(crate) fn park(&self, backlog: impl FnOnce() -> bool) {
        self.parked.fetch_add(1, Ordering::AcqRel);
        if backlog() {
            self.wake_one();
        }
        // the wait happens regardless of the snapshot; the self-wake above
        // already posted a permit for the positive case
        self.signal.wait();
    }

    /// Timed variant of [`park`][Self::park] used by lingering pool workers.
    pub(crate) fn park_timeout(
        &self,
        backlog: impl FnOnce() -> bool,
        timeout: Duration,
    ) -> ParkTimeout {
        self.parked.fetch_add(1, Ordering::AcqRel);
        if backlog() {
            self.wake_one();
        }
        if self.signal.wait_timeout(timeout) {
            return ParkTimeout::Woken;
        }
        // withdraw the park slot, unless a producer claimed it in the
        // meantime (the matching permit will satisfy the next wait)
        loop {
            let parked = self.parked.load(Ordering::Acquire);
            if parked == 0 {
                return ParkTimeout::Claimed;
            }
            if self
                .parked
                .compare_exchange(parked, parked - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return ParkTimeout::TimedOut;
            }
        }
    }
}
