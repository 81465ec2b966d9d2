//! Counting gate bounding the number of iterations in flight.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Blocks [`Throttle::acquire`] while `limit` permits are outstanding.
#[derive(Debug)]
pub struct Throttle {
    limit: usize,
    in_flight: Mutex<usize>,
    released: Condvar,
}

/// Held by a running iteration; returns its slot when dropped.
#[derive(Debug)]
pub struct Permit<'a> {
    throttle: &'a Throttle,
}

impl Throttle {
    /// `limit` is clamped to at least one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        *self.lock()
    }

    /// Wait until fewer than `limit` permits are outstanding, then take one.
    pub fn acquire(&self) -> Permit<'_> {
        let mut in_flight = self.lock();
        while *in_flight >= self.limit {
            debug!(in_flight = *in_flight, limit = self.limit, "throttle full, waiting");
            in_flight = self
                .released
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *in_flight += 1;
        Permit { throttle: self }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.throttle.lock();
        *in_flight = in_flight.saturating_sub(1);
        self.throttle.released.notify_all();
    }
}
