// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A small circuit-breaker/busy-keeper for short spin-wait delays, carried close to
//! verbatim from the teacher's `BusyBreaker` (`rlu/src/breaker.rs`,
//! `stm/src/rlu/breaker.rs`) and reused by both the stamp locker's spin phase and
//! [`crate::RetryPolicy::RetryWithBreaker`].

use std::sync::atomic::{AtomicUsize, Ordering};

/// # BusyBreaker
/// [`BusyBreaker`] is kind of a circuit-breaker and busy keeper for short delays on
/// spin loops on the CPU.
pub struct BusyBreaker {
    max: AtomicUsize,
    unit: AtomicUsize,
}

impl Default for BusyBreaker {
    fn default() -> Self {
        // 7 shifts may be a sensible default
        Self::new(7)
    }
}

impl Clone for BusyBreaker {
    fn clone(&self) -> Self {
        Self {
            unit: AtomicUsize::new(self.unit.load(Ordering::Acquire)),
            max: AtomicUsize::new(self.max.load(Ordering::Acquire)),
        }
    }
}

impl BusyBreaker {
    /// Creates a new [`BusyBreaker`] with a configurable number of exponential trips
    /// before the breaker trips.
    pub fn new(max_trips: usize) -> Self {
        Self {
            unit: AtomicUsize::new(0),
            max: AtomicUsize::new(max_trips),
        }
    }

    /// Keeps the CPU busy but hints to the CPU to reschedule.
    ///
    /// Returns `true` while the breaker still has budget left to spin, `false` once
    /// it has tripped — the caller should fall back to parking or retrying.
    pub fn spin(&self) -> bool {
        let unit = self.unit.load(Ordering::Acquire);
        if unit <= self.max.load(Ordering::Acquire) {
            for _ in 0..(1 << unit) {
                core::hint::spin_loop();
            }
            self.unit.store(unit + 1, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Resets the breaker to zero.
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_max() {
        let breaker = BusyBreaker::new(2);
        assert!(breaker.spin());
        assert!(breaker.spin());
        assert!(breaker.spin());
        assert!(!breaker.spin());
    }

    #[test]
    fn reset_restores_budget() {
        let breaker = BusyBreaker::new(0);
        assert!(breaker.spin());
        assert!(!breaker.spin());
        breaker.reset();
        assert!(breaker.spin());
    }
}
