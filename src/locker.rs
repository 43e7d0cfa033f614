//! The stamp locker: a bounded spin followed by a park, guarding access to a
//! cell's write stamp while a committing transaction owns it.
//!
//! Grounded on `stm/src/rlu/rlu.rs::synchronize`'s spin-wait shape for the spin
//! half. The park half is new relative to the teacher, which only ever spins —
//! spec §4.2/§9 calls out unbounded spinning as an open question and asks for a
//! bounded spin before parking, so this is where the crate diverges from the
//! teacher on purpose (see DESIGN.md).

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::trace;

use crate::breaker::BusyBreaker;

/// Spin/park tuning for [`StampLocker::acquire`] and [`StampLocker::wait_until`].
#[derive(Debug, Clone)]
pub struct ParkPolicy {
    /// Number of bounded spin attempts (via [`BusyBreaker`]) before parking.
    pub spin_iterations: u32,
}

impl Default for ParkPolicy {
    fn default() -> Self {
        // Matches the teacher's `BusyBreaker` default of 7 exponential shifts.
        Self { spin_iterations: 7 }
    }
}

/// A mutual-exclusion gate for a single cell's write stamp.
///
/// Unlike a plain `Mutex`, callers can wait on an arbitrary predicate
/// (`wait_until`) rather than only on lock availability — this is what lets the
/// commit coordinator block until a concurrently held lock on the *same* cell
/// is released, without needing to know which thread holds it.
#[derive(Debug, Default)]
pub struct StampLocker {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl StampLocker {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Attempts to acquire the lock without blocking. Returns `true` on success.
    pub fn try_acquire(&self) -> bool {
        let mut locked = self.locked.lock().expect("stamp locker poisoned");
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    /// Acquires the lock, spinning up to `policy.spin_iterations` times before
    /// parking on the condition variable.
    pub fn acquire(&self, policy: &ParkPolicy) {
        if self.try_acquire() {
            return;
        }

        let breaker = BusyBreaker::new(policy.spin_iterations as usize);
        while breaker.spin() {
            if self.try_acquire() {
                return;
            }
        }

        trace!("stamp locker: spin budget exhausted, parking");
        let mut locked = self.locked.lock().expect("stamp locker poisoned");
        while *locked {
            locked = self
                .cond
                .wait_timeout(locked, Duration::from_millis(50))
                .expect("stamp locker poisoned")
                .0;
        }
        *locked = true;
    }

    /// Releases the lock and wakes any parked waiters.
    pub fn release(&self) {
        let mut locked = self.locked.lock().expect("stamp locker poisoned");
        *locked = false;
        drop(locked);
        self.cond.notify_all();
    }

    /// Blocks until `pred` returns `true`, spinning first and parking once the
    /// spin budget is exhausted. `pred` is re-evaluated after every wake.
    ///
    /// Unlike `acquire`, this does not itself take the lock — it is used by the
    /// commit coordinator to wait for *another* thread's write stamp to clear
    /// before proceeding with validation.
    pub fn wait_until<F: FnMut() -> bool>(&self, policy: &ParkPolicy, mut pred: F) {
        if pred() {
            return;
        }

        let breaker = BusyBreaker::new(policy.spin_iterations as usize);
        while breaker.spin() {
            if pred() {
                return;
            }
        }

        trace!("stamp locker: wait_until parking");
        let guard = self.locked.lock().expect("stamp locker poisoned");
        let mut guard = guard;
        while !pred() {
            guard = self
                .cond
                .wait_timeout(guard, Duration::from_millis(50))
                .expect("stamp locker poisoned")
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_acquire_is_exclusive() {
        let locker = StampLocker::new();
        assert!(locker.try_acquire());
        assert!(!locker.try_acquire());
        locker.release();
        assert!(locker.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let locker = Arc::new(StampLocker::new());
        assert!(locker.try_acquire());

        let other = locker.clone();
        let handle = thread::spawn(move || {
            other.acquire(&ParkPolicy { spin_iterations: 2 });
            other.release();
        });

        thread::sleep(Duration::from_millis(20));
        locker.release();
        handle.join().unwrap();
    }

    #[test]
    fn wait_until_observes_external_flag() {
        let locker = Arc::new(StampLocker::new());
        let flag = Arc::new(Mutex::new(false));

        let f = flag.clone();
        let l = locker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            *f.lock().unwrap() = true;
            l.cond.notify_all();
        });

        locker.wait_until(&ParkPolicy { spin_iterations: 2 }, || *flag.lock().unwrap());
        handle.join().unwrap();
        assert!(*flag.lock().unwrap());
    }
}
