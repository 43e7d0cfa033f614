//! Per-transaction, per-cell staged-write storage.
//!
//! Split out of `Cell` into its own type so it is independently testable, per
//! the component table in spec §2. Grounded on the teacher's `InnerVarCopy`
//! (`rlu/src/var.rs`), which plays the same "side buffer for a pending write"
//! role inside a single RLU thread context; generalized here to be keyed by
//! thread id rather than embedded directly in a per-thread context struct,
//! since a `Cell<T>` (unlike the teacher's `RLUVar<T>`) is the one place that
//! already knows `T`.
//!
//! Each staged entry carries the *basis stamp* — the read stamp in effect
//! when the write was staged — alongside the value, not just the value
//! itself. A plain transaction-wide read stamp would be wrong for cells
//! touched during isolated commute execution (§4.5), which run against a
//! forward-dated read stamp taken at isolation-start, not the main body's
//! snapshot; carrying the basis with the value lets `Cell::can_commit`
//! validate each staged cell against the stamp it was actually staged
//! against.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use crate::sync::Mutex;

#[derive(Debug)]
pub(crate) struct LocalSlot<T> {
    staged: Mutex<HashMap<ThreadId, (T, u64)>>,
}

impl<T> Default for LocalSlot<T> {
    fn default() -> Self {
        Self {
            staged: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> LocalSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The staged value for the current thread, if any.
    pub fn get(&self) -> Option<T> {
        self.staged
            .lock()
            .expect("local slot poisoned")
            .get(&thread::current().id())
            .map(|(value, _)| value.clone())
    }

    /// The basis stamp the staged value was computed against.
    pub fn basis(&self) -> Option<u64> {
        self.staged
            .lock()
            .expect("local slot poisoned")
            .get(&thread::current().id())
            .map(|(_, basis)| *basis)
    }

    pub fn contains(&self) -> bool {
        self.staged
            .lock()
            .expect("local slot poisoned")
            .contains_key(&thread::current().id())
    }

    pub fn set(&self, value: T, basis: u64) {
        self.staged
            .lock()
            .expect("local slot poisoned")
            .insert(thread::current().id(), (value, basis));
    }

    /// Removes and returns the staged `(value, basis)` for the current
    /// thread, clearing the slot.
    pub fn take(&self) -> Option<(T, u64)> {
        self.staged
            .lock()
            .expect("local slot poisoned")
            .remove(&thread::current().id())
    }

    pub fn clear(&self) {
        self.staged
            .lock()
            .expect("local slot poisoned")
            .remove(&thread::current().id());
    }
}
