//! `TMap<K, V>` — a transactional key→value mapping, the exemplar container
//! called for by spec §4.8: it exercises every cell contract (enlistment,
//! commute, `get_old`, owner tags) rather than introducing a new one.
//!
//! Grounded on the teacher's `SharedValue`-backed fixtures
//! (`stm/src/stm/shared_value.rs`, exercised by `stm/tests/test_stm.rs`'s
//! `SharedHashSetOfString` transactions) — a transactional collection built
//! directly on the same cell primitives, generalized here from a single
//! whole-collection cell to a real per-key version chain plus a commuted
//! count, per spec §4.8.

use std::collections::HashMap;
use std::hash::Hash;

use crate::cell::Cell;
use crate::error::Result;
use crate::sync::Mutex;

struct Inner<K, V> {
    slots: Mutex<HashMap<K, Cell<Option<V>>>>,
    count: Cell<i64>,
}

/// A transactional map. Missing keys are represented by a cell holding
/// `None` rather than by the key's absence from the backing map, so
/// deletions (and insertions of a key that was never seen before) are
/// MVCC-visible through the same version-chain machinery as any other cell.
pub struct TMap<K, V> {
    inner: std::sync::Arc<Inner<K, V>>,
}

impl<K, V> Clone for TMap<K, V> {
    fn clone(&self) -> Self {
        TMap { inner: self.inner.clone() }
    }
}

impl<K, V> Default for TMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let count = Cell::new(0i64);
        TMap {
            inner: std::sync::Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                count,
            }),
        }
    }

    /// Returns the per-key cell, creating a fresh sentinel-`None` one under
    /// the structural lock on first touch and grouping it under the map's
    /// count cell as its owner tag — so a subscription depending on "this
    /// map" fires for a change to any key, not just the count.
    fn cell_for(&self, key: &K) -> Cell<Option<V>> {
        if let Some(cell) = self.inner.slots.lock().expect("map poisoned").get(key) {
            return cell.clone();
        }
        let mut slots = self.inner.slots.lock().expect("map poisoned");
        slots
            .entry(key.clone())
            .or_insert_with(|| {
                let cell = Cell::new(None);
                cell.set_owner_tag(self.inner.count.id());
                cell
            })
            .clone()
    }

    /// Current value for `key`, or `None` if absent. Enlists the per-key
    /// cell as a read.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.cell_for(key).get()
    }

    /// The value at `key` as of the transaction's read stamp, ignoring any
    /// staged write this transaction made to it.
    pub fn get_old(&self, key: &K) -> Result<Option<V>> {
        self.cell_for(key).get_old()
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts `value` at `key`, returning the previous value if any. The
    /// count cell is commuted (not directly written) only when the key
    /// transitions from absent to present, so concurrent inserts of
    /// different keys never conflict with each other.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        let cell = self.cell_for(&key);
        let previous = cell.get()?;
        cell.set(Some(value))?;
        if previous.is_none() {
            self.inner.count.commute(|c| *c += 1)?;
        }
        Ok(previous)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let cell = self.cell_for(key);
        let previous = cell.get()?;
        if previous.is_some() {
            cell.set(None)?;
            self.inner.count.commute(|c| *c -= 1)?;
        }
        Ok(previous)
    }

    /// Number of present keys. Reading this forces a conflict with any
    /// concurrent insert/remove, exactly like reading any other cell.
    pub fn count(&self) -> Result<i64> {
        self.inner.count.get()
    }

    /// A consistent snapshot of every present entry. Reads the count first
    /// (per spec §4.8 "Enumeration reads the count... to force a conflict
    /// with any concurrent structural change") before walking the backing
    /// map and overlaying each key's per-transaction staged write.
    pub fn snapshot(&self) -> Result<Vec<(K, V)>> {
        let _ = self.inner.count.get()?;
        let slots = self.inner.slots.lock().expect("map poisoned");
        let mut out = Vec::with_capacity(slots.len());
        for (key, cell) in slots.iter() {
            if let Some(value) = cell.get()? {
                out.push((key.clone(), value));
            }
        }
        Ok(out)
    }
}
