//! Tracks which read stamps are currently in use by live transactions, so
//! that the commit coordinator can compute a trim horizon (§4.1) and cells
//! can safely drop version-chain nodes older than any live reader.
//!
//! New relative to the teacher repo — none of the retrieved `stm`/`rlu`
//! sources keep a version history long enough to need trimming (they only
//! ever hold the latest value), so this module is built directly from
//! spec §3 "Version list entry" / §4.1, using the same `Mutex<BTreeMap<..>>`
//! idiom the teacher reaches for elsewhere (`stm/src/rlu/rlu.rs`'s
//! `BTreeMap`-backed `Tx`/log types) rather than inventing a new shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use crate::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    // stamp -> number of live transactions holding it as their read stamp.
    refcounts: Mutex<BTreeMap<u64, u32>>,
}

/// Registry of read stamps currently held open by live transactions.
#[derive(Debug, Default, Clone)]
pub struct VersionList {
    inner: Arc<Inner>,
}

impl VersionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stamp` as in use and returns an RAII ticket that releases
    /// it on drop.
    pub fn open(&self, stamp: u64) -> ReadTicket {
        let mut map = self.inner.refcounts.lock().expect("version list poisoned");
        *map.entry(stamp).or_insert(0) += 1;
        drop(map);
        ReadTicket {
            stamp,
            inner: self.inner.clone(),
        }
    }

    /// The smallest read stamp currently held by any live transaction, or
    /// `clock` if none is active — i.e. the trim horizon.
    pub fn min(&self, clock: u64) -> u64 {
        let map = self.inner.refcounts.lock().expect("version list poisoned");
        map.keys().next().copied().unwrap_or(clock)
    }

    /// Number of distinct read stamps currently held open (for
    /// introspection/stats only).
    pub fn active_len(&self) -> usize {
        self.inner.refcounts.lock().expect("version list poisoned").len()
    }
}

/// RAII handle for a read stamp registered with a [`VersionList`].
///
/// Decrements the stamp's refcount on drop, removing the entry entirely at
/// zero, per spec §4.1 "Releasing the ticket decrements the refcount; the
/// entry is removed at zero."
#[derive(Debug)]
pub struct ReadTicket {
    stamp: u64,
    inner: Arc<Inner>,
}

impl ReadTicket {
    pub fn stamp(&self) -> u64 {
        self.stamp
    }
}

impl Drop for ReadTicket {
    fn drop(&mut self) {
        let mut map = self.inner.refcounts.lock().expect("version list poisoned");
        if let Some(count) = map.get_mut(&self.stamp) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.stamp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_falls_back_to_clock_when_empty() {
        let list = VersionList::new();
        assert_eq!(list.min(42), 42);
    }

    #[test]
    fn tracks_min_active_stamp() {
        let list = VersionList::new();
        let t1 = list.open(5);
        let t2 = list.open(3);
        assert_eq!(list.min(100), 3);
        drop(t2);
        assert_eq!(list.min(100), 5);
        drop(t1);
        assert_eq!(list.min(100), 100);
    }

    #[test]
    fn refcounts_shared_stamp() {
        let list = VersionList::new();
        let a = list.open(7);
        let b = list.open(7);
        assert_eq!(list.active_len(), 1);
        drop(a);
        assert_eq!(list.min(50), 7);
        drop(b);
        assert_eq!(list.active_len(), 0);
    }
}
