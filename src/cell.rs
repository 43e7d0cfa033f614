//! The transactional cell: a versioned container for a single value, and the
//! atomic unit of transactional state.
//!
//! Grounded on `stm/src/rlu/stm/mod.rs`'s `TVar`/`Transaction::load`/`store`/
//! `commit` validate-lock-commit shape, generalized from "one current value
//! behind a lock" to a full version chain per spec §3 invariants I1–I2: the
//! teacher keeps no history (a committed write simply overwrites the one
//! slot), whereas a `Cell<T>` here keeps every version a live reader might
//! still need and only drops a tail node once `trim` proves nothing can
//! reach past it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use log::trace;

use crate::commute::{self, CommuteRecord};
use crate::context;
use crate::error::{Result, TxError};
use crate::local::LocalSlot;
use crate::locker::{ParkPolicy, StampLocker};
use crate::sync::Mutex;
use crate::write_stamp::WriteStamp;

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

fn next_cell_id() -> u64 {
    NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed)
}

struct Node<T> {
    stamp: u64,
    value: T,
    older: Option<Arc<Node<T>>>,
}

/// The object-safe face of a [`Cell<T>`]: everything the transaction context
/// and commit coordinator need from an enlisted cell without knowing `T`.
pub(crate) trait EnlistedCell: Send + Sync {
    fn id(&self) -> u64;
    fn owner_tag(&self) -> u64;
    fn has_staged(&self) -> bool;
    /// §4.4 `can_commit`: succeeds iff unlocked and the cell's staged basis
    /// stamp is still at or ahead of the head. Installs the write stamp on
    /// success.
    fn try_lock_for_commit(&self, owner: ThreadId) -> bool;
    fn set_pending_version(&self, version: u64);
    fn publish(&self, version: u64);
    fn rollback(&self);
    fn wait_for_unlock(&self, read_stamp: u64, policy: &ParkPolicy);
    fn trim(&self, horizon: u64);
}

struct CellInner<T> {
    id: u64,
    owner_tag: Mutex<u64>,
    chain: Mutex<Arc<Node<T>>>,
    stamp: Mutex<Option<WriteStamp>>,
    locker: StampLocker,
    local: LocalSlot<T>,
}

/// A versioned container for a single shared value — the atomic unit of
/// transactional state.
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Cell { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + Sync + 'static> Cell<T> {
    /// Creates a new cell holding `value`, stamped at the current clock.
    pub fn new(value: T) -> Self {
        let stamp = crate::commit::CLOCK.current();
        let id = next_cell_id();
        Cell {
            inner: Arc::new(CellInner {
                id,
                owner_tag: Mutex::new(id),
                chain: Mutex::new(Arc::new(Node { stamp, value, older: None })),
                stamp: Mutex::new(None),
                locker: StampLocker::new(),
                local: LocalSlot::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Groups this cell under another cell's (or a synthetic) owner identity
    /// for subscription/pre-commit dependency reporting — used by containers
    /// that want all their internal cells to read as one logical field.
    pub fn set_owner_tag(&self, tag: u64) {
        *self.inner.owner_tag.lock().expect("cell poisoned") = tag;
    }

    pub fn owner_tag(&self) -> u64 {
        *self.inner.owner_tag.lock().expect("cell poisoned")
    }

    fn as_enlisted(&self) -> Arc<dyn EnlistedCell> {
        self.inner.clone()
    }

    /// Enlists this cell in the active transaction if not already enlisted,
    /// running commute degeneration on first touch. No-op outside a
    /// transaction.
    fn enlist(&self) -> Result<()> {
        let first_touch = context::with_context(|ctx| {
            if let Some(only) = ctx.block_enlist {
                if only != self.inner.id {
                    return Err(TxError::ContextForbidden);
                }
            }
            let first_touch = !ctx.enlisted.contains_key(&self.inner.id) || ctx.enforce_tracking;
            if first_touch {
                let enlisted = self.as_enlisted();
                ctx.record_enlist(self.inner.id, enlisted);
            }
            Ok(first_touch)
        })?;

        if first_touch {
            commute::degenerate_on_enlist(self.inner.id)?;
        }
        Ok(())
    }

    fn head(&self) -> Arc<Node<T>> {
        self.inner.chain.lock().expect("cell poisoned").clone()
    }

    fn read_chain_at(&self, stamp: u64) -> T {
        let mut node = self.head();
        loop {
            if node.stamp <= stamp {
                return node.value.clone();
            }
            node = node
                .older
                .clone()
                .expect("version chain exhausted before reaching a node at or below the read stamp");
        }
    }

    /// Returns the current value. Outside a transaction this is a single
    /// atomic snapshot read of the head; inside one, it enlists as a read and
    /// observes the transaction's consistent snapshot (or its own staged
    /// write, unless `read_old_state` is active).
    pub fn get(&self) -> Result<T> {
        if !context::is_in_transaction() {
            return Ok(self.head().value.clone());
        }
        self.enlist()?;
        let (read_stamp, reading_old_state, staged) =
            context::with_context(|ctx| (ctx.read_stamp, ctx.reading_old_state, self.inner.local.get()));

        if reading_old_state {
            self.inner.wait_for_unlock(read_stamp, &crate::commit::park_policy());
            return Ok(self.read_chain_at(read_stamp));
        }
        if let Some(value) = staged {
            if self.head().stamp > read_stamp {
                return Err(TxError::WritableReadCollision);
            }
            return Ok(value);
        }
        // §4.3: a lock whose version is still <= our read stamp hasn't
        // published yet; the value we'd otherwise read is stale relative to
        // the snapshot we promised, so park until it clears.
        self.inner.wait_for_unlock(read_stamp, &crate::commit::park_policy());
        Ok(self.read_chain_at(read_stamp))
    }

    /// Always returns the value as of the transaction's read stamp, ignoring
    /// any staged write.
    pub fn get_old(&self) -> Result<T> {
        if !context::is_in_transaction() {
            return Err(TxError::NotInTransaction);
        }
        self.enlist()?;
        let read_stamp = context::with_context(|ctx| ctx.read_stamp);
        self.inner.wait_for_unlock(read_stamp, &crate::commit::park_policy());
        Ok(self.read_chain_at(read_stamp))
    }

    /// Number of version-chain nodes currently reachable from the head.
    /// Diagnostic only (§8 P9 / E6 "trim progress") — not required for any
    /// cell operation's correctness.
    pub fn chain_len(&self) -> usize {
        let mut node = self.head();
        let mut len = 1;
        while let Some(older) = node.older.clone() {
            len += 1;
            node = older;
        }
        len
    }

    /// Stages `value` as this cell's next committed value.
    pub fn set(&self, value: T) -> Result<()> {
        if !context::is_in_transaction() {
            return Err(TxError::NotInTransaction);
        }
        self.enlist()?;
        let read_stamp = context::with_context(|ctx| ctx.read_stamp);
        // §4.4 "Enlistment": a writer that finds the cell locked by another
        // transaction whose version is still <= its own read stamp parks
        // until that writer releases, rather than staging against a basis
        // that is about to be superseded.
        self.inner.wait_for_unlock(read_stamp, &crate::commit::park_policy());
        context::with_context(|ctx| {
            if self.head().stamp > ctx.read_stamp {
                return Err(TxError::WriteCollision);
            }
            self.inner.local.set(value, ctx.read_stamp);
            ctx.has_changes = true;
            Ok(())
        })
    }

    /// As `set`, but mutates the current (or already-staged) value in place
    /// rather than requiring the caller to reconstruct it.
    pub fn modify(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        if !context::is_in_transaction() {
            return Err(TxError::NotInTransaction);
        }
        self.enlist()?;
        let read_stamp = context::with_context(|ctx| ctx.read_stamp);
        self.inner.wait_for_unlock(read_stamp, &crate::commit::park_policy());
        context::with_context(|ctx| {
            if self.head().stamp > ctx.read_stamp {
                return Err(TxError::WriteCollision);
            }
            let mut value = match self.inner.local.get() {
                Some(v) => v,
                None => self.read_chain_at(ctx.read_stamp),
            };
            f(&mut value);
            self.inner.local.set(value, ctx.read_stamp);
            ctx.has_changes = true;
            Ok(())
        })
    }

    /// Enqueues a deferred commutative write (§4.5). `f` runs at most once,
    /// either degenerated in-transaction (if something else touches this
    /// cell first) or isolated at commit time.
    pub fn commute(&self, f: impl FnOnce(&mut T) + Send + 'static) -> Result<()> {
        if !context::is_in_transaction() {
            return Err(TxError::NotInTransaction);
        }
        let cell = self.clone();
        let mut f = Some(f);
        let action: Box<dyn FnOnce() -> Result<()> + Send> = Box::new(move || {
            let f = f.take().expect("commute action invoked twice");
            cell.modify(f)
        });
        context::with_context(|ctx| {
            let mut affecting = HashSet::new();
            affecting.insert(self.inner.id);
            ctx.commutes.push(CommuteRecord::new(affecting, action));
            ctx.has_changes = true;
        });
        Ok(())
    }

    /// As `commute`, but `f`'s body may touch only this cell: while it runs
    /// (degenerated in-transaction or isolated at commit time), enlisting any
    /// other cell fails with [`TxError::ContextForbidden`] (§4.5 "strict
    /// commutes").
    pub fn commute_strict(&self, f: impl FnOnce(&mut T) + Send + 'static) -> Result<()> {
        if !context::is_in_transaction() {
            return Err(TxError::NotInTransaction);
        }
        let cell = self.clone();
        let id = self.inner.id;
        let mut f = Some(f);
        let action: Box<dyn FnOnce() -> Result<()> + Send> = Box::new(move || {
            let f = f.take().expect("commute action invoked twice");
            context::with_context(|ctx| ctx.block_enlist = Some(id));
            let result = cell.modify(f);
            context::with_context(|ctx| ctx.block_enlist = None);
            result
        });
        context::with_context(|ctx| {
            let mut affecting = HashSet::new();
            affecting.insert(id);
            ctx.commutes.push(CommuteRecord::new(affecting, action));
            ctx.has_changes = true;
        });
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> EnlistedCell for CellInner<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn owner_tag(&self) -> u64 {
        *self.owner_tag.lock().expect("cell poisoned")
    }

    fn has_staged(&self) -> bool {
        self.local.contains()
    }

    fn try_lock_for_commit(&self, owner: ThreadId) -> bool {
        let mut stamp_guard = self.stamp.lock().expect("cell poisoned");
        if stamp_guard.is_some() {
            return false;
        }
        let basis = match self.local.basis() {
            Some(basis) => basis,
            None => return true,
        };
        let head_stamp = self.chain.lock().expect("cell poisoned").stamp;
        if head_stamp > basis {
            return false;
        }
        *stamp_guard = Some(WriteStamp::new_owned_by(owner));
        true
    }

    fn set_pending_version(&self, version: u64) {
        let mut stamp_guard = self.stamp.lock().expect("cell poisoned");
        if let Some(ws) = stamp_guard.as_mut() {
            ws.set_version(version);
        }
    }

    fn publish(&self, version: u64) {
        if let Some((value, _basis)) = self.local.take() {
            let mut chain = self.chain.lock().expect("cell poisoned");
            let older = chain.clone();
            *chain = Arc::new(Node { stamp: version, value, older: Some(older) });
        }
        *self.stamp.lock().expect("cell poisoned") = None;
        self.locker.release();
        trace!("cell {}: published version {}", self.id, version);
    }

    fn rollback(&self) {
        self.local.clear();
        *self.stamp.lock().expect("cell poisoned") = None;
        self.locker.release();
    }

    fn wait_for_unlock(&self, read_stamp: u64, policy: &ParkPolicy) {
        self.locker.wait_until(policy, || {
            let stamp_guard = self.stamp.lock().expect("cell poisoned");
            match stamp_guard.as_ref() {
                None => true,
                Some(ws) => match ws.version() {
                    None => false,
                    Some(v) => v > read_stamp,
                },
            }
        });
    }

    fn trim(&self, horizon: u64) {
        let mut chain = self.chain.lock().expect("cell poisoned");
        let mut node = chain.clone();
        while node.stamp > horizon {
            match &node.older {
                Some(older) => node = older.clone(),
                None => return,
            }
        }
        // `node` is the newest entry with stamp <= horizon; detach its tail.
        if node.older.is_some() {
            let trimmed = Arc::new(Node { stamp: node.stamp, value: node.value.clone(), older: None });
            if Arc::ptr_eq(&node, &chain) {
                *chain = trimmed;
            } else {
                // Rebuild the path from head down to `node` with the new tail
                // spliced in, preserving every node above the horizon.
                let mut frames = Vec::new();
                let mut cursor = chain.clone();
                while !Arc::ptr_eq(&cursor, &node) {
                    frames.push((cursor.stamp, cursor.value.clone()));
                    cursor = cursor.older.clone().expect("trim walked off the chain");
                }
                let mut rebuilt = trimmed;
                for (stamp, value) in frames.into_iter().rev() {
                    rebuilt = Arc::new(Node { stamp, value, older: Some(rebuilt) });
                }
                *chain = rebuilt;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::run_result;

    #[test]
    fn get_outside_transaction_reads_head() {
        let cell = Cell::new(10);
        assert_eq!(cell.get().unwrap(), 10);
    }

    #[test]
    fn set_outside_transaction_is_rejected() {
        let cell = Cell::new(10);
        assert!(matches!(cell.set(1), Err(TxError::NotInTransaction)));
    }

    #[test]
    fn set_then_commit_publishes_new_head() {
        let cell = Cell::new(10);
        let c = cell.clone();
        run_result(move || c.set(20)).unwrap();
        assert_eq!(cell.get().unwrap(), 20);
    }

    #[test]
    fn modify_mutates_in_place() {
        let cell = Cell::new(10);
        let c = cell.clone();
        run_result(move || c.modify(|v| *v += 5)).unwrap();
        assert_eq!(cell.get().unwrap(), 15);
    }

    #[test]
    fn get_old_ignores_staged_write() {
        let cell = Cell::new(10);
        let c = cell.clone();
        let (old, new) = run_result(move || {
            c.set(99)?;
            let old = c.get_old()?;
            let new = c.get()?;
            Ok((old, new))
        })
        .unwrap();
        assert_eq!(old, 10);
        assert_eq!(new, 99);
    }

    #[test]
    fn commute_strict_forbids_touching_other_cells() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let counter = Cell::new(0);
        let other = Cell::new(0);
        let saw_forbidden = Arc::new(AtomicBool::new(false));

        let c = counter.clone();
        let o = other.clone();
        let flag = saw_forbidden.clone();
        run_result(move || {
            let o = o.clone();
            let flag = flag.clone();
            c.commute_strict(move |v| {
                *v += 1;
                if matches!(o.get(), Err(TxError::ContextForbidden)) {
                    flag.store(true, Ordering::SeqCst);
                }
            })?;
            // Enlisting `counter` again forces the commute to degenerate
            // right here, inside this same transaction.
            c.get()
        })
        .unwrap();

        assert!(saw_forbidden.load(Ordering::SeqCst));
    }

    #[test]
    fn trim_drops_unreachable_tail() {
        let cell = Cell::new(1);
        for v in 2..=5 {
            let c = cell.clone();
            run_result(move || c.set(v)).unwrap();
        }
        let inner: &CellInner<i32> = &cell.inner;
        let horizon = inner.chain.lock().unwrap().stamp;
        inner.trim(horizon);
        let head = inner.chain.lock().unwrap().clone();
        assert_eq!(head.value, 5);
        assert!(head.older.is_none());
    }
}
