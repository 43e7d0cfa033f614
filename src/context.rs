//! Thread-current transaction state.
//!
//! Grounded on the thread-local nesting-guard idiom in
//! `examples/other_examples/0ffa5f78_sertel-rust-stm__stm-core-src-transaction-tx.rs.rs`
//! (`thread_local! { TRANSACTION_RUNNING: Cell<bool> }`), combined with the
//! teacher's per-thread bookkeeping in `RluContext`
//! (`rlu/src/rlu.rs`/`stm/src/rlu/rlu.rs`). Unlike the teacher, which keeps one
//! `RluContext` alive for the whole thread's lifetime, a `Context` here is
//! created on transaction open and torn down on commit/rollback — closer to
//! how the sertel fork's `Transaction` is scoped per call to `atomically`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cell::EnlistedCell;
use crate::commute::CommuteRecord;
use crate::sideeffect::SideEffect;
use crate::version_list::ReadTicket;

pub(crate) struct Context {
    pub read_stamp: u64,
    pub ticket: Option<ReadTicket>,
    pub enlisted: HashMap<u64, Arc<dyn EnlistedCell>>,
    pub enlist_order: Vec<u64>,
    pub has_changes: bool,
    pub commutes: Vec<CommuteRecord>,
    pub side_effects: Vec<SideEffect>,
    pub sync_side_effects: Vec<Box<dyn FnOnce() + Send>>,
    pub write_stamp: Option<u64>,
    pub commit_check_done: bool,
    pub block_enlist: Option<u64>,
    pub block_commute: bool,
    pub enforce_tracking: bool,
    pub reading_old_state: bool,
    pub commute_time: Option<usize>,
    pub retry_requested: bool,
}

impl Context {
    pub fn new(read_stamp: u64, ticket: ReadTicket) -> Self {
        Self {
            read_stamp,
            ticket: Some(ticket),
            enlisted: HashMap::new(),
            enlist_order: Vec::new(),
            has_changes: false,
            commutes: Vec::new(),
            side_effects: Vec::new(),
            sync_side_effects: Vec::new(),
            write_stamp: None,
            commit_check_done: false,
            block_enlist: None,
            block_commute: false,
            enforce_tracking: false,
            reading_old_state: false,
            commute_time: None,
            retry_requested: false,
        }
    }

    pub fn record_enlist(&mut self, id: u64, cell: Arc<dyn EnlistedCell>) {
        if self.enlisted.insert(id, cell).is_none() {
            self.enlist_order.push(id);
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = RefCell::new(None);
}

/// `true` while the current thread has an open (possibly nested-and-flattened)
/// transaction.
pub fn is_in_transaction() -> bool {
    CONTEXT.with(|c| c.borrow().is_some())
}

/// The current transaction's read stamp, or `None` outside a transaction.
pub fn read_stamp() -> Option<u64> {
    CONTEXT.with(|c| c.borrow().as_ref().map(|ctx| ctx.read_stamp))
}

/// Installs a freshly opened context. Panics if one is already active — the
/// commit coordinator is responsible for flattening nested `run` calls before
/// ever reaching this point.
pub(crate) fn enter(ctx: Context) {
    CONTEXT.with(|c| {
        let mut slot = c.borrow_mut();
        assert!(slot.is_none(), "transaction context already active on this thread");
        *slot = Some(ctx);
    });
}

/// Tears down the active context and returns it to the caller for final
/// cleanup (releasing the read ticket, reporting staged cells, etc).
pub(crate) fn exit() -> Context {
    CONTEXT.with(|c| c.borrow_mut().take().expect("no active transaction context to exit"))
}

/// Runs `f` against the active context. Panics outside a transaction — every
/// call site here is reached only after a cell operation has already checked
/// `is_in_transaction()`.
pub(crate) fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|c| {
        let mut guard = c.borrow_mut();
        let ctx = guard.as_mut().expect("cell operation attempted outside a transaction");
        f(ctx)
    })
}
