//! Commit-time and rollback-time deferred actions.
//!
//! No single teacher file owns this concept; it follows the same
//! ordered-`Vec`-of-boxed-closures idiom this crate already uses for commutes
//! and enlistment bookkeeping (`commute::CommuteRecord`, `context::Context`)
//! rather than inventing a new shape for it.

use crate::context;
use crate::error::{Result, TxError};

/// A pair of callbacks registered via [`side_effect`]: `on_commit` runs iff
/// the transaction commits, `on_rollback` iff any attempt of it rolled back
/// (per spec §8 P7).
pub(crate) struct SideEffect {
    pub on_commit: Box<dyn FnOnce() + Send>,
    pub on_rollback: Option<Box<dyn FnOnce() + Send>>,
}

impl SideEffect {
    pub fn new(on_commit: Box<dyn FnOnce() + Send>, on_rollback: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self { on_commit, on_rollback }
    }
}

/// Queues `on_commit` to run once this transaction commits, and `on_rollback`
/// (if given) to run on every rolled-back attempt.
pub fn side_effect(
    on_commit: impl FnOnce() + Send + 'static,
    on_rollback: Option<Box<dyn FnOnce() + Send>>,
) -> Result<()> {
    if !context::is_in_transaction() {
        return Err(TxError::NotInTransaction);
    }
    context::with_context(|ctx| {
        ctx.side_effects.push(SideEffect::new(Box::new(on_commit), on_rollback));
    });
    Ok(())
}

/// Queues `cb` to run while this transaction's commit locks are still held
/// (§4.6, §4.8 — used by containers that need a consistent view of their
/// internal cells for the duration of the callback).
pub fn sync_side_effect(cb: impl FnOnce() + Send + 'static) -> Result<()> {
    if !context::is_in_transaction() {
        return Err(TxError::NotInTransaction);
    }
    context::with_context(|ctx| {
        ctx.sync_side_effects.push(Box::new(cb));
    });
    Ok(())
}
