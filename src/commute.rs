//! Deferred commutative writes and their degeneration into ordinary,
//! in-transaction writes.
//!
//! No commute concept appears anywhere in the retrieved pack's STM-flavored
//! sources, so this module is built directly from spec §4.5 rather than
//! grounded on a specific teacher file; the closure-capturing-a-concrete-cell
//! erasure idiom it uses to stay `dyn`-free mirrors the way the rest of this
//! crate erases cell types (see `cell::EnlistedCell`) rather than reaching for
//! `dyn Any`.

use std::collections::HashSet;

use crate::context;
use crate::error::Result;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum CommuteState {
    Ok,
    Broken,
    Executed,
}

pub(crate) type CommuteAction = Box<dyn FnOnce() -> Result<()> + Send>;

pub(crate) struct CommuteRecord {
    affecting: HashSet<u64>,
    state: CommuteState,
    action: Option<CommuteAction>,
}

impl CommuteRecord {
    pub(crate) fn new(affecting: HashSet<u64>, action: CommuteAction) -> Self {
        Self {
            affecting,
            state: CommuteState::Ok,
            action: Some(action),
        }
    }

    pub(crate) fn is_ok(&self) -> bool {
        self.state == CommuteState::Ok
    }

    pub(crate) fn affecting(&self) -> &HashSet<u64> {
        &self.affecting
    }
}

/// Runs the commute-degeneration algorithm for a cell being enlisted (§4.5
/// steps 1–3).
///
/// Any commute still `Ok` that declares `cell_id` among its `affecting` set is
/// marked `Broken` and executed in list order, up to the current recursion's
/// `execution_limit`. Executed records are removed once the outermost call
/// returns.
pub(crate) fn degenerate_on_enlist(cell_id: u64) -> Result<()> {
    let (is_outermost, limit) = context::with_context(|ctx| {
        if ctx.commutes.is_empty() {
            return (false, 0usize);
        }
        for rec in ctx.commutes.iter_mut() {
            if rec.state == CommuteState::Ok && rec.affecting.contains(&cell_id) {
                rec.state = CommuteState::Broken;
            }
        }
        let outermost = ctx.commute_time.is_none();
        let limit = ctx.commute_time.unwrap_or(ctx.commutes.len());
        if outermost {
            ctx.commute_time = Some(limit);
        }
        (outermost, limit)
    });

    let mut index = 0;
    let mut outcome = Ok(());
    while index < limit {
        let action = context::with_context(|ctx| {
            if index < ctx.commutes.len() && ctx.commutes[index].state == CommuteState::Broken {
                ctx.commutes[index].action.take()
            } else {
                None
            }
        });

        if let Some(action) = action {
            match action() {
                Ok(()) => {
                    context::with_context(|ctx| {
                        if index < ctx.commutes.len() {
                            ctx.commutes[index].state = CommuteState::Executed;
                        }
                    });
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        index += 1;
    }

    if is_outermost {
        context::with_context(|ctx| {
            ctx.commute_time = None;
            ctx.commutes.retain(|rec| rec.state != CommuteState::Executed);
        });
    }

    outcome
}

/// Runs every commute still `Ok` in an isolated sub-pass, per spec §4.5
/// "isolated commit-time execution" steps 1–3. Returns the ids the isolated
/// run touched so the caller can union them back into the main enlistment
/// set and detect overlap (`InvalidCommute`).
pub(crate) fn run_remaining_isolated(fresh_read_stamp: u64) -> Result<HashSet<u64>> {
    let has_pending = context::with_context(|ctx| ctx.commutes.iter().any(CommuteRecord::is_ok));
    if !has_pending {
        return Ok(HashSet::new());
    }

    // Swap in a fresh, empty enlistment set and a forward-dated read stamp —
    // commutes always see the latest committed state, never the main body's
    // snapshot.
    let (saved_read_stamp, outer_enlisted, outer_order) = context::with_context(|ctx| {
        let saved_read_stamp = ctx.read_stamp;
        ctx.read_stamp = fresh_read_stamp;
        ctx.block_commute = true;
        ctx.enforce_tracking = true;
        let outer_enlisted = std::mem::take(&mut ctx.enlisted);
        let outer_order = std::mem::take(&mut ctx.enlist_order);
        (saved_read_stamp, outer_enlisted, outer_order)
    });

    let indices: Vec<usize> = context::with_context(|ctx| {
        (0..ctx.commutes.len())
            .filter(|&i| ctx.commutes[i].state == CommuteState::Ok)
            .collect()
    });

    let mut outcome = Ok(());
    for i in indices {
        let action = context::with_context(|ctx| ctx.commutes[i].action.take());
        if let Some(action) = action {
            match action() {
                Ok(()) => {
                    context::with_context(|ctx| ctx.commutes[i].state = CommuteState::Executed);
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
    }

    // Restore the outer enlistment set, unioned with whatever the isolated
    // pass touched (§4.5 step 3).
    let isolated_ids = context::with_context(|ctx| {
        ctx.block_commute = false;
        ctx.enforce_tracking = false;
        ctx.read_stamp = saved_read_stamp;
        let isolated_enlisted = std::mem::take(&mut ctx.enlisted);
        let isolated_order = std::mem::take(&mut ctx.enlist_order);
        ctx.enlisted = outer_enlisted;
        ctx.enlist_order = outer_order;
        for id in &isolated_order {
            if let Some(cell) = isolated_enlisted.get(id).cloned() {
                ctx.record_enlist(*id, cell);
            }
        }
        ctx.commutes.retain(|rec| rec.state != CommuteState::Executed);
        isolated_order.into_iter().collect::<HashSet<_>>()
    });

    outcome.map(|()| isolated_ids)
}
