//! Conditional transactions, pre-commit hooks, and when-committing hooks.
//!
//! No subscription concept appears anywhere in the retrieved pack; built
//! directly from spec §4.7. The copy-on-write registry follows the decision
//! recorded in DESIGN.md module 11 — a mutex-guarded `Arc` swap rather than a
//! raw CAS loop over an immutable list.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::warn;

use crate::context::{self, Context};
use crate::error::{Result, TxError, UserErrors};
use crate::sideeffect::SideEffect;
use crate::sync::Mutex;

static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed)
}

/// A snapshot of one cell this transaction touched, handed to `WhenCommitting`
/// callbacks. Commit-time hooks run after the transaction context has already
/// been torn down (see `commit::run_best_effort_hooks`), so they read this
/// data snapshot rather than the live cells — a deliberate simplification of
/// spec §4.7's "callback may read any already-enlisted cell", recorded in
/// DESIGN.md.
#[derive(Debug, Clone, Copy)]
pub struct EnlistedInfo {
    pub cell_id: u64,
    pub owner_tag: u64,
    pub changed: bool,
}

/// `changed_ids` must be captured before the cells in `ctx` were published —
/// a published cell's staged slot has already been cleared, so `has_staged()`
/// can no longer answer "did this commit change it".
pub(crate) fn enlisted_infos(ctx: &Context, changed_ids: &HashSet<u64>) -> Vec<EnlistedInfo> {
    ctx.enlist_order
        .iter()
        .filter_map(|id| {
            ctx.enlisted.get(id).map(|cell| EnlistedInfo {
                cell_id: cell.id(),
                owner_tag: cell.owner_tag(),
                changed: changed_ids.contains(&cell.id()),
            })
        })
        .collect()
}

type Test = Box<dyn Fn() -> Result<bool> + Send + Sync>;
type Trans = Box<dyn Fn() -> Result<()> + Send + Sync>;

struct Subscription {
    id: u64,
    test: Test,
    trans: Trans,
    dependencies: Mutex<HashSet<u64>>,
}

struct WhenCommittingHook {
    id: u64,
    callback: Box<dyn Fn(&[EnlistedInfo]) + Send + Sync>,
}

lazy_static! {
    static ref CONDITIONALS: Mutex<Arc<Vec<Arc<Subscription>>>> = Mutex::new(Arc::new(Vec::new()));
    static ref PRECOMMITS: Mutex<Arc<Vec<Arc<Subscription>>>> = Mutex::new(Arc::new(Vec::new()));
    static ref WHEN_COMMITTING: Mutex<Arc<Vec<Arc<WhenCommittingHook>>>> = Mutex::new(Arc::new(Vec::new()));
}

fn push_cow<T>(registry: &Mutex<Arc<Vec<Arc<T>>>>, item: Arc<T>) {
    let mut guard = registry.lock().expect("subscription registry poisoned");
    let mut next = (**guard).clone();
    next.push(item);
    *guard = Arc::new(next);
}

fn remove_cow<T>(registry: &Mutex<Arc<Vec<Arc<T>>>>, predicate: impl Fn(&Arc<T>) -> bool) {
    let mut guard = registry.lock().expect("subscription registry poisoned");
    let next: Vec<Arc<T>> = guard.iter().filter(|item| predicate(item)).cloned().collect();
    *guard = Arc::new(next);
}

fn remove_conditional(id: u64) {
    remove_cow(&CONDITIONALS, |s: &Arc<Subscription>| s.id != id);
}

fn remove_precommit(id: u64) {
    remove_cow(&PRECOMMITS, |s: &Arc<Subscription>| s.id != id);
}

fn remove_when_committing(id: u64) {
    remove_cow(&WHEN_COMMITTING, |h: &Arc<WhenCommittingHook>| h.id != id);
}

/// Runs `test` in its own throwaway transaction purely to gather the set of
/// owner tags it reads; the boolean result is discarded (§4.7 "test runs in
/// an isolated sub-transaction purely to gather its read set"). Errors if
/// called from inside an active transaction (registration, like
/// `when_committing`, must not run nested) or if `test` touches no cells.
fn gather_dependencies(test: &(dyn Fn() -> Result<bool> + Send + Sync)) -> Result<HashSet<u64>> {
    if context::is_in_transaction() {
        return Err(TxError::AlreadyInTransaction);
    }
    let read_stamp = crate::commit::CLOCK.current();
    let ticket = crate::commit::VERSION_LIST.open(read_stamp);
    context::enter(Context::new(read_stamp, ticket));
    let _ = test();
    let deps = context::with_context(|ctx| {
        ctx.enlist_order
            .iter()
            .filter_map(|id| ctx.enlisted.get(id).map(|c| c.owner_tag()))
            .collect::<HashSet<_>>()
    });
    drop(context::exit());

    if deps.is_empty() {
        return Err(TxError::ConditionalDependsOnNothing);
    }
    Ok(deps)
}

/// A disposable handle returned by [`conditional`], [`pre_commit`], and
/// [`when_committing`].
pub enum Handle {
    Conditional(u64),
    PreCommit(u64),
    WhenCommitting(u64),
}

impl Handle {
    /// Unregisters the subscription. Disposing a `Conditional` or `PreCommit`
    /// subscription is itself transactional per spec §4.7: it must be called
    /// from inside a transaction, and the removal only takes effect if that
    /// transaction commits — scheduled as an ordinary `on_commit` side effect
    /// so a rolled-back dispose leaves the subscription registered.
    /// `WhenCommitting` hooks are not scoped to any transaction and dispose
    /// immediately.
    pub fn dispose(self) -> Result<()> {
        match self {
            Handle::Conditional(id) => dispose_transactionally(id, remove_conditional),
            Handle::PreCommit(id) => dispose_transactionally(id, remove_precommit),
            Handle::WhenCommitting(id) => {
                remove_when_committing(id);
                Ok(())
            }
        }
    }
}

fn dispose_transactionally(id: u64, remove: fn(u64)) -> Result<()> {
    if !context::is_in_transaction() {
        return Err(TxError::NotInTransaction);
    }
    context::with_context(|ctx| {
        ctx.side_effects.push(SideEffect::new(Box::new(move || remove(id)), None));
    });
    Ok(())
}

/// Registers a conditional transaction: after any commit that touches one of
/// `test`'s dependency cells, re-runs `test` in a fresh transaction and, if it
/// returns `true`, runs `trans` in that same transaction (§4.7).
pub fn conditional(
    test: impl Fn() -> Result<bool> + Send + Sync + 'static,
    trans: impl Fn() -> Result<()> + Send + Sync + 'static,
) -> Result<Handle> {
    let test: Test = Box::new(test);
    let deps = gather_dependencies(test.as_ref())?;
    let id = next_id();
    let sub = Arc::new(Subscription {
        id,
        test,
        trans: Box::new(trans),
        dependencies: Mutex::new(deps),
    });
    push_cow(&CONDITIONALS, sub);
    Ok(Handle::Conditional(id))
}

/// Registers a pre-commit subscription: fires inside the committing
/// transaction itself, before validation, whenever that transaction touches
/// one of `test`'s dependency cells — so `trans` can call
/// [`crate::rollback_and_retry`] or stage a corrective write (§4.7).
pub fn pre_commit(
    test: impl Fn() -> Result<bool> + Send + Sync + 'static,
    trans: impl Fn() -> Result<()> + Send + Sync + 'static,
) -> Result<Handle> {
    let test: Test = Box::new(test);
    let deps = gather_dependencies(test.as_ref())?;
    let id = next_id();
    let sub = Arc::new(Subscription {
        id,
        test,
        trans: Box::new(trans),
        dependencies: Mutex::new(deps),
    });
    push_cow(&PRECOMMITS, sub);
    Ok(Handle::PreCommit(id))
}

/// Registers a callback invoked during every commit with a snapshot of the
/// enlisted cells and a changed-flag per cell (§4.7 `WhenCommitting`). Must
/// not be called from inside a transaction.
pub fn when_committing(cb: impl Fn(&[EnlistedInfo]) + Send + Sync + 'static) -> Result<Handle> {
    if context::is_in_transaction() {
        return Err(TxError::AlreadyInTransaction);
    }
    let id = next_id();
    push_cow(
        &WHEN_COMMITTING,
        Arc::new(WhenCommittingHook { id, callback: Box::new(cb) }),
    );
    Ok(Handle::WhenCommitting(id))
}

/// Fires every registered pre-commit subscription whose dependency set
/// overlaps the committing transaction's enlisted cells, in the committing
/// transaction itself, before validation (§4.7).
pub(crate) fn fire_pre_commits() -> Result<()> {
    let mut enlisted_tags: HashSet<u64> = context::with_context(|ctx| {
        ctx.enlist_order
            .iter()
            .filter_map(|id| ctx.enlisted.get(id).map(|c| c.owner_tag()))
            .collect()
    });
    // A not-yet-degenerated commute hasn't enlisted the cells it will touch,
    // so a pre-commit subscription depending only on one of those cells would
    // otherwise never see an overlap and the commute would never be forced to
    // degenerate before validation (§9 open question).
    context::with_context(|ctx| {
        enlisted_tags.extend(ctx.commutes.iter().filter(|rec| rec.is_ok()).flat_map(|rec| rec.affecting()));
    });

    let subs = PRECOMMITS.lock().expect("subscription registry poisoned").clone();
    for sub in subs.iter() {
        let overlaps = {
            let deps = sub.dependencies.lock().expect("subscription poisoned");
            !deps.is_disjoint(&enlisted_tags)
        };
        if !overlaps {
            continue;
        }

        let before = context::with_context(|ctx| ctx.enlist_order.len());
        let fired = (sub.test)()?;
        let new_deps = context::with_context(|ctx| {
            ctx.enlist_order[before..]
                .iter()
                .filter_map(|id| ctx.enlisted.get(id).map(|c| c.owner_tag()))
                .collect::<HashSet<_>>()
        });
        if !new_deps.is_empty() {
            *sub.dependencies.lock().expect("subscription poisoned") = new_deps;
        }

        if fired {
            (sub.trans)()?;
        }
    }
    Ok(())
}

/// Re-fires every conditional subscription whose dependency set overlaps the
/// owner tags a just-committed transaction changed, each in its own fresh,
/// independently retried transaction (§4.7).
pub(crate) fn fire_post_commit_conditionals(changed_owner_tags: &HashSet<u64>) -> Result<()> {
    if changed_owner_tags.is_empty() {
        return Ok(());
    }

    let subs = CONDITIONALS.lock().expect("subscription registry poisoned").clone();
    let mut errors = Vec::new();

    for sub in subs.iter() {
        let overlaps = {
            let deps = sub.dependencies.lock().expect("subscription poisoned");
            !deps.is_disjoint(changed_owner_tags)
        };
        if !overlaps {
            continue;
        }

        let sub = sub.clone();
        let outcome = crate::commit::run_result(move || {
            let before = context::with_context(|ctx| ctx.enlist_order.len());
            let fired = (sub.test)()?;
            let new_deps = context::with_context(|ctx| {
                ctx.enlist_order[before..]
                    .iter()
                    .filter_map(|id| ctx.enlisted.get(id).map(|c| c.owner_tag()))
                    .collect::<HashSet<_>>()
            });
            if !new_deps.is_empty() {
                *sub.dependencies.lock().expect("subscription poisoned") = new_deps;
            }
            if fired {
                (sub.trans)()?;
            }
            Ok(())
        });

        if let Err(err) = outcome {
            errors.push(err.to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        warn!("{} conditional subscription(s) failed after commit: {:?}", errors.len(), errors);
        Err(TxError::UserError(UserErrors { messages: errors }))
    }
}

/// Runs every `WhenCommitting` hook with a snapshot of the transaction's
/// enlisted cells, best-effort: a panicking hook does not stop the rest.
pub(crate) fn run_when_committing(infos: &[EnlistedInfo]) -> Result<()> {
    let hooks = WHEN_COMMITTING.lock().expect("subscription registry poisoned").clone();
    let mut errors = Vec::new();

    for hook in hooks.iter() {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (hook.callback)(infos)));
        if outcome.is_err() {
            errors.push("when-committing hook panicked".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TxError::UserError(UserErrors { messages: errors }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::commit::run_result;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn conditional_fires_after_a_commit_touches_its_dependency() {
        let counter = Cell::new(0);
        let fired = Arc::new(AtomicUsize::new(0));

        let test_counter = counter.clone();
        let trans_fired = fired.clone();
        let handle = conditional(
            move || Ok(test_counter.get()? > 0),
            move || {
                trans_fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();

        let c = counter.clone();
        run_result(move || c.set(1)).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let _ = handle;
    }

    #[test]
    fn gather_dependencies_rejects_an_empty_read_set() {
        let err = conditional(|| Ok(true), || Ok(())).unwrap_err();
        assert!(matches!(err, TxError::ConditionalDependsOnNothing));
    }

    #[test]
    fn registration_is_rejected_inside_a_transaction() {
        let cell = Cell::new(0);
        let c = cell.clone();
        let err = run_result(move || {
            let _ = c.get()?;
            conditional(|| Ok(true), || Ok(()))
        })
        .unwrap_err();
        assert!(matches!(err, TxError::AlreadyInTransaction));
    }
}
