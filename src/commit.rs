//! The commit coordinator: runs `validate → acquire write stamps → publish →
//! release` under a single process-wide commit mutex, retrying on conflict.
//!
//! Grounded on `stm/src/rlu/stm/mod.rs::Stm::read_write`'s retry loop (sample
//! clock → speculative body → lock write set → validate → commit), extended
//! to cover pre-commit firing, isolated commute execution, and synchronized
//! side effects, none of which the teacher's loop has.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, trace};

use crate::breaker::BusyBreaker;
use crate::cell::EnlistedCell;
use crate::clock::VersionClock;
use crate::context::{self, Context};
use crate::error::{Result, TxError, UserErrors};
use crate::locker::ParkPolicy;
use crate::subscribe;
use crate::sync::Mutex;
use crate::version_list::VersionList;

lazy_static! {
    pub(crate) static ref CLOCK: VersionClock = VersionClock::new();
    pub(crate) static ref VERSION_LIST: VersionList = VersionList::new();
    static ref COMMIT_MUTEX: Mutex<()> = Mutex::new(());
}

static TRIM_EVERY: AtomicU64 = AtomicU64::new(16);
static TRIM_COUNTER: AtomicU64 = AtomicU64::new(0);
static TRIM_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// How the transaction loop reacts to a failed commit attempt once it is
/// known to be a real conflict (never consulted for internal retry signals
/// raised *within* a single attempt — those always retry immediately).
///
/// Generalizes the teacher's `Strategy`/`RLUStrategy` (`Retry` | `Abort`) from
/// a single RLU context to the whole transaction loop.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Retry until the transaction commits (the default).
    Retry,
    /// Give up and return the retry signal as a [`TxError`] after one failed
    /// attempt.
    Abort,
    /// Retry, backing off with a [`BusyBreaker`] between attempts.
    RetryWithBreaker(BusyBreaker),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Retry
    }
}

thread_local! {
    static RETRY_POLICY: std::cell::RefCell<RetryPolicy> = std::cell::RefCell::new(RetryPolicy::Retry);
    static PARK_POLICY: std::cell::RefCell<ParkPolicy> = std::cell::RefCell::new(ParkPolicy::default());
}

/// Process-wide, read-only configuration and introspection facade.
///
/// This is a library, not a service — there is no single "instance" to
/// construct. `Runtime` is a zero-sized handle over process-wide state, in
/// the same spirit as the teacher's module-level statics (`rlu/src/rlu.rs`),
/// just exposed as an explicit type for discoverability.
pub struct Runtime;

/// A snapshot of runtime activity, per spec §3 supplemented introspection.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub clock: u64,
    pub active_read_stamps: usize,
    pub trim_horizon: u64,
}

impl Runtime {
    /// Overrides the opportunistic-trim cadence (default: every 16th commit).
    pub fn with_trim_interval(every: u64) {
        TRIM_EVERY.store(every.max(1), Ordering::SeqCst);
    }

    /// Sets this thread's retry/abort strategy for subsequent `run`/
    /// `run_result` calls.
    pub fn set_retry_policy(policy: RetryPolicy) {
        RETRY_POLICY.with(|p| *p.borrow_mut() = policy);
    }

    /// Sets this thread's spin/park tuning for the stamp locker.
    pub fn set_park_policy(policy: ParkPolicy) {
        PARK_POLICY.with(|p| *p.borrow_mut() = policy);
    }

    pub fn stats() -> Stats {
        let clock = CLOCK.current();
        Stats {
            clock,
            active_read_stamps: VERSION_LIST.active_len(),
            trim_horizon: VERSION_LIST.min(clock),
        }
    }
}

pub(crate) fn park_policy() -> ParkPolicy {
    PARK_POLICY.with(|p| p.borrow().clone())
}

/// Runs `body` in a transaction, retrying automatically on conflict. A call
/// made while already inside a transaction simply invokes `body` inline —
/// the outer transaction captures everything (§4.6 "Nesting").
pub fn run(body: impl Fn() -> Result<()>) -> Result<()> {
    run_result(body)
}

/// As [`run`], returning `body`'s value on commit.
pub fn run_result<T>(body: impl Fn() -> Result<T>) -> Result<T> {
    if context::is_in_transaction() {
        return body();
    }

    loop {
        let read_stamp = CLOCK.current();
        let ticket = VERSION_LIST.open(read_stamp);
        context::enter(Context::new(read_stamp, ticket));
        trace!("transaction opened at read stamp {}", read_stamp);

        match attempt(&body) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict_signal() => {
                // Internal conflict signals are never subject to `RetryPolicy`
                // (§7): they are invisible to the caller under any policy, so
                // they always retry immediately.
                debug!("transaction retrying after internal conflict {:?}", err);
                continue;
            }
            Err(err) if err.is_retry_signal() => {
                debug!("transaction retrying after {:?}", err);
                match RETRY_POLICY.with(|p| match &*p.borrow() {
                    RetryPolicy::Retry => None,
                    RetryPolicy::Abort => Some(()),
                    RetryPolicy::RetryWithBreaker(b) => {
                        b.spin();
                        None
                    }
                }) {
                    Some(()) => return Err(err),
                    None => continue,
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn attempt<T>(body: &impl Fn() -> Result<T>) -> Result<T> {
    let value = match body() {
        Ok(value) => value,
        Err(err) => {
            roll_back_active_context();
            return Err(err);
        }
    };

    match finish_commit(value) {
        Ok(value) => Ok(value),
        Err(err) => {
            roll_back_active_context();
            Err(err)
        }
    }
}

fn roll_back_active_context() {
    let ctx = context::exit();
    for cell in ctx.enlisted.values() {
        cell.rollback();
    }
    for effect in ctx.side_effects {
        if let Some(on_rollback) = effect.on_rollback {
            on_rollback();
        }
    }
}

/// Runs the pre-commit / commute / validate / publish pipeline for a body
/// that already returned `value`. On success the context has already been
/// torn down and best-effort hooks fired; on failure the caller rolls back.
fn finish_commit<T>(value: T) -> Result<T> {
    subscribe::fire_pre_commits()?;

    let pre_isolation_ids: HashSet<u64> = context::with_context(|ctx| ctx.enlist_order.iter().copied().collect());
    let fresh_read_stamp = CLOCK.current();
    let isolated_ids = crate::commute::run_remaining_isolated(fresh_read_stamp)?;
    if !pre_isolation_ids.is_disjoint(&isolated_ids) {
        return Err(TxError::InvalidCommute);
    }

    let (version, locked) = lock_and_stamp()?;
    // `publish` clears each cell's staged slot, so the "did this transaction
    // actually change it" flag has to be captured from `locked` (exactly the
    // cells that passed the `has_staged()` filter in `lock_and_stamp`) before
    // that happens, not recomputed afterwards.
    let changed_ids: HashSet<u64> = locked.iter().map(|cell| cell.id()).collect();
    run_sync_side_effects();
    for cell in &locked {
        cell.publish(version);
    }

    let ctx = context::exit();
    trace!("transaction committed at version {}", version);

    let hook_errors = run_best_effort_hooks(ctx, &changed_ids);
    maybe_trim(&locked);

    if hook_errors.is_empty() {
        Ok(value)
    } else {
        Err(TxError::UserError(UserErrors { messages: hook_errors }))
    }
}

/// Validates every staged cell and installs its write stamp, under the
/// single commit mutex (§4.6 steps "lock write set" → "validate" →
/// "commit"). Returns the chosen version and the cells now locked for
/// publish; the caller runs synchronized side effects before publishing so
/// they observe the commit while those cells' write stamps are still held,
/// per spec §3 `sync_side_effects` ("run while commit-locks are still held").
fn lock_and_stamp() -> Result<(u64, Vec<Arc<dyn EnlistedCell>>)> {
    let owner = thread::current().id();
    let guard = COMMIT_MUTEX.lock().expect("commit mutex poisoned");

    let staged: Vec<Arc<dyn EnlistedCell>> = context::with_context(|ctx| {
        ctx.enlist_order
            .iter()
            .filter_map(|id| ctx.enlisted.get(id).cloned())
            .filter(|cell| cell.has_staged())
            .collect()
    });

    let mut locked = Vec::with_capacity(staged.len());
    for cell in &staged {
        if lock_one(cell, owner) {
            locked.push(cell.clone());
        } else {
            for cell in &locked {
                cell.rollback();
            }
            return Err(TxError::CommitFailed);
        }
    }

    let new_version = CLOCK.advance();
    for cell in &locked {
        cell.set_pending_version(new_version);
    }
    drop(guard);

    Ok((new_version, locked))
}

fn lock_one(cell: &Arc<dyn EnlistedCell>, owner: ThreadId) -> bool {
    cell.try_lock_for_commit(owner)
}

fn run_sync_side_effects() {
    context::with_context(|ctx| {
        for effect in std::mem::take(&mut ctx.sync_side_effects) {
            effect();
        }
    });
}

/// Fires when-committing subscriptions, then ordinary side effects, then
/// post-commit conditional subscriptions, all best-effort: one failing does
/// not stop the rest, and every failure is collected rather than raised
/// immediately (§4.7, §8 P7). A "failure" here is either a hook returning
/// `Err` or a side-effect callback panicking.
fn run_best_effort_hooks(ctx: Context, changed_ids: &HashSet<u64>) -> Vec<String> {
    let mut errors = Vec::new();

    let infos = subscribe::enlisted_infos(&ctx, changed_ids);
    if let Err(err) = subscribe::run_when_committing(&infos) {
        errors.push(err.to_string());
    }

    for effect in ctx.side_effects {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(effect.on_commit));
        if outcome.is_err() {
            errors.push("side effect panicked during on_commit".to_string());
        }
    }

    let changed_owner_tags: HashSet<u64> = infos
        .iter()
        .filter(|info| info.changed)
        .map(|info| info.owner_tag)
        .collect();

    if let Err(err) = subscribe::fire_post_commit_conditionals(&changed_owner_tags) {
        errors.push(err.to_string());
    }

    if !errors.is_empty() {
        log::warn!("{} best-effort commit hook(s) failed: {:?}", errors.len(), errors);
    }

    errors
}

/// Opportunistically asks each cell this commit just published through to
/// drop version-chain nodes no open transaction can still see (§4.6 "Trimming
/// old versions", §8 E6). Only the cells *this* commit touched are trimmed —
/// there is no process-wide cell registry, so trimming rides along with the
/// commits that are already walking these cells' chains rather than scanning
/// every live cell on a timer.
fn maybe_trim(locked: &[Arc<dyn EnlistedCell>]) {
    if locked.is_empty() {
        return;
    }
    let every = TRIM_EVERY.load(Ordering::Relaxed).max(1);
    let count = TRIM_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    if count % every != 0 {
        return;
    }
    if TRIM_IN_PROGRESS
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    let horizon = VERSION_LIST.min(CLOCK.current());
    trace!("opportunistic trim at horizon {}", horizon);
    for cell in locked {
        cell.trim(horizon);
    }
    TRIM_IN_PROGRESS.store(false, Ordering::SeqCst);
}

/// Inside a transaction only: requests that the current attempt be rolled
/// back and retried from scratch.
pub fn rollback_and_retry() -> Result<()> {
    if !context::is_in_transaction() {
        return Err(TxError::NotInTransaction);
    }
    context::with_context(|ctx| {
        if ctx.commit_check_done {
            return Err(TxError::ContinuationCompleted);
        }
        ctx.retry_requested = true;
        Ok(())
    })?;
    Err(TxError::Retry)
}

/// Runs `body` with cell reads observing the pre-transaction value (§6
/// `read_old_state`).
pub fn read_old_state<T>(body: impl FnOnce() -> Result<T>) -> Result<T> {
    if !context::is_in_transaction() {
        return Err(TxError::NotInTransaction);
    }
    let previous = context::with_context(|ctx| {
        let previous = ctx.reading_old_state;
        ctx.reading_old_state = true;
        previous
    });
    let result = body();
    context::with_context(|ctx| ctx.reading_old_state = previous);
    result
}

/// A suspended, validated-and-locked transaction awaiting an explicit
/// `commit()` or `rollback()` call — the "validate" and "publish" phases
/// split across calls, per §6 `run_to_commit`.
///
/// Must be resolved from the same thread that created it: the staged writes
/// backing this continuation live in each cell's thread-keyed local storage
/// (see `local::LocalSlot`), so a foreign thread would find nothing to
/// publish. This is a deliberate scoping of the spec's "split validate from
/// publish across threads" note — see DESIGN.md.
pub struct Continuation<T> {
    value: Option<T>,
    locked: Vec<std::sync::Arc<dyn EnlistedCell>>,
    version: u64,
    owner_thread: ThreadId,
    deadline: Option<Instant>,
    resolved: bool,
}

impl<T> Continuation<T> {
    fn expired(&self) -> bool {
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    fn check_usable(&self) -> Result<()> {
        if self.resolved {
            return Err(TxError::ContinuationCompleted);
        }
        if thread::current().id() != self.owner_thread {
            return Err(TxError::ContextForbidden);
        }
        Ok(())
    }

    /// Publishes the staged writes and returns the body's value.
    pub fn commit(mut self) -> Result<T> {
        self.check_usable()?;
        if self.expired() {
            self.do_rollback();
            return Err(TxError::CommitFailed);
        }
        for cell in &self.locked {
            cell.publish(self.version);
        }
        self.resolved = true;
        Ok(self.value.take().expect("continuation value taken twice"))
    }

    /// Releases the held locks without publishing.
    pub fn rollback(mut self) -> Result<()> {
        self.check_usable()?;
        self.do_rollback();
        Ok(())
    }

    fn do_rollback(&mut self) {
        for cell in &self.locked {
            cell.rollback();
        }
        self.resolved = true;
    }
}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.do_rollback();
        }
    }
}

/// Runs `body`, validates and locks its writes, then returns a
/// [`Continuation`] instead of publishing immediately. The caller later calls
/// `commit()` or `rollback()`; if `timeout` elapses first, the continuation
/// auto-rolls-back on drop.
pub fn run_to_commit<T>(timeout: Option<Duration>, body: impl FnOnce() -> Result<T>) -> Result<Continuation<T>> {
    if context::is_in_transaction() {
        return Err(TxError::AlreadyInTransaction);
    }

    let read_stamp = CLOCK.current();
    let ticket = VERSION_LIST.open(read_stamp);
    context::enter(Context::new(read_stamp, ticket));

    let value = match body() {
        Ok(value) => value,
        Err(err) => {
            roll_back_active_context();
            return Err(err);
        }
    };

    let prep = (|| -> Result<(Vec<std::sync::Arc<dyn EnlistedCell>>, u64)> {
        subscribe::fire_pre_commits()?;
        let pre_isolation_ids: HashSet<u64> = context::with_context(|ctx| ctx.enlist_order.iter().copied().collect());
        let fresh_read_stamp = CLOCK.current();
        let isolated_ids = crate::commute::run_remaining_isolated(fresh_read_stamp)?;
        if !pre_isolation_ids.is_disjoint(&isolated_ids) {
            return Err(TxError::InvalidCommute);
        }

        let owner = thread::current().id();
        let guard = COMMIT_MUTEX.lock().expect("commit mutex poisoned");
        let staged: Vec<std::sync::Arc<dyn EnlistedCell>> = context::with_context(|ctx| {
            ctx.enlist_order
                .iter()
                .filter_map(|id| ctx.enlisted.get(id).cloned())
                .filter(|cell| cell.has_staged())
                .collect()
        });
        let mut locked = Vec::with_capacity(staged.len());
        for cell in &staged {
            if lock_one(cell, owner) {
                locked.push(cell.clone());
            } else {
                for cell in &locked {
                    cell.rollback();
                }
                return Err(TxError::CommitFailed);
            }
        }
        let new_version = CLOCK.advance();
        for cell in &locked {
            cell.set_pending_version(new_version);
        }
        drop(guard);
        Ok((locked, new_version))
    })();

    context::with_context(|ctx| ctx.commit_check_done = true);

    match prep {
        Ok((locked, version)) => {
            context::exit();
            Ok(Continuation {
                value: Some(value),
                locked,
                version,
                owner_thread: thread::current().id(),
                deadline: timeout.map(|d| Instant::now() + d),
                resolved: false,
            })
        }
        Err(err) => {
            roll_back_active_context();
            Err(err)
        }
    }
}
