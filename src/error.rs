// Error taxonomy for the transaction engine.
//
// `WriteCollision`, `WritableReadCollision` and `CommitFailed` are retry
// signals: the transaction loop in `commit` always catches them and restarts
// the body. They are constructible only from within the crate so that user
// code can never accidentally swallow or propagate one past `run`.

use std::fmt;

use thiserror::Error as DeriveError;

/// Errors raised by the transaction engine.
///
/// The retry-signal variants (`WriteCollision`, `WritableReadCollision`,
/// `CommitFailed`) never escape [`crate::run`] / [`crate::run_result`] — they
/// are consumed by the commit loop and cause a restart. Everything else
/// propagates to the caller.
#[derive(Debug, DeriveError)]
pub enum TxError {
    /// A cell's head advanced past the transaction's read stamp while the
    /// cell was being staged for a write. Internal retry signal.
    #[error("write collision")]
    WriteCollision,

    /// A cell with a local staged write observed a head stamp newer than the
    /// transaction's read stamp while reading. Internal retry signal.
    #[error("writable read collision")]
    WritableReadCollision,

    /// Validation failed during the commit phase (a cell's `can_commit`
    /// returned false). Internal retry signal.
    #[error("commit validation failed")]
    CommitFailed,

    /// The caller explicitly asked to roll back and retry the transaction.
    /// Internal retry signal, raised by [`crate::rollback_and_retry`].
    #[error("transaction requested rollback and retry")]
    Retry,

    /// An operation that requires an active transaction was called outside
    /// one (e.g. `rollback_and_retry` at top level).
    #[error("not in transaction")]
    NotInTransaction,

    /// An operation that must not run nested was called from inside an
    /// active transaction (`when_committing` registration, `run_to_commit`).
    #[error("already in transaction")]
    AlreadyInTransaction,

    /// A strict commute or when-committing callback touched a cell outside
    /// its allowed scope.
    #[error("operation touched a cell outside its allowed scope")]
    ContextForbidden,

    /// A `when_committing` callback attempted to write to a cell that was
    /// not already staged by the main transaction.
    #[error("write to non-staged cell forbidden in this context")]
    WriteForbidden,

    /// A commute and the main transaction body touched overlapping cells; a
    /// programming error, never a retry signal.
    #[error("commute and transaction body touched overlapping cells")]
    InvalidCommute,

    /// A conditional or pre-commit subscription's test accessed no cells, so
    /// it has no dependency set to re-fire on.
    #[error("conditional subscription test read no cells")]
    ConditionalDependsOnNothing,

    /// An operation was attempted on a `run_to_commit` continuation handle
    /// after it had already committed or rolled back.
    #[error("continuation already completed")]
    ContinuationCompleted,

    /// One or more user callbacks (side effects, subscriptions) raised while
    /// being run best-effort after a commit. Does not affect the commit
    /// outcome; collected and surfaced afterwards.
    #[error("{0} user callback(s) failed after commit")]
    UserError(UserErrors),
}

/// An aggregate of errors raised by best-effort, post-commit user callbacks.
///
/// `side_effect`/subscription callbacks in this crate return `()`, so the
/// only way a hook "fails" is by panicking; the best-effort hook runner
/// catches those panics and records them here rather than letting one bad
/// hook prevent the others from running.
#[derive(Debug, Default)]
pub struct UserErrors {
    pub(crate) messages: Vec<String>,
}

impl UserErrors {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(String::as_str)
    }
}

impl fmt::Display for UserErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages.len())
    }
}

impl TxError {
    /// True for the internal retry signals the commit loop consumes itself.
    pub(crate) fn is_retry_signal(&self) -> bool {
        self.is_conflict_signal() || matches!(self, TxError::Retry)
    }

    /// True for the conflict-driven retry signals spec §7 says must always be
    /// retried, never subject to [`crate::RetryPolicy`]: unlike
    /// [`TxError::Retry`] (a caller's explicit request, which the policy does
    /// govern), these are never surfaced to the user under any policy.
    pub(crate) fn is_conflict_signal(&self) -> bool {
        matches!(self, TxError::WriteCollision | TxError::WritableReadCollision | TxError::CommitFailed)
    }
}

pub type Result<T> = core::result::Result<T, TxError>;
