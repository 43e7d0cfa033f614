//! Deadlock-detecting `Mutex` swapped in for `std`'s, mirroring the teacher's
//! own compat shim (`stm/src/rlu/stm/sync.rs`). Every cell lock, the commit
//! mutex, and the subscription registries go through this module rather than
//! `std::sync::Mutex` directly, so enabling/disabling the `no_deadlocks`
//! feature retunes the whole crate from one place.

#[cfg(feature = "no_deadlocks")]
pub(crate) use no_deadlocks::{Mutex, MutexGuard};

#[cfg(not(feature = "no_deadlocks"))]
pub(crate) use std::sync::{Mutex, MutexGuard};
