// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # cellstm
//!
//! An in-memory software transactional memory runtime: optimistic,
//! multi-version concurrency control over shared mutable state.
//!
//! Application code wraps values in [`Cell`]s and mutates them inside
//! [`run`]/[`run_result`]. The runtime guarantees that a committed
//! transaction observed one consistent snapshot, that conflicting
//! transactions retry automatically, and that deadlocks cannot occur — a
//! single global commit mutex serializes the only phase that ever holds more
//! than one cell's write stamp at a time.
//!
//! ```
//! use cellstm::Cell;
//!
//! let balance = Cell::new(100i64);
//! let b = balance.clone();
//! cellstm::run(move || b.modify(|v| *v -= 10)).unwrap();
//! assert_eq!(balance.get().unwrap(), 90);
//! ```
#![allow(clippy::type_complexity)]

pub mod breaker;
pub mod cell;
pub mod clock;
pub mod commit;
mod commute;
mod context;
pub mod dict;
pub mod error;
mod local;
pub mod locker;
mod sideeffect;
pub mod subscribe;
mod sync;
pub mod version_list;
pub mod write_stamp;

pub use cell::Cell;
pub use commit::{read_old_state, rollback_and_retry, run, run_result, run_to_commit, Continuation, RetryPolicy, Runtime, Stats};
pub use context::{is_in_transaction, read_stamp};
pub use dict::TMap;
pub use error::{Result, TxError, UserErrors};
pub use sideeffect::{side_effect, sync_side_effect};
pub use subscribe::{conditional, pre_commit, when_committing, EnlistedInfo, Handle};

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn transfer_between_two_cells_is_atomic() {
        let a = Cell::new(1000i64);
        let b = Cell::new(1000i64);

        let threads: Vec<_> = (0..50)
            .map(|i| {
                let a = a.clone();
                let b = b.clone();
                thread::spawn(move || {
                    let amount = (i % 10) + 1;
                    run(move || {
                        a.modify(|v| *v -= amount)?;
                        b.modify(|v| *v += amount)?;
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(a.get().unwrap() + b.get().unwrap(), 2000);
    }

    #[test]
    fn concurrent_commutes_never_retry_each_other() {
        let x = Cell::new(0i64);
        let y = Cell::new(0i64);

        let xc = x.clone();
        let t1 = thread::spawn(move || {
            for _ in 0..200 {
                let xc = xc.clone();
                run(move || xc.commute(|v| *v += 1)).unwrap();
            }
        });

        let yc = y.clone();
        let t2 = thread::spawn(move || {
            for _ in 0..200 {
                let yc = yc.clone();
                run(move || yc.commute(|v| *v += 1)).unwrap();
            }
        });

        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(x.get().unwrap(), 200);
        assert_eq!(y.get().unwrap(), 200);
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let cell = Cell::new(1i64);
        let c = cell.clone();
        Runtime::set_retry_policy(RetryPolicy::Abort);
        let result = run_result(move || {
            c.set(99)?;
            rollback_and_retry()
        });
        Runtime::set_retry_policy(RetryPolicy::Retry);
        assert!(matches!(result, Err(TxError::Retry)));
        assert_eq!(cell.get().unwrap(), 1);
    }
}
