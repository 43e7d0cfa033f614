// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! End-to-end concurrency scenarios, one per §8 of the design: atomic
//! transfers, a dependency-limited ticket shop, commute non-interference,
//! exactly-once conditional firing, rollback cleanliness, and trim progress.
//!
//! Uses `threadpool`/`rand` for concurrent fan-out, the same pattern
//! `stm/tests/test_stm.rs` uses for its own threaded scenarios.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rand::Rng;
use threadpool::ThreadPool;

use cellstm::{run, run_result, Cell, RetryPolicy, Runtime, TMap, TxError};

#[test]
fn e1_atomic_transfer_preserves_the_total() {
    let a = Cell::new(1000i64);
    let b = Cell::new(1000i64);
    let pool = ThreadPool::new(8);

    for _ in 0..1000 {
        let a = a.clone();
        let b = b.clone();
        pool.execute(move || {
            let mut rng = rand::thread_rng();
            let amount = rng.gen_range(1..=10);
            let a_to_b = rng.gen_bool(0.5);
            run(move || {
                let (from, to) = if a_to_b { (&a, &b) } else { (&b, &a) };
                let from_balance = from.get()?;
                if from_balance < amount {
                    // Insufficient funds: a no-op commit, never a negative
                    // balance — matches spec §8 E1's observability clause.
                    return Ok(());
                }
                from.set(from_balance - amount)?;
                let to_balance = to.get()?;
                to.set(to_balance + amount)?;
                Ok(())
            })
            .unwrap();
        });
    }
    pool.join();

    assert_eq!(a.get().unwrap() + b.get().unwrap(), 2000);
    assert!(a.get().unwrap() >= 0 && b.get().unwrap() >= 0);
}

#[test]
fn e2_bet_shop_payout_limit_never_exceeded() {
    const OFFERS: usize = 5;
    const LIMIT: i64 = 1000;

    let sums: Vec<Cell<i64>> = (0..OFFERS).map(|_| Cell::new(0i64)).collect();
    let tickets: TMap<u64, (usize, i64)> = TMap::new();

    // Safety-net pre-commit: re-checks every offer's running sum whenever a
    // committing transaction touches one of them. The business logic below
    // already enforces the limit before staging a write, so in a correct run
    // this should never actually need to force a retry.
    let check_sums = sums.clone();
    let handle = cellstm::pre_commit(
        move || {
            for s in &check_sums {
                if s.get()? > LIMIT {
                    return Ok(true);
                }
            }
            Ok(false)
        },
        cellstm::rollback_and_retry,
    )
    .unwrap();

    let pool = ThreadPool::new(8);
    let ticket_count = 2000u64;
    for i in 0..ticket_count {
        let sums = sums.clone();
        let tickets = tickets.clone();
        pool.execute(move || {
            let mut rng = rand::thread_rng();
            let offer = rng.gen_range(0..OFFERS);
            let payout = rng.gen_range(1..=50);
            run(move || {
                let current = sums[offer].get()?;
                if current + payout > LIMIT {
                    return Ok(());
                }
                sums[offer].set(current + payout)?;
                tickets.insert(i, (offer, payout))?;
                Ok(())
            })
            .unwrap();
        });
    }
    pool.join();

    let snapshot = run_result({
        let tickets = tickets.clone();
        move || tickets.snapshot()
    })
    .unwrap();

    for (offer, sum) in sums.iter().enumerate() {
        let total = run_result({
            let sum = sum.clone();
            move || sum.get()
        })
        .unwrap();
        assert!(total <= LIMIT);
        let expected: i64 = snapshot.iter().filter(|(_, (o, _))| *o == offer).map(|(_, (_, p))| p).sum();
        assert_eq!(total, expected);
    }

    let count = run_result({
        let tickets = tickets.clone();
        move || tickets.count()
    })
    .unwrap();
    assert_eq!(count as usize, snapshot.len());

    let handle_slot = Mutex::new(Some(handle));
    run(move || {
        if let Some(h) = handle_slot.lock().unwrap().take() {
            h.dispose()?;
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn e3_independent_commutes_never_retry_each_other() {
    const M: usize = 300;

    let x = Cell::new(0i64);
    let y = Cell::new(0i64);
    let invocations_x = Arc::new(AtomicUsize::new(0));
    let invocations_y = Arc::new(AtomicUsize::new(0));

    let xc = x.clone();
    let inv_x = invocations_x.clone();
    let t1 = thread::spawn(move || {
        for _ in 0..M {
            let xc = xc.clone();
            let inv_x = inv_x.clone();
            run(move || {
                inv_x.fetch_add(1, Ordering::SeqCst);
                xc.commute(|v| *v += 1)
            })
            .unwrap();
        }
    });

    let yc = y.clone();
    let inv_y = invocations_y.clone();
    let t2 = thread::spawn(move || {
        for _ in 0..M {
            let yc = yc.clone();
            let inv_y = inv_y.clone();
            run(move || {
                inv_y.fetch_add(1, Ordering::SeqCst);
                yc.commute(|v| *v += 1)
            })
            .unwrap();
        }
    });

    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(x.get().unwrap(), M as i64);
    assert_eq!(y.get().unwrap(), M as i64);
    // Each loop body ran exactly M times: no cross-thread retry inflated
    // either counter, since x and y never overlap.
    assert_eq!(invocations_x.load(Ordering::SeqCst), M);
    assert_eq!(invocations_y.load(Ordering::SeqCst), M);
}

#[test]
fn e4_conditional_fires_exactly_once() {
    let c = Cell::new(0i64);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle_slot: Arc<Mutex<Option<cellstm::Handle>>> = Arc::new(Mutex::new(None));

    let c_test = c.clone();
    let c_trans = c.clone();
    let fired_trans = fired.clone();
    let slot_trans = handle_slot.clone();
    let handle = cellstm::conditional(
        move || Ok(c_test.get()? >= 10),
        move || {
            fired_trans.fetch_add(1, Ordering::SeqCst);
            c_trans.set(-1)?;
            if let Some(h) = slot_trans.lock().unwrap().take() {
                h.dispose()?;
            }
            Ok(())
        },
    )
    .unwrap();
    *handle_slot.lock().unwrap() = Some(handle);

    for _ in 0..20 {
        let c = c.clone();
        run(move || c.commute(|v| *v += 1)).unwrap();
    }

    assert_eq!(c.get().unwrap(), -1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn e5_rollback_leaves_no_trace_for_concurrent_readers() {
    let a = Cell::new(0i64);
    let b = Cell::new(0i64);

    let stop = Arc::new(AtomicBool::new(false));
    let reader_a = a.clone();
    let reader_stop = stop.clone();
    let reader = thread::spawn(move || {
        while !reader_stop.load(Ordering::SeqCst) {
            assert_ne!(reader_a.get().unwrap(), 5, "a concurrent reader observed a rolled-back value");
        }
    });

    Runtime::set_retry_policy(RetryPolicy::Abort);
    let ca = a.clone();
    let cb = b.clone();
    let result = run_result(move || {
        ca.set(5)?;
        cb.set(7)?;
        cellstm::rollback_and_retry()
    });
    Runtime::set_retry_policy(RetryPolicy::Retry);
    assert!(matches!(result, Err(TxError::Retry)));

    stop.store(true, Ordering::SeqCst);
    reader.join().unwrap();

    assert_eq!(a.get().unwrap(), 0);
    assert_eq!(b.get().unwrap(), 0);
}

#[test]
fn e6_trim_keeps_the_reachable_chain_bounded() {
    let cell = Cell::new(0i64);
    Runtime::with_trim_interval(4);

    for i in 1..=2000i64 {
        let c = cell.clone();
        run_result(move || c.set(i)).unwrap();
        if i % 250 == 0 {
            let len = cell.chain_len();
            assert!(len < 50, "version chain grew unbounded: {} nodes after {} commits", len, i);
        }
    }
}
