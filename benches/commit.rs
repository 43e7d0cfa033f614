// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use cellstm::Cell;
use criterion::{criterion_group, criterion_main, Criterion};

/// Single-cell commit throughput, uncontended: one thread repeatedly
/// committing a trivial increment. Exercises the commit mutex's critical
/// section (validate + advance clock + stamp) in isolation.
fn bench_single_cell_commit(c: &mut Criterion) {
    let cell = Cell::new(0i64);

    c.bench_function("commit_single_cell", |b| {
        b.iter(|| {
            let cell = cell.clone();
            cellstm::run(move || cell.modify(|v| *v += 1)).expect("commit failed");
        })
    });
}

/// Commit throughput under contention: several threads committing against
/// the same cell concurrently, each retrying on conflict.
fn bench_contended_cell_commit(c: &mut Criterion) {
    let cell = Cell::new(0i64);

    c.bench_function("commit_contended_cell_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cell = cell.clone();
                    std::thread::spawn(move || {
                        cellstm::run(move || cell.modify(|v| *v += 1)).expect("commit failed");
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        })
    });
}

/// Commute throughput: commutes on independent cells never retry each other,
/// so this should scale close to linearly with thread count.
fn bench_commute_independent_cells(c: &mut Criterion) {
    let a = Cell::new(0i64);
    let b = Cell::new(0i64);

    c.bench_function("commit_commute_two_independent_cells", |bencher| {
        bencher.iter(|| {
            let a1 = a.clone();
            let b1 = b.clone();
            let t1 = std::thread::spawn(move || {
                cellstm::run(move || a1.commute(|v| *v += 1)).expect("commit failed");
            });
            let t2 = std::thread::spawn(move || {
                cellstm::run(move || b1.commute(|v| *v += 1)).expect("commit failed");
            });
            t1.join().unwrap();
            t2.join().unwrap();
        })
    });
}

criterion_group!(
    commit_benches,
    bench_single_cell_commit,
    bench_contended_cell_commit,
    bench_commute_independent_cells
);
criterion_main!(commit_benches);
