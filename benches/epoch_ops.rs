use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nvm_epoch::{AdvancerKind, EpochSys, SimHeap, TransTrackerKind};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const TRACKERS: [TransTrackerKind; 4] = [
    TransTrackerKind::CurrEpoch,
    TransTrackerKind::AtomicCounter,
    TransTrackerKind::ActiveThread,
    TransTrackerKind::NoFence,
];

// Benchmark 1: Single-threaded begin/end of an empty operation
fn bench_empty_op(c: &mut Criterion) {
    let mut group = c.benchmark_group("empty_op");

    for tracker in TRACKERS {
        group.bench_with_input(
            BenchmarkId::new("nvm_epoch", format!("{tracker:?}")),
            &tracker,
            |b, &tracker| {
                let sys = EpochSys::builder()
                    .trans_tracker(tracker)
                    .advancer(AdvancerKind::No)
                    .open(SimHeap::new())
                    .unwrap();
                let worker = sys.register_worker(0);
                b.iter(|| {
                    let op = worker.begin_op();
                    black_box(op.epoch());
                    op.end();
                });
            },
        );
    }

    group.bench_function("crossbeam_epoch_pin", |b| {
        b.iter(|| {
            let guard = crossbeam_epoch::pin();
            black_box(&guard);
        });
    });

    group.finish();
}

// Benchmark 2: Read-only operations
fn bench_readonly_op(c: &mut Criterion) {
    c.bench_function("readonly_op_read_block", |b| {
        let sys = EpochSys::builder()
            .advancer(AdvancerKind::No)
            .open(SimHeap::new())
            .unwrap();
        let worker = sys.register_worker(0);
        let blk = worker.run_op(|op| Ok(op.pnew(vec![7; 64])));
        b.iter(|| {
            let op = worker.begin_readonly_op();
            black_box(op.read(blk, |data| data[0]).unwrap());
            op.end();
        });
    });
}

// Benchmark 3: Operations while other threads keep the epoch moving
fn bench_op_with_dedicated_advancer(c: &mut Criterion) {
    let mut group = c.benchmark_group("op_under_contention");

    for threads in [1usize, 2, 4] {
        group.bench_with_input(
            BenchmarkId::new("nvm_epoch", threads),
            &threads,
            |b, &threads| {
                let sys = Arc::new(
                    EpochSys::builder()
                        .task_num(threads + 1)
                        .epoch_length(std::time::Duration::from_millis(1))
                        .open(SimHeap::new())
                        .unwrap(),
                );
                let stop = Arc::new(AtomicBool::new(false));
                let background: Vec<_> = (1..=threads)
                    .map(|tid| {
                        let sys = Arc::clone(&sys);
                        let stop = Arc::clone(&stop);
                        thread::spawn(move || {
                            let worker = sys.register_worker(tid);
                            while !stop.load(Ordering::Relaxed) {
                                worker.run_op(|op| {
                                    black_box(op.epoch());
                                    Ok(())
                                });
                            }
                        })
                    })
                    .collect();

                let worker = sys.register_worker(0);
                b.iter(|| {
                    worker.run_op(|op| {
                        black_box(op.epoch());
                        Ok(())
                    })
                });

                stop.store(true, Ordering::Relaxed);
                for handle in background {
                    let _ = handle.join();
                }
            },
        );

        group.bench_with_input(
            BenchmarkId::new("crossbeam_epoch", threads),
            &threads,
            |b, &threads| {
                let stop = Arc::new(AtomicBool::new(false));
                let background: Vec<_> = (0..threads)
                    .map(|_| {
                        let stop = Arc::clone(&stop);
                        thread::spawn(move || {
                            while !stop.load(Ordering::Relaxed) {
                                let guard = crossbeam_epoch::pin();
                                guard.flush();
                            }
                        })
                    })
                    .collect();

                b.iter(|| {
                    let guard = crossbeam_epoch::pin();
                    black_box(&guard);
                });

                stop.store(true, Ordering::Relaxed);
                for handle in background {
                    let _ = handle.join();
                }
            },
        );
    }

    group.finish();
}

// Benchmark 4: Cost of one epoch boundary
fn bench_advance_epoch(c: &mut Criterion) {
    c.bench_function("advance_epoch_idle", |b| {
        let sys = EpochSys::builder()
            .advancer(AdvancerKind::No)
            .open(SimHeap::new())
            .unwrap();
        b.iter(|| sys.advance_epoch());
    });
}

criterion_group!(
    benches,
    bench_empty_op,
    bench_readonly_op,
    bench_op_with_dedicated_advancer,
    bench_advance_epoch
);
criterion_main!(benches);
