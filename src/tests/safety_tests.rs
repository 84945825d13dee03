/// 回收安全测试模块
/// 通过包装 SimHeap 检查：块只在危险窗口内没有活跃事务时释放，且只在新纪元持久化之后释放
use crate::block::decode_epoch;
use crate::{
    AdvancerKind, BlkType, BlockId, EngineMode, EpochError, EpochSys, EpochSysBuilder,
    FreeStrategy, HeapRecovery, NULL_EPOCH, OpGuard, PBlk, PersistentHeap, SimHeap,
    TransTrackerKind, Worker, WriteBackStrategy,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// A `SimHeap` that watches every deallocation and can hold the thread that
/// writes the epoch block.
struct InstrumentedHeap {
    inner: SimHeap,
    /// Epoch of the operation each worker is inside, `NULL_EPOCH` otherwise.
    /// Set after the operation began and cleared before it ends.
    active: Vec<AtomicU64>,
    checked: AtomicU64,
    violations: AtomicU64,
    pause_epoch_write: AtomicBool,
    paused: AtomicBool,
    resume: AtomicBool,
}

impl InstrumentedHeap {
    fn new(task_num: usize) -> Self {
        Self {
            inner: SimHeap::new(),
            active: (0..task_num).map(|_| AtomicU64::new(NULL_EPOCH)).collect(),
            checked: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            pause_epoch_write: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume: AtomicBool::new(false),
        }
    }

    /// Epoch a restart would recover right now.
    fn durable_epoch(&self) -> Option<u64> {
        self.inner
            .live_blocks()
            .into_iter()
            .find(|(_, b)| b.blktype() == BlkType::Epoch)
            .and_then(|(id, _)| self.inner.durable(id))
            .and_then(|b| decode_epoch(b.payload()))
    }

    fn wait_paused(&self) {
        while !self.paused.load(Ordering::SeqCst) {
            thread::yield_now();
        }
    }
}

impl PersistentHeap for InstrumentedHeap {
    type Cursor = <SimHeap as PersistentHeap>::Cursor;

    fn allocate(&self, blk: PBlk) -> BlockId {
        self.inner.allocate(blk)
    }

    fn deallocate(&self, id: BlockId) {
        let epoch = self.inner.read(id, |b| b.epoch()).unwrap_or(NULL_EPOCH);
        if epoch != NULL_EPOCH {
            self.checked.fetch_add(1, Ordering::SeqCst);
            let danger = epoch.saturating_sub(1)..=epoch;
            if self
                .active
                .iter()
                .any(|slot| danger.contains(&slot.load(Ordering::SeqCst)))
            {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.deallocate(id);
    }

    fn malloc_size(&self, id: BlockId) -> Option<usize> {
        self.inner.malloc_size(id)
    }

    fn read<R>(&self, id: BlockId, f: impl FnOnce(&PBlk) -> R) -> Option<R> {
        self.inner.read(id, f)
    }

    fn write<R>(&self, id: BlockId, f: impl FnOnce(&mut PBlk) -> R) -> Option<R> {
        let out = self.inner.write(id, f);
        if self.pause_epoch_write.load(Ordering::SeqCst)
            && self.inner.read(id, |b| b.blktype()) == Some(BlkType::Epoch)
            && self.pause_epoch_write.swap(false, Ordering::SeqCst)
        {
            self.paused.store(true, Ordering::SeqCst);
            while !self.resume.swap(false, Ordering::SeqCst) {
                thread::yield_now();
            }
        }
        out
    }

    fn write_back(&self, id: BlockId, len: usize) {
        self.inner.write_back(id, len)
    }

    fn fence(&self) {
        self.inner.fence()
    }

    fn is_restart(&self) -> bool {
        self.inner.is_restart()
    }

    fn recover(&self, threads: usize) -> HeapRecovery<Self::Cursor> {
        self.inner.recover(threads)
    }

    fn close(&self) {
        self.inner.close()
    }
}

type Heap = Arc<InstrumentedHeap>;

/// Run `f` as an operation whose epoch is visible to the heap's checks.
fn tracked_op<T>(
    heap: &InstrumentedHeap,
    w: &Worker<Heap>,
    mut f: impl FnMut(&OpGuard<'_, Heap>) -> Result<T, EpochError>,
) -> T {
    let slot = &heap.active[w.tid()];
    w.run_op(|op| {
        slot.store(op.epoch(), Ordering::SeqCst);
        let out = f(op);
        slot.store(NULL_EPOCH, Ordering::SeqCst);
        out
    })
}

/// Write `v1` at epoch 3 and `v2` over it at epoch 5, then hold the advancer
/// while it writes epoch 7 and let the worker start an operation meanwhile.
/// `v1` may only be gone once epoch 7 is durable, or a crash would lose the
/// record.
fn check_free_after_durable_epoch(builder: EpochSysBuilder) {
    let heap = Arc::new(InstrumentedHeap::new(1));
    let builder = builder.task_num(1).advancer(AdvancerKind::No);
    let id = {
        let sys = builder.clone().open(Arc::clone(&heap)).unwrap();
        let w = sys.register_worker(0);
        let v1 = w.run_op(|op| Ok(op.pnew(b"v1".to_vec())));
        let id = heap.read(v1, |b| b.id()).unwrap();
        sys.set_epoch(5);
        let (v2, ()) = w.run_op(|op| op.write(v1, |data| *data = b"v2".to_vec()));
        assert_ne!(v2, v1);

        sys.advance_epoch();
        w.begin_readonly_op().end();
        assert!(heap.inner.is_live(v1));

        heap.pause_epoch_write.store(true, Ordering::SeqCst);
        let (v1_live, durable) = thread::scope(|s| {
            s.spawn(|| sys.advance_epoch());
            heap.wait_paused();
            w.begin_readonly_op().end();
            let seen = (heap.inner.is_live(v1), heap.durable_epoch());
            heap.resume.store(true, Ordering::SeqCst);
            seen
        });
        assert!(
            v1_live || durable >= Some(7),
            "v1 freed while the durable epoch was {durable:?}"
        );

        assert_eq!(sys.current_epoch(), 7);
        w.begin_readonly_op().end();
        assert!(!heap.inner.is_live(v1));
        drop(w);
        sys.crash();
        id
    };
    heap.inner.simulate_crash();

    let sys = builder.open(Arc::clone(&heap)).unwrap();
    assert_eq!(sys.recovery_report().unwrap().recovered_epoch, 7);
    let blk = sys.recovered_blocks().unwrap()[&id];
    assert_eq!(heap.read(blk, |b| b.payload().to_vec()).unwrap(), b"v2");
}

/// 测试1: 线程本地回收不会在新纪元持久化之前释放旧版本
#[test]
fn test_thread_local_free_waits_for_durable_epoch() {
    check_free_after_durable_epoch(
        EpochSys::builder()
            .write_back(WriteBackStrategy::DirWB)
            .free(FreeStrategy::ThreadLocal),
    );
}

/// 测试2: 按纪元回收不会在新纪元持久化之前释放旧版本
#[test]
fn test_per_epoch_free_waits_for_durable_epoch() {
    check_free_after_durable_epoch(EpochSys::builder().write_back(WriteBackStrategy::DirWB));
}

/// 测试3: 非阻塞引擎同样只在新纪元持久化后释放
#[test]
fn test_nonblocking_free_waits_for_durable_epoch() {
    check_free_after_durable_epoch(
        EpochSys::builder()
            .mode(EngineMode::Nonblocking)
            .write_back(WriteBackStrategy::DirWB)
            .free(FreeStrategy::ThreadLocal),
    );
}

/// 测试4: 并发负载下，释放块时其危险窗口内没有活跃事务
#[test]
fn test_no_free_inside_danger_window() {
    const THREADS: usize = 4;
    const RECORDS: u8 = 60;

    let configs: Vec<(&str, EpochSysBuilder)> = vec![
        ("per_epoch", EpochSys::builder()),
        (
            "thread_local",
            EpochSys::builder().free(FreeStrategy::ThreadLocal),
        ),
        (
            "atomic_counter",
            EpochSys::builder().trans_tracker(TransTrackerKind::AtomicCounter),
        ),
        (
            "nonblocking",
            EpochSys::builder()
                .mode(EngineMode::Nonblocking)
                .free(FreeStrategy::ThreadLocal),
        ),
    ];

    for (name, builder) in configs {
        let heap = Arc::new(InstrumentedHeap::new(THREADS));
        {
            let sys = builder
                .task_num(THREADS)
                .epoch_length(Duration::from_millis(1))
                .open(Arc::clone(&heap))
                .unwrap();
            thread::scope(|s| {
                for tid in 0..THREADS {
                    let sys = &sys;
                    let heap = &*heap;
                    s.spawn(move || {
                        let w = sys.register_worker(tid);
                        for i in 0..RECORDS {
                            let mut blk = tracked_op(heap, &w, |op| Ok(op.pnew(vec![i, 0])));
                            for round in 1..=2u8 {
                                blk = tracked_op(heap, &w, |op| {
                                    op.write(blk, |data| data[1] = round)
                                })
                                .0;
                            }
                            if i % 2 == 0 {
                                tracked_op(heap, &w, |op| op.pdelete(blk));
                            } else {
                                tracked_op(heap, &w, |op| op.retire(blk));
                                w.preclaim(blk);
                            }
                        }
                    });
                }
            });
        }
        assert!(heap.checked.load(Ordering::SeqCst) > 0, "{name}");
        assert_eq!(heap.violations.load(Ordering::SeqCst), 0, "{name}");
    }
}
