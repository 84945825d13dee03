/// 并发测试模块
/// 测试多个工作线程在纪元不断推进时的写入、读取与恢复
use crate::{
    AdvancerKind, BlockId, EngineMode, EpochSys, EpochSysBuilder, FreeStrategy, INIT_EPOCH,
    PersistentHeap, SimHeap, TransTrackerKind, WriteBackStrategy,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const THREADS: usize = 4;
const RECORDS: u8 = 50;

fn fast_epochs() -> EpochSysBuilder {
    EpochSys::builder()
        .task_num(THREADS)
        .epoch_length(Duration::from_millis(1))
}

/// Every thread creates its own records, updates each a few times and
/// deletes half of them. Returns the expected payload per record id.
fn run_workload(sys: &Arc<EpochSys<Arc<SimHeap>>>) -> HashMap<u64, Vec<u8>> {
    let mut handles = vec![];
    for tid in 0..THREADS {
        let sys = Arc::clone(sys);
        handles.push(thread::spawn(move || {
            let heap = Arc::clone(sys.heap());
            let w = sys.register_worker(tid);
            let mut live = HashMap::new();
            for i in 0..RECORDS {
                let mut blk = w.run_op(|op| Ok(op.pnew(vec![tid as u8, i, 0])));
                let id = heap.read(blk, |b| b.id()).unwrap();
                for round in 1..=3u8 {
                    blk = w.run_op(|op| op.write(blk, |data| data[2] = round)).0;
                }
                if i % 2 == 0 {
                    w.run_op(|op| op.pdelete(blk));
                } else {
                    live.insert(id, vec![tid as u8, i, 3]);
                }
            }
            live
        }));
    }
    let mut expected = HashMap::new();
    for handle in handles {
        expected.extend(handle.join().unwrap());
    }
    expected
}

fn check_recovered(heap: &Arc<SimHeap>, sys: &EpochSys<Arc<SimHeap>>, expected: &HashMap<u64, Vec<u8>>) {
    let recovered = sys.recovered_blocks().unwrap();
    assert_eq!(recovered.len(), expected.len());
    for (id, data) in expected {
        let blk = recovered[id];
        assert_eq!(&heap.read(blk, |b| b.payload().to_vec()).unwrap(), data, "record {id}");
    }
}

/// 测试1: 多个工作线程并发写入，干净关闭后恢复全部存活记录
#[test]
fn test_concurrent_workload_then_clean_restart() {
    let configs: Vec<(&str, EpochSysBuilder)> = vec![
        ("buffered", fast_epochs()),
        ("direct", fast_epochs().write_back(WriteBackStrategy::DirWB)),
        (
            "per_epoch_thread_local",
            fast_epochs()
                .write_back(WriteBackStrategy::PerEpoch)
                .free(FreeStrategy::ThreadLocal)
                .trans_tracker(TransTrackerKind::ActiveThread),
        ),
        (
            "nonblocking",
            fast_epochs()
                .mode(EngineMode::Nonblocking)
                .free(FreeStrategy::ThreadLocal),
        ),
    ];

    for (name, builder) in configs {
        let heap = Arc::new(SimHeap::new());
        let expected = {
            let sys = Arc::new(builder.clone().open(Arc::clone(&heap)).unwrap());
            run_workload(&sys)
        };
        assert_eq!(expected.len(), THREADS * RECORDS as usize / 2, "{name}");

        heap.restart();
        let sys = builder.advancer(AdvancerKind::No).open(Arc::clone(&heap)).unwrap();
        assert!(!sys.recovery_report().unwrap().dirty, "{name}");
        check_recovered(&heap, &sys, &expected);
    }
}

/// 测试2: 并发写入后同步再崩溃，所有已完成的操作都能恢复
#[test]
fn test_concurrent_workload_then_crash() {
    let heap = Arc::new(SimHeap::new());
    let expected = {
        let sys = Arc::new(fast_epochs().open(Arc::clone(&heap)).unwrap());
        let expected = run_workload(&sys);
        sys.sync();
        match Arc::try_unwrap(sys) {
            Ok(sys) => sys.crash(),
            Err(_) => panic!("workers still hold the engine"),
        }
        expected
    };
    heap.simulate_crash();

    let sys = EpochSys::builder()
        .task_num(THREADS)
        .advancer(AdvancerKind::No)
        .recovery_threads(3)
        .open(Arc::clone(&heap))
        .unwrap();
    assert!(sys.recovery_report().unwrap().dirty);
    check_recovered(&heap, &sys, &expected);
}

/// 测试3: 一个写入者不断更新记录，多个读取者观察到单调递增的值
#[test]
fn test_single_writer_multiple_readers() {
    let heap = Arc::new(SimHeap::new());
    let sys = Arc::new(fast_epochs().open(Arc::clone(&heap)).unwrap());
    let w = sys.register_worker(0);
    let first = w.run_op(|op| Ok(op.pnew(0u64.to_le_bytes().to_vec())));
    let handle = Arc::new(AtomicU64::new(first.to_raw()));
    let done = Arc::new(AtomicBool::new(false));

    let mut readers = vec![];
    for tid in 1..THREADS {
        let sys = Arc::clone(&sys);
        let handle = Arc::clone(&handle);
        let done = Arc::clone(&done);
        readers.push(thread::spawn(move || {
            let r = sys.register_worker(tid);
            let mut last = 0;
            while !done.load(Ordering::SeqCst) {
                let value = r.run_op(|op| {
                    let blk = BlockId::from_raw(handle.load(Ordering::SeqCst));
                    op.read(blk, |data| u64::from_le_bytes(data.try_into().unwrap()))
                });
                assert!(value >= last, "went back from {last} to {value}");
                last = value;
            }
            last
        }));
    }

    for _ in 0..1000 {
        w.run_op(|op| {
            let blk = BlockId::from_raw(handle.load(Ordering::SeqCst));
            let (new, ()) = op.write(blk, |data| {
                let value = u64::from_le_bytes(data.as_slice().try_into().unwrap()) + 1;
                data.copy_from_slice(&value.to_le_bytes());
            })?;
            handle.store(new.to_raw(), Ordering::SeqCst);
            Ok(())
        });
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().unwrap() <= 1000);
    }
    let final_blk = BlockId::from_raw(handle.load(Ordering::SeqCst));
    assert_eq!(w.run_op(|op| op.read(final_blk, |data| data.to_vec())), 1000u64.to_le_bytes());
}

/// 测试4: 工作线程协作推进纪元
#[test]
fn test_cooperative_advancers() {
    for advancer in [
        AdvancerKind::SingleThread { epoch_freq: 20 },
        AdvancerKind::GlobalCounter {
            epoch_freq: 50,
            help_freq: 10,
        },
    ] {
        let heap = Arc::new(SimHeap::new());
        let sys = Arc::new(
            EpochSys::builder()
                .task_num(THREADS)
                .advancer(advancer)
                .open(Arc::clone(&heap))
                .unwrap(),
        );

        let mut handles = vec![];
        for tid in 0..THREADS {
            let sys = Arc::clone(&sys);
            handles.push(thread::spawn(move || {
                let w = sys.register_worker(tid);
                (0..500u32)
                    .map(|i| w.run_op(|op| Ok(op.pnew(i.to_le_bytes().to_vec()))))
                    .collect::<Vec<_>>()
            }));
        }
        let blocks: Vec<BlockId> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        assert!(sys.current_epoch() > INIT_EPOCH, "{advancer:?}");
        sys.sync();
        assert!(
            blocks.iter().all(|&blk| heap.durable(blk).is_some()),
            "{advancer:?}"
        );
    }
}
