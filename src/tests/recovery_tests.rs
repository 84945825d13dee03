/// 恢复测试模块
/// 测试崩溃与干净关闭后的两遍并行恢复
use crate::{
    AdvancerKind, EpochSys, EpochSysBuilder, INIT_EPOCH, PersistentHeap, RecoveryError,
    SetupError, SimHeap, WriteBackStrategy,
};
use std::collections::HashMap;
use std::sync::Arc;

fn builder() -> EpochSysBuilder {
    EpochSys::builder().advancer(AdvancerKind::No)
}

fn open(heap: &Arc<SimHeap>) -> EpochSys<Arc<SimHeap>> {
    builder().open(Arc::clone(heap)).unwrap()
}

fn payload(heap: &SimHeap, blk: crate::BlockId) -> Vec<u8> {
    heap.read(blk, |b| b.payload().to_vec()).unwrap()
}

fn id_of(heap: &SimHeap, blk: crate::BlockId) -> u64 {
    heap.read(blk, |b| b.id()).unwrap()
}

/// 测试1: 干净关闭后重新打开，只保留存活记录
#[test]
fn test_clean_reopen() {
    let heap = Arc::new(SimHeap::new());
    let a_id = {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let (a, b) = w.run_op(|op| Ok((op.pnew(b"a".to_vec()), op.pnew(b"b".to_vec()))));
        w.run_op(|op| {
            let c = op.pnew(b"c".to_vec());
            op.pdelete(c)
        });
        sys.sync();
        w.run_op(|op| op.pdelete(b));
        id_of(&heap, a)
    };

    heap.restart();
    let sys = open(&heap);
    let report = sys.recovery_report().unwrap().clone();
    assert!(!report.dirty);
    assert_eq!(report.kept, 1);
    assert_eq!(report.tombstones, 0);
    assert_eq!(sys.current_epoch(), report.recovered_epoch + 1);

    let recovered = sys.recovered_blocks().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(payload(&heap, recovered[&a_id]), b"a");

    // Fresh ids do not collide with recovered ones.
    let w = sys.register_worker(0);
    let fresh = w.run_op(|op| Ok(op.pnew(b"d".to_vec())));
    assert!(id_of(&heap, fresh) > a_id);
}

/// 测试2: 崩溃时尚未持久化的写时复制更新丢失，旧版本保留
#[test]
fn test_crash_loses_unpersisted_update() {
    let heap = Arc::new(SimHeap::new());
    let a_id = {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let a = w.run_op(|op| Ok(op.pnew(b"v1".to_vec())));
        sys.sync();
        let (copy, ()) = w.run_op(|op| op.write(a, |data| *data = b"v2".to_vec()));
        assert_ne!(copy, a);
        drop(w);
        sys.crash();
        id_of(&heap, a)
    };
    heap.simulate_crash();

    let sys = open(&heap);
    let report = sys.recovery_report().unwrap();
    assert!(report.dirty);
    assert_eq!(report.recovered_epoch, 5);
    assert_eq!(report.kept, 1);
    let recovered = sys.recovered_blocks().unwrap();
    assert_eq!(payload(&heap, recovered[&a_id]), b"v1");
    // The epoch block and the old version are all that is left.
    assert_eq!(heap.live_count(), 2);
}

/// 测试3: 同步后崩溃，新版本胜出
#[test]
fn test_crash_after_sync_keeps_update() {
    let heap = Arc::new(SimHeap::new());
    let a_id = {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let a = w.run_op(|op| Ok(op.pnew(b"v1".to_vec())));
        sys.sync();
        w.run_op(|op| op.write(a, |data| *data = b"v2".to_vec()));
        sys.sync();
        // The superseded version is freed on entering epoch 7.
        assert!(!heap.is_live(a));
        drop(w);
        sys.crash();
        id_of(&heap, a)
    };
    heap.simulate_crash();

    let sys = open(&heap);
    let report = sys.recovery_report().unwrap();
    assert_eq!(report.recovered_epoch, 7);
    assert_eq!(report.kept, 1);
    assert_eq!(payload(&heap, sys.recovered_blocks().unwrap()[&a_id]), b"v2");
    assert_eq!(heap.live_count(), 2);
}

/// 测试4: 已持久化纪元内的墓碑删除记录，恢复后只剩纪元块
#[test]
fn test_tombstone_deletes_record() {
    let heap = Arc::new(SimHeap::new());
    {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let a = w.run_op(|op| Ok(op.pnew(b"gone".to_vec())));
        sys.sync();
        w.run_op(|op| op.pdelete(a));
        sys.sync();
        // The record is gone; its tombstone outlives it by one epoch.
        assert!(!heap.is_live(a));
        assert_eq!(heap.live_count(), 2);
        drop(w);
        sys.crash();
    }
    heap.simulate_crash();

    let sys = open(&heap);
    let report = sys.recovery_report().unwrap();
    assert_eq!(report.recovered_epoch, 7);
    assert_eq!(report.kept, 0);
    assert_eq!(report.tombstones, 1);
    assert_eq!(report.premature_tombstones, 0);
    assert!(sys.recovered_blocks().unwrap().is_empty());
    assert_eq!(heap.live_count(), 1);
}

/// 测试5: 过早的墓碑被忽略，记录保留
#[test]
fn test_premature_tombstone_ignored() {
    let heap = Arc::new(SimHeap::new());
    let a_id = {
        let sys = builder()
            .write_back(WriteBackStrategy::DirWB)
            .open(Arc::clone(&heap))
            .unwrap();
        let w = sys.register_worker(0);
        let a = w.run_op(|op| Ok(op.pnew(b"kept".to_vec())));
        sys.set_epoch(5);
        w.run_op(|op| op.pdelete(a));
        drop(w);
        sys.crash();
        id_of(&heap, a)
    };
    heap.simulate_crash();

    let sys = open(&heap);
    let report = sys.recovery_report().unwrap();
    assert_eq!(report.recovered_epoch, 5);
    assert_eq!(report.premature_tombstones, 1);
    assert_eq!(report.tombstones, 0);
    assert_eq!(payload(&heap, sys.recovered_blocks().unwrap()[&a_id]), b"kept");
    // The ignored tombstone is returned to the heap as well.
    assert_eq!(heap.live_count(), 2);
}

/// 测试6: 重启一个从未使用过的堆等同于全新启动
#[test]
fn test_empty_heap_is_fresh_start() {
    let heap = Arc::new(SimHeap::new());
    heap.restart();
    let sys = open(&heap);
    assert_eq!(sys.current_epoch(), INIT_EPOCH);
    assert!(sys.recovered_blocks().unwrap().is_empty());
    assert_eq!(sys.recovery_report().unwrap().resumed_epoch, INIT_EPOCH);

    let w = sys.register_worker(0);
    let blk = w.run_op(|op| Ok(op.pnew(vec![1])));
    assert_eq!(id_of(&heap, blk), 1);
}

/// 测试7: 缺少或重复的纪元块使恢复失败
#[test]
fn test_bad_epoch_blocks() {
    let heap = Arc::new(SimHeap::new());
    heap.allocate(crate::PBlk::new(vec![1, 2, 3]));
    heap.restart();
    assert!(matches!(
        builder().open(Arc::clone(&heap)),
        Err(SetupError::Recovery(RecoveryError::MissingEpochBlock))
    ));

    let heap = Arc::new(SimHeap::new());
    drop(open(&heap));
    // A second engine on the same image without a restart adds its own.
    drop(open(&heap));
    heap.restart();
    assert!(matches!(
        builder().open(Arc::clone(&heap)),
        Err(SetupError::Recovery(RecoveryError::DuplicateEpochBlock { count: 2 }))
    ));
}

/// 测试8: 多线程恢复大量记录，包含更新与删除
#[test]
fn test_parallel_recovery() {
    let heap = Arc::new(SimHeap::new());
    let expected: HashMap<u64, Option<Vec<u8>>> = {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let mut records: Vec<(u64, crate::BlockId)> = Vec::new();
        for chunk in 0..10u8 {
            w.run_op(|op| {
                for j in 0..10u8 {
                    let i = chunk * 10 + j;
                    let blk = op.pnew(vec![i, 0]);
                    records.push((id_of(&heap, blk), blk));
                }
                Ok(())
            });
        }
        sys.sync();

        let mut expected = HashMap::new();
        for (i, (id, blk)) in records.iter_mut().enumerate() {
            let i = i as u8;
            if i % 3 == 0 {
                let (copy, ()) = w.run_op(|op| op.write(*blk, |data| data[1] = 1));
                *blk = copy;
                expected.insert(*id, Some(vec![i, 1]));
            } else {
                expected.insert(*id, Some(vec![i, 0]));
            }
            if i % 5 == 0 {
                w.run_op(|op| op.pdelete(*blk));
                expected.insert(*id, None);
            }
        }
        sys.sync();
        drop(w);
        sys.crash();
        expected
    };
    heap.simulate_crash();

    let sys = builder()
        .recovery_threads(4)
        .open(Arc::clone(&heap))
        .unwrap();
    let report = sys.recovery_report().unwrap();
    assert_eq!(report.kept, 80);
    assert_eq!(report.tombstones, 20);

    let recovered = sys.recovered_blocks().unwrap();
    for (id, want) in &expected {
        match want {
            Some(data) => assert_eq!(&payload(&heap, recovered[id]), data, "record {id}"),
            None => assert!(!recovered.contains_key(id), "record {id} was deleted"),
        }
    }
    // Records plus the epoch block.
    assert_eq!(heap.live_count(), 81);
}

/// 测试9: 所有者被删除后，从属块一并丢弃
#[test]
fn test_orphaned_owned_block_dropped() {
    let heap = Arc::new(SimHeap::new());
    let (owner_id, child_id, owner2_id, child2_id) = {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let (owner, child, owner2, child2) = w.run_op(|op| {
            let owner = op.pnew(b"owner".to_vec());
            let child = op.pnew_owned(owner, b"child".to_vec());
            let owner2 = op.pnew(b"owner2".to_vec());
            let child2 = op.pnew_owned(owner2, b"child2".to_vec());
            Ok((owner, child, owner2, child2))
        });
        sys.sync();
        w.run_op(|op| op.pdelete(owner));
        sys.sync();
        drop(w);
        sys.crash();
        (
            id_of(&heap, owner),
            id_of(&heap, child),
            id_of(&heap, owner2),
            id_of(&heap, child2),
        )
    };
    heap.simulate_crash();

    let sys = open(&heap);
    let recovered = sys.recovered_blocks().unwrap();
    assert!(!recovered.contains_key(&owner_id));
    assert!(!recovered.contains_key(&child_id));
    assert_eq!(payload(&heap, recovered[&owner2_id]), b"owner2");
    assert_eq!(payload(&heap, recovered[&child2_id]), b"child2");
    assert_eq!(sys.recovery_report().unwrap().kept, 2);
}

/// 测试10: 恢复后的引擎可以继续正常工作并再次恢复
#[test]
fn test_recover_twice() {
    let heap = Arc::new(SimHeap::new());
    let a_id = {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let a = w.run_op(|op| Ok(op.pnew(b"first".to_vec())));
        id_of(&heap, a)
    };
    heap.restart();

    let b_id = {
        let sys = open(&heap);
        let w = sys.register_worker(0);
        let a = sys.recovered_blocks().unwrap()[&a_id];
        let (a, ()) = w.run_op(|op| op.write(a, |data| *data = b"second".to_vec()));
        let b = w.run_op(|op| Ok(op.pnew(b"other".to_vec())));
        sys.sync();
        assert_eq!(id_of(&heap, a), a_id);
        drop(w);
        sys.crash();
        id_of(&heap, b)
    };
    heap.simulate_crash();

    let sys = open(&heap);
    let recovered = sys.recovered_blocks().unwrap();
    assert_eq!(recovered.len(), 2);
    assert_eq!(payload(&heap, recovered[&a_id]), b"second");
    assert_eq!(payload(&heap, recovered[&b_id]), b"other");
}
