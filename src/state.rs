//! Shared engine state and the epoch protocol.
//!
//! Every operation here takes the caller's transaction epoch `c` and thread
//! id explicitly. [`Worker`](crate::Worker) and [`OpGuard`](crate::OpGuard)
//! supply both and keep them consistent.
//!
//! # Logging
//! - `debug` (`nvm_epoch::advancer`): every epoch boundary with its duration.
//!
//! 共享的引擎状态与纪元协议。这里的每个操作都显式接收调用者的事务纪元 `c` 和线程 id。

use crate::advancer::EpochAdvancer;
use crate::block::{
    BlkType, BlockId, NULL_EPOCH, PBLK_HEADER_SIZE, PBlk, RECLAIM_LAG, UidGenerator,
    encode_desc, encode_epoch, pack_tid_sn,
};
use crate::buckets::EpochBucket;
use crate::config::{
    ContainerKind, EngineMode, EpochConfig, FreeStrategy, PersistTrackerKind, PersisterKind,
    TransTrackerKind, WriteBackStrategy,
};
use crate::error::EpochError;
use crate::garbage::ToBeFreed;
use crate::heap::PersistentHeap;
use crate::lin_var::ScDesc;
use crate::mindicator::{IncreasingMindicator, Mindicator, PersistTracker};
use crate::persist::{EpochBuffers, ToBePersisted};
use crate::sync::{AtomicBool, AtomicU64, Mutex, Ordering};
use crate::trans_tracker::TransactionTracker;
use crossbeam_utils::{Backoff, CachePadded};
use std::time::Instant;
use tracing::debug;

/// What the engine starts from: a fresh heap or the outcome of recovery.
pub(crate) struct Boot {
    pub(crate) epoch_block: BlockId,
    pub(crate) start_epoch: u64,
    /// Last durable transaction sequence number per worker.
    pub(crate) desc_seqs: Vec<u64>,
    pub(crate) seen_ids: Vec<u64>,
}

enum FreeStep {
    /// Allocated in this epoch: nobody else can know it.
    Discard,
    /// Updated in this epoch: becomes its own tombstone.
    Flip,
    /// Older: needs a separate tombstone at the current epoch.
    Tombstone(PBlk),
}

/// Global state of one engine instance.
///
/// 一个引擎实例的全局状态。
pub(crate) struct SharedState<H: PersistentHeap> {
    pub(crate) heap: H,
    pub(crate) config: EpochConfig,
    pub(crate) global_epoch: CachePadded<AtomicU64>,
    pub(crate) trans_tracker: TransactionTracker,
    pub(crate) to_be_persisted: ToBePersisted,
    pub(crate) to_be_freed: ToBeFreed,
    pub(crate) advancer: EpochAdvancer,
    pub(crate) uid: UidGenerator,
    /// One per worker in the nonblocking engine, empty otherwise.
    pub(crate) descs: Box<[ScDesc]>,
    desc_blocks: Box<[BlockId]>,
    epoch_block: BlockId,
    last_epochs: Box<[CachePadded<AtomicU64>]>,
    workers: Box<[AtomicBool]>,
    advance_lock: Mutex<()>,
}

impl<H: PersistentHeap> SharedState<H> {
    pub(crate) fn new(heap: H, config: EpochConfig, boot: Boot) -> Self {
        let n = config.task_num();

        let trans_tracker = match config.trans_tracker() {
            TransTrackerKind::CurrEpoch => TransactionTracker::curr_epoch(n),
            TransTrackerKind::AtomicCounter => TransactionTracker::atomic_counter(),
            TransTrackerKind::ActiveThread => TransactionTracker::active_thread(n, true),
            TransTrackerKind::NoFence => TransactionTracker::active_thread(n, false),
            TransTrackerKind::No => TransactionTracker::No,
        };

        let persist_tracker = || match config.persist_tracker() {
            PersistTrackerKind::Mindicator => PersistTracker::Mindicator(Mindicator::new(n)),
            PersistTrackerKind::IncreasingMindicator => {
                PersistTracker::Increasing(IncreasingMindicator::new(n))
            }
        };
        let buffer_size = config.buffer_size();
        let bounded = config.write_back() == WriteBackStrategy::BufferedWB;
        let container = config.container();
        let make_bucket = move || match container {
            ContainerKind::CircBuffer => EpochBucket::ring(buffer_size),
            ContainerKind::Vector => EpochBucket::vector(),
            ContainerKind::HashSet => EpochBucket::set(bounded.then_some(buffer_size)),
        };
        let to_be_persisted = match config.write_back() {
            WriteBackStrategy::DirWB => ToBePersisted::DirWB,
            WriteBackStrategy::BufferedWB => ToBePersisted::BufferedWB(EpochBuffers::new(
                n,
                make_bucket,
                (buffer_size / 2).max(1),
                persist_tracker(),
                config.persister() == PersisterKind::PerThreadDedicated,
            )),
            WriteBackStrategy::PerEpoch => ToBePersisted::PerEpoch(EpochBuffers::new(
                n,
                make_bucket,
                buffer_size,
                persist_tracker(),
                false,
            )),
            WriteBackStrategy::No => ToBePersisted::No,
        };

        let to_be_freed = match config.free() {
            FreeStrategy::ThreadLocal => ToBeFreed::thread_local(n),
            FreeStrategy::PerEpoch => ToBeFreed::per_epoch(n),
            FreeStrategy::No => ToBeFreed::No,
        };

        let uid = UidGenerator::new(n);
        uid.resume_after(boot.seen_ids);

        let (descs, desc_blocks) = if config.mode() == EngineMode::Nonblocking {
            let descs: Box<[ScDesc]> = (0..n)
                .map(|tid| ScDesc::new(boot.desc_seqs.get(tid).copied().unwrap_or(0)))
                .collect();
            let blocks: Box<[BlockId]> = (0..n)
                .map(|tid| {
                    let sn = descs[tid].txn_sn();
                    let blk = heap.allocate(PBlk::engine(
                        BlkType::Desc,
                        pack_tid_sn(tid, 0),
                        encode_desc(sn, true),
                    ));
                    heap.write_back(blk, PBLK_HEADER_SIZE + 9);
                    blk
                })
                .collect();
            heap.fence();
            (descs, blocks)
        } else {
            (Box::default(), Box::default())
        };

        let advancer = EpochAdvancer::new(config.advancer(), config.epoch_length());

        let sys = Self {
            global_epoch: CachePadded::new(AtomicU64::new(boot.start_epoch)),
            trans_tracker,
            to_be_persisted,
            to_be_freed,
            advancer,
            uid,
            descs,
            desc_blocks,
            epoch_block: boot.epoch_block,
            last_epochs: (0..n)
                .map(|_| CachePadded::new(AtomicU64::new(NULL_EPOCH)))
                .collect(),
            workers: (0..n).map(|_| AtomicBool::new(false)).collect(),
            advance_lock: Mutex::new(()),
            heap,
            config,
        };
        sys.persist_epoch_block(boot.start_epoch);
        sys
    }

    #[inline]
    pub(crate) fn nonblocking(&self) -> bool {
        self.config.mode() == EngineMode::Nonblocking
    }

    #[inline]
    pub(crate) fn current_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn check_epoch(&self, c: u64) -> bool {
        self.current_epoch() == c
    }

    /// The `(thread, sequence)` tag of blocks written by `tid` right now.
    #[inline]
    pub(crate) fn tid_sn(&self, tid: usize) -> u64 {
        match self.descs.get(tid) {
            Some(desc) => pack_tid_sn(tid, desc.txn_sn()),
            None => 0,
        }
    }

    pub(crate) fn claim_worker(&self, tid: usize) {
        let slot = self.workers.get(tid).unwrap_or_else(|| {
            panic!(
                "BUG: worker id {tid} is out of range for {} workers",
                self.workers.len()
            )
        });
        assert!(
            !slot.swap(true, Ordering::AcqRel),
            "BUG: worker {tid} is already registered"
        );
    }

    pub(crate) fn release_worker(&self, tid: usize) {
        self.workers[tid].store(false, Ordering::Release);
    }

    fn with_block<R>(&self, blk: BlockId, f: impl FnOnce(&PBlk) -> R) -> R {
        match self.heap.read(blk, f) {
            Some(r) => r,
            None => panic!("BUG: {blk:?} is not a live block"),
        }
    }

    fn with_block_mut<R>(&self, blk: BlockId, f: impl FnOnce(&mut PBlk) -> R) -> R {
        match self.heap.write(blk, f) {
            Some(r) => r,
            None => panic!("BUG: {blk:?} is not a live block"),
        }
    }

    fn persist_block(&self, blk: BlockId, c: u64, tid: usize) {
        let len = self.heap.malloc_size(blk).unwrap_or(PBLK_HEADER_SIZE);
        self.to_be_persisted
            .register_persist(&self.heap, blk, len, c, tid);
    }

    fn persist_epoch_block(&self, epoch: u64) {
        self.heap
            .write(self.epoch_block, |b| b.payload = encode_epoch(epoch));
        self.heap.write_back(self.epoch_block, PBLK_HEADER_SIZE + 8);
        self.heap.fence();
    }

    pub(crate) fn persist_desc(&self, tid: usize, sn: u64, committed: bool) {
        if let Some(&blk) = self.desc_blocks.get(tid) {
            self.heap
                .write(blk, |b| b.payload = encode_desc(sn, committed));
            self.heap.write_back(blk, PBLK_HEADER_SIZE + 9);
            self.heap.fence();
        }
    }

    ///////////////////////
    // Transaction state //
    ///////////////////////

    /// Enter the current epoch and return it.
    ///
    /// The nonblocking engine does its housekeeping and persists the start of
    /// a new transaction before registering, so registration never waits on
    /// its own write-backs.
    ///
    /// 进入当前纪元并返回它。
    pub(crate) fn begin_transaction(&self, tid: usize, readonly: bool) -> u64 {
        if self.nonblocking() {
            self.on_new_epoch(self.current_epoch(), tid);
            if !readonly {
                let sn = self.descs[tid].next_txn();
                self.persist_desc(tid, sn, false);
            }
        }
        let backoff = Backoff::new();
        let e = loop {
            let e = self.current_epoch();
            if self
                .trans_tracker
                .consistent_register_active(e, e, tid, &self.global_epoch)
            {
                break e;
            }
            backoff.snooze();
        };
        if !self.nonblocking() {
            self.on_new_epoch(e, tid);
        }
        e
    }

    fn on_new_epoch(&self, e: u64, tid: usize) {
        if self.last_epochs[tid].swap(e, Ordering::Relaxed) == e {
            return;
        }
        self.to_be_freed.free_on_new_epoch(&self.heap, e, tid);
        if self.to_be_persisted.owes_before(e.saturating_sub(1), tid) {
            self.to_be_persisted
                .persist_epoch_local(&self.heap, e.saturating_sub(RECLAIM_LAG), tid);
        }
    }

    pub(crate) fn end_transaction(&self, c: u64, tid: usize) {
        self.trans_tracker.unregister_active(c, tid);
        self.advancer.on_end_transaction(self, c, tid);
    }

    pub(crate) fn end_readonly_transaction(&self, c: u64, tid: usize) {
        self.trans_tracker.unregister_active(c, tid);
    }

    /// Same effect as a read-only end; kept apart for the call sites.
    pub(crate) fn abort_transaction(&self, c: u64, tid: usize) {
        self.trans_tracker.unregister_active(c, tid);
    }

    #[inline]
    fn require_epoch(c: u64) {
        assert!(
            c != NULL_EPOCH,
            "BUG: block access with the null epoch, no operation is running"
        );
    }

    #[inline]
    fn old_see_new(block_epoch: u64, c: u64) -> Result<(), EpochError> {
        if block_epoch > c {
            return Err(EpochError::OldSeeNew {
                block_epoch,
                txn_epoch: c,
            });
        }
        Ok(())
    }

    /// Read `blk` on behalf of a transaction of epoch `c`.
    pub(crate) fn openread_pblk<R>(
        &self,
        blk: BlockId,
        c: u64,
        f: impl FnOnce(&PBlk) -> R,
    ) -> Result<R, EpochError> {
        Self::require_epoch(c);
        self.with_block(blk, |b| {
            Self::old_see_new(b.epoch, c)?;
            Ok(f(b))
        })
    }

    pub(crate) fn openread_pblk_unsafe<R>(&self, blk: BlockId, f: impl FnOnce(&PBlk) -> R) -> R {
        self.with_block(blk, f)
    }

    ///////////////////////
    // Block transitions //
    ///////////////////////

    /// Stamp `blk` with epoch `c` and an id, and queue it for write-back.
    ///
    /// 为 `blk` 标记纪元 `c` 和 id，并加入写回队列。
    pub(crate) fn register_alloc_pblk(&self, blk: BlockId, c: u64, tid: usize) {
        Self::require_epoch(c);
        let tid_sn = self.tid_sn(tid);
        self.with_block_mut(blk, |b| {
            assert!(
                matches!(b.blktype, BlkType::Init | BlkType::Alloc | BlkType::Owned),
                "BUG: registering a {:?} block as an allocation",
                b.blktype
            );
            b.epoch = c;
            if b.blktype == BlkType::Init {
                b.blktype = BlkType::Alloc;
            }
            if b.id == 0 {
                b.id = self.uid.get_id(tid);
            }
            b.tid_sn = tid_sn;
        });
        self.persist_block(blk, c, tid);
    }

    pub(crate) fn register_update_pblk(&self, blk: BlockId, c: u64, tid: usize) {
        Self::require_epoch(c);
        self.persist_block(blk, c, tid);
    }

    /// Open `blk` for writing. A block from an older epoch is copied into a
    /// fresh `Update` version stamped `c`; the copy's id is returned together
    /// with the superseded block, which the caller frees on commit.
    ///
    /// 打开 `blk` 以写入。旧纪元的块会被复制为新的 `Update` 版本。
    pub(crate) fn openwrite_pblk(
        &self,
        blk: BlockId,
        c: u64,
        tid: usize,
    ) -> Result<(BlockId, Option<BlockId>), EpochError> {
        Self::require_epoch(c);
        let tid_sn = self.tid_sn(tid);
        let copy = self.with_block(blk, |b| {
            Self::old_see_new(b.epoch, c)?;
            Ok((b.epoch < c).then(|| {
                let mut v = b.new_version();
                v.epoch = c;
                if v.blktype != BlkType::Owned {
                    v.blktype = BlkType::Update;
                }
                v.tid_sn = tid_sn;
                v
            }))
        })?;
        Ok(match copy {
            Some(version) => (self.heap.allocate(version), Some(blk)),
            None => (blk, None),
        })
    }

    /// Delete `blk` in epoch `c`.
    pub(crate) fn free_pblk(&self, blk: BlockId, c: u64, tid: usize) -> Result<(), EpochError> {
        Self::require_epoch(c);
        let tid_sn = self.tid_sn(tid);
        let step = self.with_block_mut(blk, |b| {
            Self::old_see_new(b.epoch, c)?;
            if b.epoch < c {
                return Ok(FreeStep::Tombstone(b.tombstone(c, tid_sn)));
            }
            match b.blktype {
                BlkType::Alloc | BlkType::Owned => {
                    b.epoch = NULL_EPOCH;
                    Ok(FreeStep::Discard)
                }
                BlkType::Update => {
                    b.blktype = BlkType::Delete;
                    Ok(FreeStep::Flip)
                }
                BlkType::Delete => panic!("BUG: double free of {blk:?}"),
                other => panic!("BUG: freeing a {other:?} block"),
            }
        })?;
        match step {
            FreeStep::Discard | FreeStep::Flip => self.persist_block(blk, c, tid),
            FreeStep::Tombstone(tombstone) => {
                let anti = self.heap.allocate(tombstone);
                self.persist_block(anti, c, tid);
                self.to_be_freed
                    .register_free(&self.heap, anti, c + 1, tid);
            }
        }
        self.to_be_freed.register_free(&self.heap, blk, c, tid);
        Ok(())
    }

    /// Logically remove `blk`, leaving its storage to a later reclaim.
    pub(crate) fn retire_pblk(&self, blk: BlockId, c: u64, tid: usize) -> Result<(), EpochError> {
        Self::require_epoch(c);
        let tid_sn = self.tid_sn(tid);
        let tombstone = self.with_block_mut(blk, |b| {
            assert!(
                b.retire.is_none() && b.blktype != BlkType::Delete,
                "BUG: double retire of {blk:?}"
            );
            Self::old_see_new(b.epoch, c)?;
            if b.epoch < c {
                return Ok(Some(b.tombstone(c, tid_sn)));
            }
            match b.blktype {
                BlkType::Alloc | BlkType::Update | BlkType::Owned => {
                    b.blktype = BlkType::Delete;
                    Ok(None)
                }
                other => panic!("BUG: retiring a {other:?} block"),
            }
        })?;
        if let Some(tombstone) = tombstone {
            let anti = self.heap.allocate(tombstone);
            self.with_block_mut(blk, |b| b.retire = Some(anti));
            self.persist_block(anti, c, tid);
        }
        self.persist_block(blk, c, tid);
        Ok(())
    }

    /// Create the tombstone for a nonblocking retirement without linking it.
    /// An uncommitted tombstone is ignored by recovery.
    pub(crate) fn prepare_retire_pblk(
        &self,
        blk: BlockId,
        c: u64,
        tid: usize,
    ) -> Result<BlockId, EpochError> {
        Self::require_epoch(c);
        let tid_sn = self.tid_sn(tid);
        let tombstone = self.with_block(blk, |b| {
            assert!(
                b.retire.is_none() && b.blktype != BlkType::Delete,
                "BUG: double retire of {blk:?}"
            );
            Self::old_see_new(b.epoch, c)?;
            Ok(b.tombstone(c, tid_sn))
        })?;
        let anti = self.heap.allocate(tombstone);
        self.persist_block(anti, c, tid);
        Ok(anti)
    }

    pub(crate) fn link_retire(&self, blk: BlockId, anti: BlockId) {
        self.with_block_mut(blk, |b| {
            assert!(b.retire.is_none(), "BUG: double retire of {blk:?}");
            b.retire = Some(anti);
        });
    }

    /// Undo a prepared retirement whose transaction aborted.
    pub(crate) fn withdraw_retire_pblk(&self, anti: BlockId, c: u64, tid: usize) {
        self.reset_alloc(anti);
        self.to_be_freed.register_free(&self.heap, anti, c, tid);
    }

    /// Free a retired block once the client knows nobody references it.
    ///
    /// 在客户端确认无人引用后释放已退休的块。
    pub(crate) fn reclaim_pblk(&self, blk: BlockId, c: u64, tid: usize) -> Result<(), EpochError> {
        Self::require_epoch(c);
        let (e, blktype, retire) = self.with_block(blk, |b| (b.epoch, b.blktype, b.retire));
        assert!(
            e <= c,
            "BUG: reclaiming {blk:?}, written in epoch {e} after the current epoch {c}"
        );
        match retire {
            None if blktype != BlkType::Delete => return self.free_pblk(blk, c, tid),
            None if e + 1 < c => self.heap.deallocate(blk),
            // `c` rather than `e`: the bag of `e` may already be collected.
            None => self.to_be_freed.register_free(&self.heap, blk, c, tid),
            Some(anti) => {
                let e_retire = self.with_block(anti, |b| b.epoch);
                assert!(
                    e_retire <= c,
                    "BUG: reclaiming {blk:?}, retired in epoch {e_retire} after the current epoch {c}"
                );
                if e + 1 < c {
                    self.to_be_freed.register_free(&self.heap, anti, c, tid);
                    self.heap.deallocate(blk);
                } else {
                    self.to_be_freed
                        .register_free(&self.heap, anti, c + 1, tid);
                    self.to_be_freed.register_free(&self.heap, blk, c, tid);
                }
            }
        }
        Ok(())
    }

    /// Make a registered block invisible to recovery again.
    pub(crate) fn reset_alloc(&self, blk: BlockId) {
        self.with_block_mut(blk, |b| b.epoch = NULL_EPOCH);
        let len = self.heap.malloc_size(blk).unwrap_or(PBLK_HEADER_SIZE);
        self.heap.write_back(blk, len);
        self.heap.fence();
    }

    /// Drop a block created by an aborted operation.
    pub(crate) fn discard_alloc(&self, blk: BlockId, c: u64, tid: usize) {
        self.reset_alloc(blk);
        self.to_be_freed.register_free(&self.heap, blk, c, tid);
    }

    pub(crate) fn supersede(&self, old: BlockId, c: u64, tid: usize) {
        self.to_be_freed.register_free(&self.heap, old, c, tid);
    }

    ////////////////////
    // Epoch boundary //
    ////////////////////

    /// Drain what `tid` owes up to the epoch before `c`.
    pub(crate) fn help_persist_local(&self, c: u64, tid: usize) {
        self.to_be_persisted
            .persist_epoch_local(&self.heap, c.saturating_sub(1), tid);
    }

    /// Advance from `c` to `c + 1`, unless someone already moved past `c`.
    pub(crate) fn advance_epoch(&self, c: u64) {
        let _guard = self.advance_lock.lock();
        if self.check_epoch(c) {
            self.advance_from(c);
        }
    }

    /// Advance from whatever the current epoch is.
    pub(crate) fn advance_epoch_dedicated(&self) {
        let _guard = self.advance_lock.lock();
        let c = self.current_epoch();
        self.advance_from(c);
    }

    /// One boundary. Steps, in order:
    /// 1. wait until no transaction of `c - 1` runs;
    /// 2. write back every thread's writes of `c - 1`;
    /// 3. make `c + 1` durable, then publish it;
    /// 4. free what was registered up to `c + 1 - RECLAIM_LAG`.
    ///
    /// Nothing may be freed on the strength of `c + 1` before a restart would
    /// also see `c + 1`: recovery trusts only the durable epoch.
    ///
    /// 一次纪元边界：等待 `c - 1` 的事务结束，写回 `c - 1`，先持久化再发布 `c + 1`，最后释放。
    fn advance_from(&self, c: u64) {
        let started = Instant::now();
        let backoff = Backoff::new();
        while !self.trans_tracker.no_active(c.saturating_sub(1)) {
            backoff.snooze();
        }
        self.to_be_persisted
            .persist_epoch(&self.heap, c.saturating_sub(1));
        self.heap.fence();
        self.persist_epoch_block(c + 1);
        self.global_epoch.store(c + 1, Ordering::SeqCst);
        self.to_be_freed
            .help_free(&self.heap, (c + 1).saturating_sub(RECLAIM_LAG));
        debug!(
            target: "nvm_epoch::advancer",
            event = "epoch_advanced",
            from = c,
            to = c + 1,
            elapsed_us = started.elapsed().as_micros() as u64,
        );
    }

    /// Advance until everything written before the call is durable.
    pub(crate) fn sync(&self) {
        let target = self.current_epoch() + 2;
        while self.current_epoch() < target {
            self.advance_epoch_dedicated();
        }
    }

    /// Advance far enough that every pending write-back and free has run.
    pub(crate) fn flush(&self) {
        for _ in 0..2 * RECLAIM_LAG {
            self.advance_epoch_dedicated();
        }
    }

    pub(crate) fn set_epoch(&self, c: u64) {
        let _guard = self.advance_lock.lock();
        self.persist_epoch_block(c);
        self.global_epoch.store(c, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn pending_frees(&self, tid: usize) -> Vec<(u64, usize)> {
        self.to_be_freed.pending_local(tid)
    }

    #[cfg(test)]
    pub(crate) fn pending_write_backs(&self, tid: usize) -> usize {
        self.to_be_persisted.pending_local(tid)
    }
}
