//! Per-thread entry points: [`Worker`] and its operation guard [`OpGuard`].

use crate::block::{BlockId, NULL_EPOCH, PBlk};
use crate::error::EpochError;
use crate::heap::PersistentHeap;
use crate::state::SharedState;
use crate::sync::{Arc, Cell};
use std::cell::RefCell;
use std::marker::PhantomData;
use tracing::debug;

struct PendingRetire {
    blk: BlockId,
    /// Prepared tombstone of a nonblocking retirement.
    anti: Option<BlockId>,
}

/// A worker thread's handle to an [`EpochSys`](crate::EpochSys).
///
/// Each worker owns one thread id in `0..task_num`. It is `Send` but not
/// `Sync`: move it into the thread that uses it.
///
/// Blocks allocated with [`pnew`](Self::pnew) outside an operation are
/// registered by the next [`begin_op`](Self::begin_op), so an operation that
/// aborts and retries reuses them. Blocks allocated through the
/// [`OpGuard`] belong to that attempt and are dropped if it aborts.
///
/// 工作线程对 `EpochSys` 的句柄。每个 worker 拥有 `0..task_num` 中的一个线程 id。
/// 它是 `Send` 但不是 `Sync`：请把它移动到使用它的线程中。
pub struct Worker<H: PersistentHeap> {
    shared: Arc<SharedState<H>>,
    tid: usize,
    epoch: Cell<u64>,
    committed: Cell<bool>,
    pending_allocs: RefCell<Vec<BlockId>>,
    op_allocs: RefCell<Vec<BlockId>>,
    /// `(old, copy)` per copy-on-write; `copy` is cleared if deleted again.
    superseded: RefCell<Vec<(BlockId, Option<BlockId>)>>,
    pending_retires: RefCell<Vec<PendingRetire>>,
}

impl<H: PersistentHeap> Worker<H> {
    pub(crate) fn new(shared: Arc<SharedState<H>>, tid: usize) -> Self {
        shared.claim_worker(tid);
        debug!(target: "nvm_epoch::worker", event = "register", tid);
        Self {
            shared,
            tid,
            epoch: Cell::new(NULL_EPOCH),
            committed: Cell::new(false),
            pending_allocs: RefCell::new(Vec::new()),
            op_allocs: RefCell::new(Vec::new()),
            superseded: RefCell::new(Vec::new()),
            pending_retires: RefCell::new(Vec::new()),
        }
    }

    #[inline]
    pub fn tid(&self) -> usize {
        self.tid
    }

    #[inline]
    pub(crate) fn shared(&self) -> &SharedState<H> {
        &self.shared
    }

    /// Whether an operation is running on this worker.
    #[inline]
    pub fn in_op(&self) -> bool {
        self.epoch.get() != NULL_EPOCH
    }

    /// Begin an operation in the current epoch.
    ///
    /// The operation commits when the guard is dropped and is rolled back by
    /// [`OpGuard::abort`].
    ///
    /// # Panics
    /// If an operation is already running on this worker.
    ///
    /// 在当前纪元开始一个操作。守卫被 drop 时提交，调用 `OpGuard::abort` 时回滚。
    pub fn begin_op(&self) -> OpGuard<'_, H> {
        assert!(
            !self.in_op(),
            "BUG: worker {} began an operation inside another one",
            self.tid
        );
        let c = self.shared.begin_transaction(self.tid, false);
        self.epoch.set(c);
        self.committed.set(false);
        for &blk in self.pending_allocs.borrow().iter() {
            self.shared.register_alloc_pblk(blk, c, self.tid);
        }
        OpGuard {
            worker: self,
            epoch: c,
            readonly: false,
            done: false,
            _not_send: PhantomData,
        }
    }

    /// Begin an operation that only reads. It never registers anything and
    /// does not count toward epoch advancing.
    pub fn begin_readonly_op(&self) -> OpGuard<'_, H> {
        assert!(
            !self.in_op(),
            "BUG: worker {} began an operation inside another one",
            self.tid
        );
        let c = self.shared.begin_transaction(self.tid, true);
        self.epoch.set(c);
        OpGuard {
            worker: self,
            epoch: c,
            readonly: true,
            done: false,
            _not_send: PhantomData,
        }
    }

    /// Run `f` as one operation, retrying from a fresh begin until it does
    /// not fail with a retryable [`EpochError`].
    ///
    /// # Example
    /// ```
    /// use nvm_epoch::{EpochSys, SimHeap};
    ///
    /// let sys = EpochSys::builder().open(SimHeap::new()).unwrap();
    /// let worker = sys.register_worker(0);
    /// let blk = worker.run_op(|op| Ok(op.pnew(b"hello".to_vec())));
    /// let len = worker.run_op(|op| op.read(blk, |payload| payload.len()));
    /// assert_eq!(len, 5);
    /// ```
    ///
    /// 将 `f` 作为一个操作运行，遇到可重试错误时从头重试。
    pub fn run_op<T>(&self, mut f: impl FnMut(&OpGuard<'_, H>) -> Result<T, EpochError>) -> T {
        loop {
            let op = self.begin_op();
            match f(&op).and_then(|value| {
                self.check_pending_retires(op.epoch())?;
                Ok(value)
            }) {
                Ok(value) => {
                    op.end();
                    return value;
                }
                Err(err) => {
                    debug_assert!(err.is_retryable());
                    debug!(target: "nvm_epoch::worker", event = "retry", tid = self.tid, error = %err);
                    op.abort();
                }
            }
        }
    }

    /// Allocate a block. Outside an operation it is queued and registered by
    /// the next [`begin_op`](Self::begin_op).
    pub fn pnew(&self, payload: Vec<u8>) -> BlockId {
        self.alloc(PBlk::new(payload))
    }

    fn alloc(&self, blk: PBlk) -> BlockId {
        let id = self.shared.heap.allocate(blk);
        match self.epoch.get() {
            NULL_EPOCH => self.pending_allocs.borrow_mut().push(id),
            c => {
                self.shared.register_alloc_pblk(id, c, self.tid);
                self.op_allocs.borrow_mut().push(id);
            }
        }
        id
    }

    /// Queue `blk` for retirement by the next operation to commit.
    ///
    /// If `blk` was written after that operation's epoch, [`run_op`](Self::run_op)
    /// retries the operation; an operation ended by hand leaves the
    /// retirement queued for the next one.
    ///
    /// # Panics
    /// Inside an operation; use [`OpGuard::retire`] there.
    pub fn pretire(&self, blk: BlockId) {
        assert!(
            !self.in_op(),
            "BUG: pretire inside an operation, use OpGuard::retire"
        );
        self.pending_retires
            .borrow_mut()
            .push(PendingRetire { blk, anti: None });
    }

    /// Reclaim a retired block in a reclaim-only operation of its own.
    pub fn preclaim(&self, blk: BlockId) {
        assert!(
            !self.in_op(),
            "BUG: preclaim inside an operation, use OpGuard::reclaim"
        );
        self.run_op(|op| op.reclaim(blk));
    }

    /// Delete a block. A block still waiting in the pending queue is freed
    /// on the spot; a registered one is deleted by an operation of its own.
    pub fn pdelete(&self, blk: BlockId) {
        assert!(
            !self.in_op(),
            "BUG: pdelete inside an operation, use OpGuard::pdelete"
        );
        let queued = {
            let mut pending = self.pending_allocs.borrow_mut();
            match pending.iter().position(|&b| b == blk) {
                Some(at) => {
                    pending.swap_remove(at);
                    true
                }
                None => false,
            }
        };
        if queued {
            self.shared.heap.deallocate(blk);
        } else {
            self.run_op(|op| op.pdelete(blk));
        }
    }

    fn end_op(&self, c: u64, readonly: bool) {
        if readonly {
            self.shared.end_readonly_transaction(c, self.tid);
            self.epoch.set(NULL_EPOCH);
            return;
        }
        let sys = &*self.shared;
        // A queued retirement whose block is newer than `c` waits for a later
        // operation.
        self.pending_retires.borrow_mut().retain(|retire| {
            match self.commit_retire(retire, c) {
                Ok(()) => false,
                Err(err) => {
                    debug!(
                        target: "nvm_epoch::worker",
                        event = "retire_deferred",
                        tid = self.tid,
                        blk = ?retire.blk,
                        error = %err,
                    );
                    true
                }
            }
        });
        for (old, _) in self.superseded.borrow_mut().drain(..) {
            sys.supersede(old, c, self.tid);
        }
        if sys.nonblocking() && !self.committed.get() {
            self.commit_descriptor();
        }
        sys.end_transaction(c, self.tid);
        self.epoch.set(NULL_EPOCH);
        self.pending_allocs.borrow_mut().clear();
        self.op_allocs.borrow_mut().clear();
    }

    /// Fail with [`EpochError::OldSeeNew`] if a block queued by
    /// [`pretire`](Self::pretire) was written after epoch `c`.
    fn check_pending_retires(&self, c: u64) -> Result<(), EpochError> {
        for retire in self.pending_retires.borrow().iter() {
            if retire.anti.is_some() {
                continue;
            }
            if let Some(block_epoch) = self.shared.heap.read(retire.blk, |b| b.epoch()) {
                if block_epoch > c {
                    return Err(EpochError::OldSeeNew {
                        block_epoch,
                        txn_epoch: c,
                    });
                }
            }
        }
        Ok(())
    }

    fn commit_retire(&self, retire: &PendingRetire, c: u64) -> Result<(), EpochError> {
        let sys = &*self.shared;
        match retire.anti {
            Some(anti) => sys.link_retire(retire.blk, anti),
            None if sys.nonblocking() => {
                let anti = sys.prepare_retire_pblk(retire.blk, c, self.tid)?;
                sys.link_retire(retire.blk, anti);
            }
            None => sys.retire_pblk(retire.blk, c, self.tid)?,
        }
        Ok(())
    }

    fn abort_op(&self, c: u64, readonly: bool) {
        let sys = &*self.shared;
        if !readonly {
            // Retirements queued by `pretire` wait for the retry.
            self.pending_retires.borrow_mut().retain(|retire| match retire.anti {
                Some(anti) => {
                    sys.withdraw_retire_pblk(anti, c, self.tid);
                    false
                }
                None => true,
            });
            for (_, copy) in self.superseded.borrow_mut().drain(..) {
                if let Some(copy) = copy {
                    sys.discard_alloc(copy, c, self.tid);
                }
            }
            for blk in self.op_allocs.borrow_mut().drain(..) {
                sys.discard_alloc(blk, c, self.tid);
            }
            for &blk in self.pending_allocs.borrow().iter() {
                sys.reset_alloc(blk);
            }
        }
        sys.abort_transaction(c, self.tid);
        self.epoch.set(NULL_EPOCH);
    }

    pub(crate) fn commit_descriptor(&self) {
        if let Some(desc) = self.shared.descs.get(self.tid) {
            self.shared.persist_desc(self.tid, desc.txn_sn(), true);
            self.committed.set(true);
        }
    }

    fn forget_alloc(&self, blk: BlockId) {
        self.op_allocs.borrow_mut().retain(|&b| b != blk);
        self.pending_allocs.borrow_mut().retain(|&b| b != blk);
        for (_, copy) in self.superseded.borrow_mut().iter_mut() {
            if *copy == Some(blk) {
                *copy = None;
            }
        }
    }
}

impl<H: PersistentHeap> Drop for Worker<H> {
    fn drop(&mut self) {
        if self.in_op() {
            self.abort_op(self.epoch.get(), false);
        }
        for blk in self.pending_allocs.get_mut().drain(..) {
            self.shared.heap.deallocate(blk);
        }
        self.shared.release_worker(self.tid);
    }
}

/// A running operation.
///
/// Dropping the guard commits the operation; [`abort`](Self::abort) rolls it
/// back. Accessors return [`EpochError`] when the operation raced with an
/// epoch boundary, in which case the whole operation must be retried, see
/// [`Worker::run_op`].
///
/// 一个正在运行的操作。drop 守卫即提交，`abort` 则回滚。
#[must_use]
pub struct OpGuard<'w, H: PersistentHeap> {
    worker: &'w Worker<H>,
    epoch: u64,
    readonly: bool,
    done: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'w, H: PersistentHeap> OpGuard<'w, H> {
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[inline]
    pub fn worker(&self) -> &'w Worker<H> {
        self.worker
    }

    #[inline]
    fn sys(&self) -> &'w SharedState<H> {
        self.worker.shared()
    }

    #[inline]
    fn tid(&self) -> usize {
        self.worker.tid
    }

    fn writable(&self) {
        assert!(
            !self.readonly,
            "BUG: modifying blocks in a read-only operation"
        );
    }

    /// Whether the global epoch is still the operation's epoch.
    #[inline]
    pub fn check_epoch(&self) -> bool {
        self.sys().check_epoch(self.epoch)
    }

    /// Like [`check_epoch`](Self::check_epoch), as a retryable error.
    pub fn verify_epoch(&self) -> Result<(), EpochError> {
        let current = self.sys().current_epoch();
        if current != self.epoch {
            return Err(EpochError::EpochVerify {
                expected: self.epoch,
                current,
            });
        }
        Ok(())
    }

    /// Allocate and register a block in this operation's epoch.
    pub fn pnew(&self, payload: Vec<u8>) -> BlockId {
        self.writable();
        self.worker.alloc(PBlk::new(payload))
    }

    /// Allocate a block whose lifetime follows `owner`: after a crash it is
    /// recovered only if `owner` is.
    pub fn pnew_owned(&self, owner: BlockId, payload: Vec<u8>) -> BlockId {
        self.writable();
        let owner_id = self.sys().openread_pblk_unsafe(owner, |b| b.id);
        assert!(owner_id != 0, "BUG: owner {owner:?} is not registered");
        self.worker.alloc(PBlk::owned_by(owner_id, payload))
    }

    /// Read `blk`'s payload, failing if it was written after this operation
    /// began.
    ///
    /// 读取 `blk` 的负载；若它在本操作开始后被写入则失败。
    pub fn read<R>(&self, blk: BlockId, f: impl FnOnce(&[u8]) -> R) -> Result<R, EpochError> {
        self.sys()
            .openread_pblk(blk, self.epoch, |b| f(b.payload()))
    }

    /// Read `blk` with no epoch validation.
    pub fn read_unsafe<R>(&self, blk: BlockId, f: impl FnOnce(&[u8]) -> R) -> R {
        self.sys().openread_pblk_unsafe(blk, |b| f(b.payload()))
    }

    /// Read `blk`'s header and payload.
    pub fn read_block<R>(&self, blk: BlockId, f: impl FnOnce(&PBlk) -> R) -> Result<R, EpochError> {
        self.sys().openread_pblk(blk, self.epoch, f)
    }

    /// Open `blk` for writing and return the block to write to. A block from
    /// an older epoch is copied; the old version is freed when the operation
    /// commits. Call [`register_update`](Self::register_update) after writing.
    pub fn openwrite(&self, blk: BlockId) -> Result<BlockId, EpochError> {
        self.writable();
        let (target, old) = self.sys().openwrite_pblk(blk, self.epoch, self.tid())?;
        if let Some(old) = old {
            self.worker.superseded.borrow_mut().push((old, Some(target)));
        }
        Ok(target)
    }

    /// Queue `blk`'s new contents for write-back.
    pub fn register_update(&self, blk: BlockId) {
        self.writable();
        self.sys()
            .register_update_pblk(blk, self.epoch, self.tid());
    }

    /// Open, modify and register `blk` in one step. Returns the block that
    /// now holds the record, which differs from `blk` when it was copied.
    ///
    /// 一步完成打开、修改和登记。返回当前保存记录的块。
    pub fn write<R>(
        &self,
        blk: BlockId,
        f: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> Result<(BlockId, R), EpochError> {
        let target = self.openwrite(blk)?;
        let out = match self.sys().heap.write(target, |b| f(&mut b.payload)) {
            Some(out) => out,
            None => panic!("BUG: {target:?} is not a live block"),
        };
        self.register_update(target);
        Ok((target, out))
    }

    /// Logically remove `blk`. Its storage stays until
    /// [`reclaim`](Self::reclaim).
    pub fn retire(&self, blk: BlockId) -> Result<(), EpochError> {
        self.writable();
        let sys = self.sys();
        if sys.nonblocking() {
            let anti = sys.prepare_retire_pblk(blk, self.epoch, self.tid())?;
            self.worker.pending_retires.borrow_mut().push(PendingRetire {
                blk,
                anti: Some(anti),
            });
            Ok(())
        } else {
            sys.retire_pblk(blk, self.epoch, self.tid())
        }
    }

    /// Free a block retired earlier, or delete one that was never retired.
    pub fn reclaim(&self, blk: BlockId) -> Result<(), EpochError> {
        self.writable();
        self.sys().reclaim_pblk(blk, self.epoch, self.tid())?;
        self.worker.forget_alloc(blk);
        Ok(())
    }

    /// Delete `blk` in this operation's epoch.
    pub fn pdelete(&self, blk: BlockId) -> Result<(), EpochError> {
        self.writable();
        self.sys().free_pblk(blk, self.epoch, self.tid())?;
        self.worker.forget_alloc(blk);
        Ok(())
    }

    pub(crate) fn commit_descriptor(&self) {
        self.worker.commit_descriptor();
    }

    /// Commit now instead of at drop.
    pub fn end(mut self) {
        self.done = true;
        self.worker.end_op(self.epoch, self.readonly);
    }

    /// Roll the operation back: allocations made in it are dropped, queued
    /// allocations wait for the next operation, prepared retirements are
    /// withdrawn.
    ///
    /// 回滚操作：本操作中的分配被丢弃，排队的分配等待下一个操作，预备的退休被撤销。
    pub fn abort(mut self) {
        self.done = true;
        self.worker.abort_op(self.epoch, self.readonly);
    }
}

impl<H: PersistentHeap> Drop for OpGuard<'_, H> {
    fn drop(&mut self) {
        if !self.done {
            self.worker.end_op(self.epoch, self.readonly);
        }
    }
}
