//! Epoch-checked single-word CAS for the nonblocking engine.
//!
//! An [`AtomicLinVar`] holds either a value (`value << 1`) or, while a
//! [`cas_verify`](AtomicLinVar::cas_verify) is in flight, a descriptor word
//! naming the owner's [`ScDesc`]. Any thread that finds a descriptor completes
//! it: the swap commits if the global epoch still equals the epoch recorded in
//! the descriptor and aborts otherwise. Readers therefore never wait on the
//! owner, and a committed swap is always linearized inside its epoch.
//!
//! Descriptor word layout: `attempt << 17 | tid << 1 | 1`.
//!
//! 非阻塞引擎中带纪元检查的单字 CAS。遇到描述符的线程会协助完成它：
//! 若全局纪元仍等于描述符记录的纪元则提交，否则中止。

use crate::error::EpochError;
use crate::heap::PersistentHeap;
use crate::state::SharedState;
use crate::sync::{AtomicU64, Ordering};
use crate::worker::{OpGuard, Worker};

const PREPARING: u64 = 0;
const IN_PROGRESS: u64 = 1;
const COMMITTED: u64 = 2;
const ABORTED: u64 = 3;

const TID_BITS: u32 = 16;
const TID_MASK: u64 = (1 << TID_BITS) - 1;
const ATTEMPT_SHIFT: u32 = TID_BITS + 1;
const ATTEMPT_MASK: u64 = (1 << (64 - ATTEMPT_SHIFT)) - 1;

/// Largest value an [`AtomicLinVar`] can hold.
pub const MAX_LIN_VALUE: u64 = u64::MAX >> 1;

#[inline]
fn is_desc(word: u64) -> bool {
    word & 1 == 1
}

#[inline]
fn desc_word(attempt: u64, tid: usize) -> u64 {
    ((attempt & ATTEMPT_MASK) << ATTEMPT_SHIFT) | ((tid as u64 & TID_MASK) << 1) | 1
}

#[inline]
fn desc_parts(word: u64) -> (u64, usize) {
    (word >> ATTEMPT_SHIFT, ((word >> 1) & TID_MASK) as usize)
}

#[inline]
fn state_word(attempt: u64, status: u64) -> u64 {
    ((attempt & ATTEMPT_MASK) << 2) | status
}

#[inline]
fn state_parts(state: u64) -> (u64, u64) {
    (state >> 2, state & 0b11)
}

/// A worker's CAS descriptor, reused by each of its attempts.
///
/// Besides the in-flight swap it carries the sequence number of the owner's
/// current transaction, which tags every block that transaction writes.
///
/// 工作线程的 CAS 描述符，每次尝试复用。同时记录当前事务的序列号。
#[repr(align(64))]
pub(crate) struct ScDesc {
    state: AtomicU64,
    old: AtomicU64,
    new: AtomicU64,
    cas_epoch: AtomicU64,
    txn_sn: AtomicU64,
}

impl ScDesc {
    pub(crate) fn new(txn_sn: u64) -> Self {
        Self {
            state: AtomicU64::new(state_word(0, ABORTED)),
            old: AtomicU64::new(0),
            new: AtomicU64::new(0),
            cas_epoch: AtomicU64::new(0),
            txn_sn: AtomicU64::new(txn_sn),
        }
    }

    #[inline]
    pub(crate) fn txn_sn(&self) -> u64 {
        self.txn_sn.load(Ordering::Relaxed)
    }

    /// Start the owner's next transaction.
    #[inline]
    pub(crate) fn next_txn(&self) -> u64 {
        self.txn_sn.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish a new attempt. Fields are written while the state says
    /// `PREPARING`, so helpers never read a torn descriptor.
    fn prepare(&self, old: u64, new: u64, epoch: u64) -> u64 {
        let (attempt, _) = state_parts(self.state.load(Ordering::Relaxed));
        let attempt = (attempt + 1) & ATTEMPT_MASK;
        self.state.store(state_word(attempt, PREPARING), Ordering::SeqCst);
        self.old.store(old, Ordering::SeqCst);
        self.new.store(new, Ordering::SeqCst);
        self.cas_epoch.store(epoch, Ordering::SeqCst);
        self.state.store(state_word(attempt, IN_PROGRESS), Ordering::SeqCst);
        attempt
    }

    fn abandon(&self, attempt: u64) {
        self.state.store(state_word(attempt, ABORTED), Ordering::SeqCst);
    }

    /// Decide and clean up the attempt named by `word` in `var`.
    ///
    /// 决定并清理 `word` 所指的尝试。
    fn try_complete(&self, var: &AtomicU64, word: u64, global_epoch: &AtomicU64) {
        let (attempt, _) = desc_parts(word);
        let (seen, status) = state_parts(self.state.load(Ordering::SeqCst));
        if seen != attempt || status == PREPARING {
            return;
        }
        let old = self.old.load(Ordering::SeqCst);
        let new = self.new.load(Ordering::SeqCst);
        let cas_epoch = self.cas_epoch.load(Ordering::SeqCst);
        let current = self.state.load(Ordering::SeqCst);
        let (seen, mut status) = state_parts(current);
        if seen != attempt {
            return;
        }
        if status == IN_PROGRESS {
            let decision = if global_epoch.load(Ordering::SeqCst) == cas_epoch {
                COMMITTED
            } else {
                ABORTED
            };
            status = match self.state.compare_exchange(
                current,
                state_word(attempt, decision),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => decision,
                Err(actual) => {
                    let (seen, status) = state_parts(actual);
                    if seen != attempt {
                        return;
                    }
                    status
                }
            };
        }
        let value = if status == COMMITTED { new } else { old };
        let _ = var.compare_exchange(word, value << 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn status_of(&self, attempt: u64) -> Option<u64> {
        let (seen, status) = state_parts(self.state.load(Ordering::SeqCst));
        (seen == attempt).then_some(status)
    }
}

/// A word whose swaps can be made conditional on the global epoch.
///
/// Values are limited to [`MAX_LIN_VALUE`]; a [`BlockId`](crate::BlockId)
/// always fits through [`to_raw`](crate::BlockId::to_raw).
///
/// # Example
/// ```
/// use nvm_epoch::{AtomicLinVar, EngineMode, EpochSys, FreeStrategy, SimHeap};
///
/// let sys = EpochSys::builder()
///     .mode(EngineMode::Nonblocking)
///     .free(FreeStrategy::ThreadLocal)
///     .open(SimHeap::new())
///     .unwrap();
/// let worker = sys.register_worker(0);
/// let head = AtomicLinVar::new(0);
///
/// let committed = worker.run_op(|op| head.cas_verify(op, 0, 7));
/// assert!(committed);
/// assert_eq!(head.load(&worker), 7);
/// ```
///
/// 交换操作可以以全局纪元为条件的字。
#[derive(Debug)]
pub struct AtomicLinVar {
    word: AtomicU64,
}

impl AtomicLinVar {
    pub fn new(value: u64) -> Self {
        assert!(value <= MAX_LIN_VALUE, "BUG: {value} does not fit in an AtomicLinVar");
        Self {
            word: AtomicU64::new(value << 1),
        }
    }

    fn help<H: PersistentHeap>(&self, sys: &SharedState<H>, word: u64) {
        let (_, tid) = desc_parts(word);
        if let Some(desc) = sys.descs.get(tid) {
            desc.try_complete(&self.word, word, &sys.global_epoch);
        }
    }

    fn load_in<H: PersistentHeap>(&self, sys: &SharedState<H>) -> u64 {
        loop {
            let word = self.word.load(Ordering::SeqCst);
            if !is_desc(word) {
                return word >> 1;
            }
            self.help(sys, word);
        }
    }

    fn cas_in<H: PersistentHeap>(&self, sys: &SharedState<H>, expected: u64, new: u64) -> bool {
        loop {
            let word = self.word.load(Ordering::SeqCst);
            if is_desc(word) {
                self.help(sys, word);
                continue;
            }
            if word != expected << 1 {
                return false;
            }
            if self
                .word
                .compare_exchange(word, new << 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Current value, completing any swap found in flight.
    pub fn load<H: PersistentHeap>(&self, worker: &Worker<H>) -> u64 {
        self.load_in(worker.shared())
    }

    pub fn store<H: PersistentHeap>(&self, worker: &Worker<H>, value: u64) {
        assert!(value <= MAX_LIN_VALUE, "BUG: {value} does not fit in an AtomicLinVar");
        let sys = worker.shared();
        loop {
            let word = self.word.load(Ordering::SeqCst);
            if is_desc(word) {
                self.help(sys, word);
                continue;
            }
            if self
                .word
                .compare_exchange(word, value << 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Plain compare-and-swap with no epoch check.
    pub fn cas<H: PersistentHeap>(&self, worker: &Worker<H>, expected: u64, new: u64) -> bool {
        assert!(new <= MAX_LIN_VALUE, "BUG: {new} does not fit in an AtomicLinVar");
        self.cas_in(worker.shared(), expected, new)
    }

    /// Swap `expected` for `new` only if the global epoch still equals the
    /// operation's epoch at the linearization point.
    ///
    /// Returns `Ok(false)` when the value did not match and
    /// [`EpochError::EpochVerify`] when the epoch moved. A committed swap
    /// commits the operation: its writes survive a crash once their epoch is
    /// persisted.
    ///
    /// 仅当线性化点时全局纪元仍等于操作纪元时，才将 `expected` 交换为 `new`。
    pub fn cas_verify<H: PersistentHeap>(
        &self,
        op: &OpGuard<'_, H>,
        expected: u64,
        new: u64,
    ) -> Result<bool, EpochError> {
        assert!(new <= MAX_LIN_VALUE, "BUG: {new} does not fit in an AtomicLinVar");
        let sys = op.worker().shared();
        let tid = op.worker().tid();
        let c = op.epoch();
        let Some(desc) = sys.descs.get(tid) else {
            panic!("BUG: cas_verify needs the nonblocking engine");
        };
        let attempt = desc.prepare(expected, new, c);
        let word = desc_word(attempt, tid);
        loop {
            let seen = self.word.load(Ordering::SeqCst);
            if is_desc(seen) {
                self.help(sys, seen);
                continue;
            }
            if seen != expected << 1 {
                desc.abandon(attempt);
                return Ok(false);
            }
            if self
                .word
                .compare_exchange(seen, word, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        desc.try_complete(&self.word, word, &sys.global_epoch);
        match desc.status_of(attempt) {
            Some(COMMITTED) => {
                op.commit_descriptor();
                Ok(true)
            }
            _ => Err(EpochError::EpochVerify {
                expected: c,
                current: sys.global_epoch.load(Ordering::SeqCst),
            }),
        }
    }

    /// Load, then confirm the operation's epoch is still current.
    pub fn load_verify<H: PersistentHeap>(&self, op: &OpGuard<'_, H>) -> Result<u64, EpochError> {
        let sys = op.worker().shared();
        let value = self.load_in(sys);
        op.verify_epoch()?;
        Ok(value)
    }

    /// Store linearized inside the operation's epoch.
    pub fn store_verify<H: PersistentHeap>(
        &self,
        op: &OpGuard<'_, H>,
        value: u64,
    ) -> Result<(), EpochError> {
        loop {
            let current = self.load_in(op.worker().shared());
            if self.cas_verify(op, current, value)? {
                return Ok(());
            }
        }
    }
}
