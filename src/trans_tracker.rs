//! Tracking of running transactions per epoch, so the advancer knows when an
//! epoch has drained.
//!
//! 按纪元跟踪正在运行的事务，推进者据此判断一个纪元是否已排空。

use crate::block::{EPOCH_WINDOW, NULL_EPOCH, bucket_of};
use crate::sync::{AtomicBool, AtomicU64, Ordering, fence};
use crossbeam_utils::CachePadded;

/// Records which epochs still have running transactions.
///
/// A worker marks itself active before it trusts the epoch it read, then
/// re-reads the global epoch. If the epoch moved in between, the mark is
/// withdrawn and the worker starts over. The advancer relies on this: once
/// [`no_active`](Self::no_active) holds for `c - 1`, no transaction of that
/// epoch can appear later.
///
/// 记录哪些纪元仍有正在运行的事务。
/// 工作线程先登记为活跃再确认读到的纪元；若纪元在期间变化，则撤销登记并重试。
pub enum TransactionTracker {
    /// One slot per thread holding the epoch it is active in.
    CurrEpoch {
        curr_epochs: Box<[CachePadded<AtomicU64>]>,
    },
    /// One counter of active transactions per epoch bucket.
    AtomicCounter {
        counters: [CachePadded<AtomicU64>; EPOCH_WINDOW],
    },
    /// One flag per thread per epoch bucket. With `fence_on_begin` unset the
    /// registering store is not followed by a full fence.
    ActiveThread {
        fence_on_begin: bool,
        active: [Box<[CachePadded<AtomicBool>]>; EPOCH_WINDOW],
    },
    No,
}

impl TransactionTracker {
    pub fn curr_epoch(task_num: usize) -> Self {
        Self::CurrEpoch {
            curr_epochs: (0..task_num)
                .map(|_| CachePadded::new(AtomicU64::new(NULL_EPOCH)))
                .collect(),
        }
    }

    pub fn atomic_counter() -> Self {
        Self::AtomicCounter {
            counters: std::array::from_fn(|_| CachePadded::new(AtomicU64::new(0))),
        }
    }

    pub fn active_thread(task_num: usize, fence_on_begin: bool) -> Self {
        Self::ActiveThread {
            fence_on_begin,
            active: std::array::from_fn(|_| {
                (0..task_num)
                    .map(|_| CachePadded::new(AtomicBool::new(false)))
                    .collect()
            }),
        }
    }

    /// Mark `tid` active in `target`, provided the global epoch is still `c`.
    ///
    /// Returns `false`, with the mark already withdrawn, if the epoch moved.
    ///
    /// 若全局纪元仍为 `c`，则将 `tid` 登记为在 `target` 中活跃；否则撤销登记并返回 `false`。
    pub fn consistent_register_active(
        &self,
        target: u64,
        c: u64,
        tid: usize,
        global_epoch: &AtomicU64,
    ) -> bool {
        match self {
            Self::CurrEpoch { curr_epochs } => {
                curr_epochs[tid].store(target, Ordering::SeqCst);
            }
            Self::AtomicCounter { counters } => {
                counters[bucket_of(target)].fetch_add(1, Ordering::SeqCst);
            }
            Self::ActiveThread {
                fence_on_begin,
                active,
            } => {
                if *fence_on_begin {
                    active[bucket_of(target)][tid].store(true, Ordering::SeqCst);
                    fence(Ordering::SeqCst);
                } else {
                    active[bucket_of(target)][tid].store(true, Ordering::Release);
                }
            }
            Self::No => return true,
        }

        if global_epoch.load(Ordering::SeqCst) != c {
            self.unregister_active(target, tid);
            return false;
        }
        true
    }

    pub fn unregister_active(&self, target: u64, tid: usize) {
        match self {
            Self::CurrEpoch { curr_epochs } => {
                curr_epochs[tid].store(NULL_EPOCH, Ordering::SeqCst);
            }
            Self::AtomicCounter { counters } => {
                counters[bucket_of(target)].fetch_sub(1, Ordering::SeqCst);
            }
            Self::ActiveThread { active, .. } => {
                active[bucket_of(target)][tid].store(false, Ordering::SeqCst);
            }
            Self::No => {}
        }
    }

    /// Whether every transaction that registered in `target` has finished.
    ///
    /// 在 `target` 中登记的事务是否都已结束。
    pub fn no_active(&self, target: u64) -> bool {
        match self {
            Self::CurrEpoch { curr_epochs } => curr_epochs
                .iter()
                .all(|slot| slot.load(Ordering::SeqCst) != target),
            Self::AtomicCounter { counters } => {
                counters[bucket_of(target)].load(Ordering::SeqCst) == 0
            }
            Self::ActiveThread { active, .. } => active[bucket_of(target)]
                .iter()
                .all(|flag| !flag.load(Ordering::SeqCst)),
            Self::No => true,
        }
    }
}
