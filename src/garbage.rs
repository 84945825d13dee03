//! Deferred deallocation of blocks nobody can observe any more.
//!
//! A block registered for freeing in epoch `c` is returned to the heap once
//! the global epoch reaches `c + RECLAIM_LAG`. By then every transaction of
//! epoch `c` has finished and every write of epoch `c` is durable.
//!
//! # Logging
//! - `trace` (`nvm_epoch::garbage`): blocks freed per collection.
//! - `debug` (`nvm_epoch::garbage`): blocks still queued at shutdown.
//!
//! 延迟释放不再可被观察到的块。在纪元 `c` 登记释放的块在全局纪元到达 `c + RECLAIM_LAG` 后归还给堆。

use crate::block::{BlockId, RECLAIM_LAG};
use crate::heap::PersistentHeap;
use crate::sync::Mutex;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Blocks waiting for deallocation, grouped into bags by epoch.
///
/// Bags are kept sorted by epoch, so collection only ever pops from the front.
/// Emptied bags go back to a pool for reuse.
///
/// 等待释放的块，按纪元分组到袋子中。袋子按纪元排序，回收时只从队首弹出。
#[derive(Default)]
pub(crate) struct RetireBags {
    queue: VecDeque<(u64, Vec<BlockId>)>,
    pool: Vec<Vec<BlockId>>,
    count: usize,
}

impl RetireBags {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Add `blk` to the bag of `epoch`, creating the bag in order if needed.
    pub(crate) fn add(&mut self, blk: BlockId, epoch: u64) {
        let pos = self
            .queue
            .iter()
            .rposition(|(bag_epoch, _)| *bag_epoch <= epoch);
        match pos {
            Some(pos) if self.queue[pos].0 == epoch => self.queue[pos].1.push(blk),
            _ => {
                let mut bag = self.pool.pop().unwrap_or_else(|| Vec::with_capacity(16));
                bag.push(blk);
                let at = pos.map_or(0, |pos| pos + 1);
                self.queue.insert(at, (epoch, bag));
            }
        }
        self.count += 1;
    }

    /// Hand every block of an epoch at or below `safe_epoch` to `free`.
    ///
    /// 将纪元不大于 `safe_epoch` 的所有块交给 `free`。
    pub(crate) fn collect(&mut self, safe_epoch: u64, mut free: impl FnMut(BlockId)) -> usize {
        let mut freed = 0;
        while let Some((epoch, _)) = self.queue.front() {
            if *epoch > safe_epoch {
                break;
            }
            if let Some((_, mut bag)) = self.queue.pop_front() {
                freed += bag.len();
                bag.drain(..).for_each(&mut free);
                self.pool.push(bag);
            }
        }
        self.count -= freed;
        freed
    }

    #[cfg(test)]
    pub(crate) fn epochs(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.queue.iter().map(|(epoch, bag)| (*epoch, bag.len()))
    }
}

/// Reclamation policy of an engine.
///
/// 引擎的回收策略。
pub(crate) enum ToBeFreed {
    /// Each thread frees its own retirements when it enters a new epoch.
    ThreadLocal(Box<[CachePadded<Mutex<RetireBags>>]>),
    /// The epoch boundary frees every thread's retirements.
    PerEpoch(Box<[CachePadded<Mutex<RetireBags>>]>),
    /// Free on registration.
    No,
}

impl ToBeFreed {
    fn bags(task_num: usize) -> Box<[CachePadded<Mutex<RetireBags>>]> {
        (0..task_num)
            .map(|_| CachePadded::new(Mutex::new(RetireBags::new())))
            .collect()
    }

    pub(crate) fn thread_local(task_num: usize) -> Self {
        Self::ThreadLocal(Self::bags(task_num))
    }

    pub(crate) fn per_epoch(task_num: usize) -> Self {
        Self::PerEpoch(Self::bags(task_num))
    }

    pub(crate) fn register_free<H: PersistentHeap>(&self, heap: &H, blk: BlockId, c: u64, tid: usize) {
        match self {
            Self::ThreadLocal(bags) | Self::PerEpoch(bags) => bags[tid].lock().add(blk, c),
            Self::No => heap.deallocate(blk),
        }
    }

    /// Thread `tid` entered epoch `c`.
    pub(crate) fn free_on_new_epoch<H: PersistentHeap>(&self, heap: &H, c: u64, tid: usize) {
        if let Self::ThreadLocal(_) = self {
            self.help_free_local(heap, c.saturating_sub(RECLAIM_LAG), tid);
        }
    }

    /// Free `tid`'s blocks registered at or before `safe_epoch`.
    pub(crate) fn help_free_local<H: PersistentHeap>(&self, heap: &H, safe_epoch: u64, tid: usize) {
        let (Self::ThreadLocal(bags) | Self::PerEpoch(bags)) = self else {
            return;
        };
        let freed = bags[tid].lock().collect(safe_epoch, |blk| heap.deallocate(blk));
        if freed > 0 {
            trace!(target: "nvm_epoch::garbage", event = "free_local", tid, safe_epoch, freed);
        }
    }

    /// Free every thread's blocks registered at or before `safe_epoch`.
    /// Thread-local containers are left to their owners.
    pub(crate) fn help_free<H: PersistentHeap>(&self, heap: &H, safe_epoch: u64) {
        if let Self::PerEpoch(bags) = self {
            for tid in 0..bags.len() {
                self.help_free_local(heap, safe_epoch, tid);
            }
        }
    }

    /// Free everything, whoever owns it. Only valid once no transaction runs.
    pub(crate) fn free_all<H: PersistentHeap>(&self, heap: &H) {
        if let Self::ThreadLocal(bags) | Self::PerEpoch(bags) = self {
            debug!(target: "nvm_epoch::garbage", event = "free_all", pending = self.pending_count());
            for tid in 0..bags.len() {
                self.help_free_local(heap, u64::MAX, tid);
            }
        }
    }

    /// `(epoch, count)` of the bags waiting in `tid`'s container.
    #[cfg(test)]
    pub(crate) fn pending_local(&self, tid: usize) -> Vec<(u64, usize)> {
        match self {
            Self::ThreadLocal(bags) | Self::PerEpoch(bags) => bags[tid].lock().epochs().collect(),
            Self::No => Vec::new(),
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        match self {
            Self::ThreadLocal(bags) | Self::PerEpoch(bags) => {
                bags.iter().map(|bag| bag.lock().len()).sum()
            }
            Self::No => 0,
        }
    }
}
