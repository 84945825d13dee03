//! Write-back of blocks registered during a transaction.
//!
//! A write registered in epoch `c` must reach durable media before the epoch
//! after `c` is retired, that is before the global epoch becomes `c + 2`.
//! [`ToBePersisted`] decides how much of that work is done inline and how
//! much is deferred to the epoch boundary.
//!
//! # Logging
//! - `trace` (`nvm_epoch::persist`): per-thread drains.
//! - `debug` (`nvm_epoch::persist`): persister thread start and stop.
//!
//! 事务期间登记的块的写回。在纪元 `c` 登记的写入必须在全局纪元变为 `c + 2` 之前持久化。

use crate::block::{BlockId, NULL_EPOCH, bucket_of};
use crate::buckets::{EpochBucket, EpochBuckets, PersistEntry};
use crate::heap::PersistentHeap;
use crate::mindicator::PersistTracker;
use crate::sync::{Condvar, Mutex};
use crossbeam_utils::CachePadded;
use std::time::Duration;
use tracing::{debug, trace};

/// How long a producer waits on its persister before draining by itself.
const PERSISTER_PATIENCE: Duration = Duration::from_millis(10);

/// Write-back policy of an engine.
///
/// 引擎的写回策略。
pub(crate) enum ToBePersisted {
    /// Flush at registration time. The epoch boundary only fences.
    DirWB,
    /// Small per-thread rings; a full ring is partly drained on the spot.
    BufferedWB(EpochBuffers),
    /// Everything waits for the epoch boundary.
    PerEpoch(EpochBuffers),
    No,
}

impl ToBePersisted {
    pub(crate) fn register_persist<H: PersistentHeap>(
        &self,
        heap: &H,
        blk: BlockId,
        len: usize,
        c: u64,
        tid: usize,
    ) {
        assert!(c != NULL_EPOCH, "BUG: registering a write-back in the null epoch");
        match self {
            Self::DirWB => heap.write_back(blk, len),
            Self::BufferedWB(buffers) | Self::PerEpoch(buffers) => {
                buffers.push(heap, PersistEntry { blk, len }, c, tid)
            }
            Self::No => {}
        }
    }

    /// Drain `tid`'s entries for every epoch up to `c` and fence.
    ///
    /// 写回 `tid` 在 `c` 及之前纪元的所有条目并执行屏障。
    pub(crate) fn persist_epoch_local<H: PersistentHeap>(&self, heap: &H, c: u64, tid: usize) {
        match self {
            Self::DirWB => heap.fence(),
            Self::BufferedWB(buffers) | Self::PerEpoch(buffers) => {
                buffers.persist_epoch_local(heap, c, tid);
                heap.fence();
            }
            Self::No => {}
        }
    }

    /// Make every thread's writes of epoch `c` and earlier durable.
    pub(crate) fn persist_epoch<H: PersistentHeap>(&self, heap: &H, c: u64) {
        match self {
            Self::DirWB => heap.fence(),
            Self::BufferedWB(buffers) | Self::PerEpoch(buffers) => {
                buffers.persist_epoch(heap, c);
                heap.fence();
            }
            Self::No => {}
        }
    }

    /// Whether `tid` may still hold entries for epochs before `e`.
    pub(crate) fn owes_before(&self, e: u64, tid: usize) -> bool {
        match self {
            Self::BufferedWB(buffers) | Self::PerEpoch(buffers) => buffers.tracker.owes_before(e, tid),
            Self::DirWB | Self::No => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_local(&self, tid: usize) -> usize {
        match self {
            Self::BufferedWB(buffers) | Self::PerEpoch(buffers) => buffers.pending_local(tid),
            Self::DirWB | Self::No => 0,
        }
    }

    pub(crate) fn signals(&self) -> Option<&[PersisterSignal]> {
        match self {
            Self::BufferedWB(buffers) | Self::PerEpoch(buffers) => buffers.signals.as_deref(),
            Self::DirWB | Self::No => None,
        }
    }

    /// Body of the dedicated persister thread serving worker `tid`.
    pub(crate) fn run_persister<H: PersistentHeap>(&self, heap: &H, tid: usize) {
        let (Self::BufferedWB(buffers) | Self::PerEpoch(buffers)) = self else {
            return;
        };
        let Some(signals) = buffers.signals.as_deref() else {
            return;
        };
        debug!(target: "nvm_epoch::persist", event = "persister_start", tid);
        while let Some(request) = signals[tid].next_request() {
            match request.kind {
                RequestKind::Dump => buffers.dump_local(heap, request.epoch, tid),
                RequestKind::Drain => {
                    buffers.persist_epoch_local(heap, request.epoch, tid);
                    heap.fence();
                }
            }
            signals[tid].finish(request.ticket);
        }
        debug!(target: "nvm_epoch::persist", event = "persister_stop", tid);
    }
}

struct LocalPersist {
    buckets: EpochBuckets,
    last_write_epoch: u64,
}

/// Per-thread epoch buckets plus the tree tracking who still owes what.
pub(crate) struct EpochBuffers {
    locals: Box<[CachePadded<Mutex<LocalPersist>>]>,
    tracker: PersistTracker,
    dump_size: usize,
    signals: Option<Box<[PersisterSignal]>>,
}

impl EpochBuffers {
    pub(crate) fn new(
        task_num: usize,
        make_bucket: impl Fn() -> EpochBucket,
        dump_size: usize,
        tracker: PersistTracker,
        dedicated_persisters: bool,
    ) -> Self {
        let locals = (0..task_num)
            .map(|_| {
                CachePadded::new(Mutex::new(LocalPersist {
                    buckets: std::array::from_fn(|_| make_bucket()),
                    last_write_epoch: NULL_EPOCH,
                }))
            })
            .collect();
        let signals = dedicated_persisters
            .then(|| (0..task_num).map(|_| PersisterSignal::new()).collect());
        Self {
            locals,
            tracker,
            dump_size: dump_size.max(1),
            signals,
        }
    }

    fn push<H: PersistentHeap>(&self, heap: &H, mut entry: PersistEntry, c: u64, tid: usize) {
        let mut local = self.locals[tid].lock();
        if local.last_write_epoch != c {
            local.last_write_epoch = c;
            self.tracker.first_write_on_new_epoch(c, tid);
        }
        loop {
            match local.buckets[bucket_of(c)].try_push(entry) {
                Ok(()) => return,
                Err(back) => entry = back,
            }
            let helped = match self.signals.as_deref() {
                Some(signals) => {
                    drop(local);
                    let helped = signals[tid].request_and_wait(RequestKind::Dump, c);
                    local = self.locals[tid].lock();
                    helped
                }
                None => false,
            };
            if !helped {
                Self::dump(heap, &mut local.buckets[bucket_of(c)], self.dump_size);
            }
        }
    }

    fn dump<H: PersistentHeap>(heap: &H, bucket: &mut EpochBucket, dump_size: usize) {
        for _ in 0..dump_size {
            match bucket.pop() {
                Some(entry) => heap.write_back(entry.blk, entry.len),
                None => break,
            }
        }
    }

    fn dump_local<H: PersistentHeap>(&self, heap: &H, c: u64, tid: usize) {
        let mut local = self.locals[tid].lock();
        Self::dump(heap, &mut local.buckets[bucket_of(c)], self.dump_size);
    }

    fn persist_epoch_local<H: PersistentHeap>(&self, heap: &H, c: u64, tid: usize) {
        let mut local = self.locals[tid].lock();
        let mut flushed = 0usize;
        for epoch in c.saturating_sub(2)..=c {
            local.buckets[bucket_of(epoch)].drain(|entry| {
                heap.write_back(entry.blk, entry.len);
                flushed += 1;
            });
        }
        self.tracker.after_persist_epoch(c, tid);
        trace!(target: "nvm_epoch::persist", event = "drain_local", tid, epoch = c, flushed);
    }

    fn persist_epoch<H: PersistentHeap>(&self, heap: &H, c: u64) {
        if let Some(signals) = self.signals.as_deref() {
            let tickets: Vec<_> = signals
                .iter()
                .map(|signal| signal.request(RequestKind::Drain, c))
                .collect();
            for (signal, ticket) in signals.iter().zip(tickets) {
                signal.wait(ticket);
            }
        }
        // Stragglers, and everything when no persister threads run.
        let mut curr = 0;
        while let Some(tid) = self.tracker.next_thread_to_persist_from(c, curr) {
            self.persist_epoch_local(heap, c, tid);
            curr = tid;
        }
        while let Some(tid) = self.tracker.next_thread_to_persist(c) {
            self.persist_epoch_local(heap, c, tid);
        }
    }

    #[cfg(test)]
    fn pending_local(&self, tid: usize) -> usize {
        self.locals[tid].lock().buckets.iter().map(EpochBucket::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// Write back part of one bucket to make room.
    Dump,
    /// Write back everything up to the epoch.
    Drain,
}

#[derive(Debug, Clone, Copy)]
struct Request {
    kind: RequestKind,
    epoch: u64,
    ticket: u64,
}

#[derive(Default)]
struct SignalState {
    requested: u64,
    served: u64,
    kind: Option<RequestKind>,
    epoch: u64,
    exit: bool,
}

/// Mailbox between one worker and its dedicated persister thread.
///
/// 工作线程与其专属持久化线程之间的信箱。
pub(crate) struct PersisterSignal {
    state: Mutex<SignalState>,
    ring: Condvar,
}

impl PersisterSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            ring: Condvar::new(),
        }
    }

    fn request(&self, kind: RequestKind, epoch: u64) -> u64 {
        let mut state = self.state.lock();
        state.requested += 1;
        // A pending drain subsumes a dump.
        if state.kind != Some(RequestKind::Drain) || kind == RequestKind::Drain {
            state.kind = Some(kind);
        }
        state.epoch = state.epoch.max(epoch);
        let ticket = state.requested;
        drop(state);
        self.ring.notify_all();
        ticket
    }

    /// Wait until `ticket` is served. Returns `false` if the persister is
    /// gone or too slow, in which case the caller does the work itself.
    fn wait(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        while state.served < ticket {
            if state.exit {
                return false;
            }
            let (guard, timeout) = self.ring.wait_timeout(state, PERSISTER_PATIENCE);
            state = guard;
            if timeout.timed_out() && state.served < ticket {
                return false;
            }
        }
        true
    }

    fn request_and_wait(&self, kind: RequestKind, epoch: u64) -> bool {
        let ticket = self.request(kind, epoch);
        self.wait(ticket)
    }

    fn next_request(&self) -> Option<Request> {
        let mut state = self.state.lock();
        loop {
            if state.exit {
                return None;
            }
            if state.requested > state.served {
                let kind = state.kind.take().unwrap_or(RequestKind::Dump);
                return Some(Request {
                    kind,
                    epoch: state.epoch,
                    ticket: state.requested,
                });
            }
            state = self.ring.wait(state);
        }
    }

    fn finish(&self, ticket: u64) {
        let mut state = self.state.lock();
        state.served = state.served.max(ticket);
        drop(state);
        self.ring.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().exit = true;
        self.ring.notify_all();
    }
}
