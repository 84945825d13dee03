//! Parallel two-pass reconstruction of a restarted heap.
//!
//! Pass 1 finds the epoch, the tombstones and the per-thread descriptors.
//! Pass 2 picks, for every id, the newest version that is old enough to be
//! completely persisted, belongs to a committed transaction and is not
//! deleted. Everything else is returned to the heap.
//!
//! Threads fold their local results into the global state one at a time, in
//! thread order, by passing a turn token; barriers separate the phases.
//!
//! # Logging
//! - `info` (`nvm_epoch::recovery`): start and finish with counts.
//! - `warn` (`nvm_epoch::recovery`): premature tombstones, tombstones left by
//!   a clean shutdown.
//!
//! 重启堆的并行两遍重建。第一遍找出纪元、墓碑和描述符；第二遍为每个 id 选出最新的有效版本。

use crate::block::{
    BlkType, BlockId, INIT_EPOCH, NULL_EPOCH, RECLAIM_LAG, decode_desc, decode_epoch,
    unpack_tid_sn,
};
use crate::error::RecoveryError;
use crate::heap::PersistentHeap;
use antidote::Mutex;
use crossbeam_utils::Backoff;
use std::collections::{HashMap, HashSet};
use std::sync::Barrier;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{info, warn};

/// Summary of one recovery.
///
/// 一次恢复的摘要。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The previous run did not shut down cleanly.
    pub dirty: bool,
    /// Highest epoch found on the heap.
    pub recovered_epoch: u64,
    /// Epoch the engine resumes in.
    pub resumed_epoch: u64,
    /// Blocks handed back as live records.
    pub kept: usize,
    /// Blocks returned to the heap, tombstones and descriptors included.
    pub discarded: usize,
    /// Tombstones that deleted a record.
    pub tombstones: usize,
    /// Tombstones ignored because their epoch may not be fully persisted or
    /// their transaction never committed.
    pub premature_tombstones: usize,
}

/// Everything the engine needs from a recovery.
pub(crate) struct Recovered {
    pub(crate) blocks: HashMap<u64, BlockId>,
    pub(crate) report: RecoveryReport,
    pub(crate) epoch_block: Option<BlockId>,
    pub(crate) desc_seqs: Vec<u64>,
    pub(crate) seen_ids: Vec<u64>,
}

#[derive(Clone, Copy)]
struct Tombstone {
    id: u64,
    epoch: u64,
    tid_sn: u64,
    blk: BlockId,
}

#[derive(Clone, Copy)]
struct Desc {
    sn: u64,
    committed: bool,
}

#[derive(Clone, Copy)]
struct Version {
    epoch: u64,
    blk: BlockId,
    owner_id: u64,
    owned: bool,
}

#[derive(Default)]
struct FirstPass {
    max_epoch: u64,
    epoch_blocks: Vec<(BlockId, u64)>,
    tombstones: Vec<Tombstone>,
    descs: HashMap<usize, Desc>,
    desc_blocks: Vec<BlockId>,
    scanned: usize,
}

impl FirstPass {
    fn merge(&mut self, other: FirstPass) {
        self.max_epoch = self.max_epoch.max(other.max_epoch);
        self.epoch_blocks.extend(other.epoch_blocks);
        self.tombstones.extend(other.tombstones);
        for (tid, desc) in other.descs {
            self.descs
                .entry(tid)
                .and_modify(|kept| {
                    if desc.sn > kept.sn {
                        *kept = desc;
                    }
                })
                .or_insert(desc);
        }
        self.desc_blocks.extend(other.desc_blocks);
        self.scanned += other.scanned;
    }
}

/// Decisions taken between the passes.
struct Plan {
    cap: u64,
    deleted: HashSet<u64>,
    descs: HashMap<usize, (u64, bool)>,
}

impl Plan {
    /// Whether the transaction that wrote `tid_sn` committed. Untagged
    /// blocks, and tags of threads without a descriptor, count as committed.
    fn committed(&self, tid_sn: u64) -> bool {
        if tid_sn == 0 {
            return true;
        }
        let (tid, sn) = unpack_tid_sn(tid_sn);
        match self.descs.get(&tid) {
            Some(&(last, committed)) => sn < last || (sn == last && committed),
            None => true,
        }
    }
}

#[derive(Default)]
struct SecondPass {
    live: HashMap<u64, Version>,
    not_in_use: Vec<BlockId>,
}

impl SecondPass {
    fn offer(&mut self, id: u64, version: Version) {
        match self.live.get_mut(&id) {
            Some(kept) if kept.epoch >= version.epoch => self.not_in_use.push(version.blk),
            Some(kept) => {
                self.not_in_use.push(kept.blk);
                *kept = version;
            }
            None => {
                self.live.insert(id, version);
            }
        }
    }

    fn merge(&mut self, other: SecondPass) {
        self.not_in_use.extend(other.not_in_use);
        for (id, version) in other.live {
            self.offer(id, version);
        }
    }
}

struct Shared {
    turn: AtomicUsize,
    barrier: Barrier,
    first: Mutex<FirstPass>,
    plan: Mutex<Option<Result<std::sync::Arc<Plan>, RecoveryError>>>,
    second: Mutex<SecondPass>,
    garbage: Mutex<Vec<BlockId>>,
}

impl Shared {
    /// Run `f` when it is `me`'s turn, then pass the token on.
    fn in_turn(&self, me: usize, threads: usize, f: impl FnOnce()) {
        let backoff = Backoff::new();
        while self.turn.load(Ordering::Acquire) != me {
            backoff.snooze();
        }
        f();
        let next = me + 1;
        self.turn
            .store(if next == threads { 0 } else { next }, Ordering::Release);
    }
}

fn scan_first<H: PersistentHeap>(heap: &H, cursor: H::Cursor) -> FirstPass {
    let mut local = FirstPass::default();
    for blk in cursor {
        local.scanned += 1;
        heap.read(blk, |b| match b.blktype() {
            BlkType::Epoch => {
                local
                    .epoch_blocks
                    .push((blk, decode_epoch(b.payload()).unwrap_or(NULL_EPOCH)));
            }
            BlkType::Desc => {
                local.desc_blocks.push(blk);
                let (tid, _) = unpack_tid_sn(b.tid_sn());
                if let Some((sn, committed)) = decode_desc(b.payload()) {
                    let desc = Desc { sn, committed };
                    local
                        .descs
                        .entry(tid)
                        .and_modify(|kept| {
                            if sn > kept.sn {
                                *kept = desc;
                            }
                        })
                        .or_insert(desc);
                }
            }
            blktype => {
                local.max_epoch = local.max_epoch.max(b.epoch());
                if blktype == BlkType::Delete && b.epoch() != NULL_EPOCH {
                    local.tombstones.push(Tombstone {
                        id: b.id(),
                        epoch: b.epoch(),
                        tid_sn: b.tid_sn(),
                        blk,
                    });
                }
            }
        });
    }
    local
}

fn scan_second<H: PersistentHeap>(heap: &H, cursor: H::Cursor, plan: &Plan) -> SecondPass {
    let mut local = SecondPass::default();
    for blk in cursor {
        let verdict = heap.read(blk, |b| match b.blktype() {
            BlkType::Epoch | BlkType::Desc => None,
            BlkType::Delete if b.epoch() != NULL_EPOCH => None,
            BlkType::Init | BlkType::Delete => Some(None),
            _ if b.epoch() == NULL_EPOCH || b.epoch() > plan.cap => Some(None),
            _ if !plan.committed(b.tid_sn()) => Some(None),
            _ if plan.deleted.contains(&b.id()) => Some(None),
            blktype => Some(Some((
                b.id(),
                Version {
                    epoch: b.epoch(),
                    blk,
                    owner_id: b.owner_id(),
                    owned: blktype == BlkType::Owned,
                },
            ))),
        });
        match verdict.flatten() {
            Some(None) => local.not_in_use.push(blk),
            Some(Some((id, version))) => local.offer(id, version),
            None => {}
        }
    }
    local
}

fn plan_from(first: &FirstPass) -> Result<(Plan, u64, usize), RecoveryError> {
    let recovered = match first.epoch_blocks.as_slice() {
        [] => return Err(RecoveryError::MissingEpochBlock),
        [(_, epoch)] => (*epoch).max(first.max_epoch),
        blocks => {
            return Err(RecoveryError::DuplicateEpochBlock {
                count: blocks.len(),
            });
        }
    };
    let descs: HashMap<usize, (u64, bool)> = first
        .descs
        .iter()
        .map(|(&tid, desc)| (tid, (desc.sn, desc.committed)))
        .collect();
    let mut plan = Plan {
        cap: recovered.saturating_sub(RECLAIM_LAG),
        deleted: HashSet::new(),
        descs,
    };
    let mut premature = 0;
    for tombstone in &first.tombstones {
        if tombstone.epoch <= plan.cap && plan.committed(tombstone.tid_sn) {
            plan.deleted.insert(tombstone.id);
        } else {
            premature += 1;
        }
    }
    Ok((plan, recovered, premature))
}

/// Rebuild the id map of a restarted heap with `threads` threads.
///
/// 使用 `threads` 个线程重建重启堆的 id 映射。
pub(crate) fn recover<H: PersistentHeap>(
    heap: &H,
    threads: usize,
) -> Result<Recovered, RecoveryError> {
    let first_scan = heap.recover(threads);
    let second_scan = heap.recover(threads);
    let dirty = first_scan.dirty;
    let threads = first_scan.cursors.len().min(second_scan.cursors.len()).max(1);
    info!(target: "nvm_epoch::recovery", event = "recovery_start", threads, dirty);

    let shared = Shared {
        turn: AtomicUsize::new(0),
        barrier: Barrier::new(threads),
        first: Mutex::new(FirstPass::default()),
        plan: Mutex::new(None),
        second: Mutex::new(SecondPass::default()),
        garbage: Mutex::new(Vec::new()),
    };
    let premature = AtomicUsize::new(0);
    let recovered_epoch = AtomicU64::new(0);

    std::thread::scope(|scope| {
        let cursors = first_scan.cursors.into_iter().zip(second_scan.cursors);
        for (me, (first_cursor, second_cursor)) in cursors.enumerate().take(threads) {
            let shared = &shared;
            let premature = &premature;
            let recovered_epoch = &recovered_epoch;
            scope.spawn(move || {
                let local = scan_first(heap, first_cursor);
                shared.in_turn(me, threads, || shared.first.lock().merge(local));
                shared.barrier.wait();

                if me == 0 {
                    let first = shared.first.lock();
                    let plan = plan_from(&first).map(|(plan, recovered, count)| {
                        premature.store(count, Ordering::Relaxed);
                        recovered_epoch.store(recovered, Ordering::Relaxed);
                        std::sync::Arc::new(plan)
                    });
                    *shared.plan.lock() = Some(plan);
                }
                shared.barrier.wait();

                let plan = match shared.plan.lock().as_ref() {
                    Some(Ok(plan)) => plan.clone(),
                    _ => return,
                };
                let local = scan_second(heap, second_cursor, &plan);
                shared.in_turn(me, threads, || shared.second.lock().merge(local));
                shared.barrier.wait();

                if me == 0 {
                    let mut second = shared.second.lock();
                    let owners: HashSet<u64> = second.live.keys().copied().collect();
                    let orphans: Vec<u64> = second
                        .live
                        .iter()
                        .filter(|(_, v)| {
                            v.owned && (!owners.contains(&v.owner_id) || plan.deleted.contains(&v.owner_id))
                        })
                        .map(|(&id, _)| id)
                        .collect();
                    let mut garbage = std::mem::take(&mut second.not_in_use);
                    for id in orphans {
                        if let Some(version) = second.live.remove(&id) {
                            garbage.push(version.blk);
                        }
                    }
                    let first = shared.first.lock();
                    garbage.extend(first.tombstones.iter().map(|t| t.blk));
                    garbage.extend(first.desc_blocks.iter().copied());
                    *shared.garbage.lock() = garbage;
                }
                shared.barrier.wait();

                let mine: Vec<BlockId> = shared
                    .garbage
                    .lock()
                    .iter()
                    .skip(me)
                    .step_by(threads)
                    .copied()
                    .collect();
                for blk in mine {
                    heap.deallocate(blk);
                }
            });
        }
    });

    let first = shared.first.into_inner();
    if let Some(Err(err)) = shared.plan.into_inner() {
        // A heap that never held a block was simply never used.
        if first.scanned == 0 && err == RecoveryError::MissingEpochBlock {
            info!(target: "nvm_epoch::recovery", event = "recovery_empty_heap");
            return Ok(Recovered {
                blocks: HashMap::new(),
                report: RecoveryReport {
                    dirty,
                    resumed_epoch: INIT_EPOCH,
                    ..RecoveryReport::default()
                },
                epoch_block: None,
                desc_seqs: Vec::new(),
                seen_ids: Vec::new(),
            });
        }
        return Err(err);
    }

    let second = shared.second.into_inner();
    let garbage = shared.garbage.into_inner();
    let recovered = recovered_epoch.load(Ordering::Relaxed);
    let premature = premature.load(Ordering::Relaxed);
    let tombstones = first.tombstones.len() - premature;

    let blocks: HashMap<u64, BlockId> = second
        .live
        .iter()
        .map(|(&id, version)| (id, version.blk))
        .collect();
    let mut seen_ids: Vec<u64> = blocks.keys().copied().collect();
    seen_ids.extend(first.tombstones.iter().map(|t| t.id));

    let desc_len = first.descs.keys().max().map_or(0, |&tid| tid + 1);
    let mut desc_seqs = vec![0; desc_len];
    for (&tid, desc) in &first.descs {
        desc_seqs[tid] = desc.sn;
    }

    let report = RecoveryReport {
        dirty,
        recovered_epoch: recovered,
        resumed_epoch: (recovered + 1).max(INIT_EPOCH),
        kept: blocks.len(),
        discarded: garbage.len(),
        tombstones,
        premature_tombstones: premature,
    };
    if premature > 0 {
        warn!(target: "nvm_epoch::recovery", event = "premature_tombstones", count = premature, cap = recovered.saturating_sub(RECLAIM_LAG));
    }
    if !dirty && !first.tombstones.is_empty() {
        warn!(target: "nvm_epoch::recovery", event = "tombstones_after_clean_shutdown", count = first.tombstones.len());
    }
    info!(
        target: "nvm_epoch::recovery",
        event = "recovery_done",
        epoch = report.recovered_epoch,
        kept = report.kept,
        discarded = report.discarded,
        tombstones = report.tombstones,
    );

    Ok(Recovered {
        blocks,
        report,
        epoch_block: first.epoch_blocks.first().map(|(blk, _)| *blk),
        desc_seqs,
        seen_ids,
    })
}
