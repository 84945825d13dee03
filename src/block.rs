//! Persistent block headers, block kinds and the epoch constants.
//!
//! 持久块头、块类型与纪元常量。

use crate::sync::{AtomicU64, Ordering};
use std::fmt;

/// Epoch value meaning "no epoch": never assigned, or reset by an abort.
/// 表示"无纪元"的值：从未赋值，或被中止操作重置。
pub const NULL_EPOCH: u64 = 0;

/// The first epoch of a fresh engine.
/// 新引擎的第一个纪元。
pub const INIT_EPOCH: u64 = 3;

/// Number of epochs a retired or superseded block waits before it is freed.
///
/// The same lag bounds what recovery trusts: only epochs at or below
/// `recovered_epoch - RECLAIM_LAG` are known to be completely persisted.
///
/// 已退休或被取代的块在释放前需要等待的纪元数。
/// 恢复时同样只信任 `recovered_epoch - RECLAIM_LAG` 及以前的纪元。
pub const RECLAIM_LAG: u64 = 2;

/// Number of per-thread buckets used to key pending work by `epoch % EPOCH_WINDOW`.
pub(crate) const EPOCH_WINDOW: usize = 4;

/// Size, in bytes, charged for the block header when sizing flushes.
pub const PBLK_HEADER_SIZE: usize = 64;

pub(crate) const CACHE_LINE_SIZE: usize = 64;

#[inline]
pub(crate) fn bucket_of(epoch: u64) -> usize {
    (epoch % EPOCH_WINDOW as u64) as usize
}

/// The role of a durable block.
///
/// Client records move `Init -> Alloc -> Update* -> Delete`. `Epoch` and
/// `Desc` blocks belong to the engine, `Owned` blocks hang off another record.
///
/// 持久块的角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BlkType {
    #[default]
    Init,
    Alloc,
    Update,
    Delete,
    Epoch,
    Desc,
    Owned,
}

/// A stable handle to a block in a [`PersistentHeap`](crate::PersistentHeap).
///
/// The generation makes a handle to a freed slot detectably stale.
///
/// 持久堆中块的稳定句柄。代数使得指向已释放槽位的句柄可被检测为过期。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

impl BlockId {
    /// Generations wrap below this bound so a handle always fits in 63 bits.
    pub const MAX_GENERATION: u32 = 1 << 31;

    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        debug_assert!(generation < Self::MAX_GENERATION);
        Self { index, generation }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a word whose top bit is clear.
    #[inline]
    pub fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: ((raw >> 32) as u32) & (Self::MAX_GENERATION - 1),
        }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}v{})", self.index, self.generation)
    }
}

const SEQ_BITS: u32 = 48;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

/// Pack a `(thread, sequence)` pair. Zero means "not written by a
/// descriptor-guarded transaction".
#[inline]
pub(crate) fn pack_tid_sn(tid: usize, sn: u64) -> u64 {
    ((tid as u64) << SEQ_BITS) | (sn & SEQ_MASK)
}

#[inline]
pub(crate) fn unpack_tid_sn(tid_sn: u64) -> (usize, u64) {
    ((tid_sn >> SEQ_BITS) as usize, tid_sn & SEQ_MASK)
}

/// Payload of the `EPOCH` block: the global epoch, little endian.
pub(crate) fn encode_epoch(epoch: u64) -> Vec<u8> {
    epoch.to_le_bytes().to_vec()
}

pub(crate) fn decode_epoch(payload: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(payload.get(..8)?.try_into().ok()?))
}

/// Payload of a `DESC` block: the owner's transaction sequence number and
/// whether that transaction committed.
pub(crate) fn encode_desc(sn: u64, committed: bool) -> Vec<u8> {
    let mut payload = sn.to_le_bytes().to_vec();
    payload.push(committed as u8);
    payload
}

pub(crate) fn decode_desc(payload: &[u8]) -> Option<(u64, bool)> {
    let sn = u64::from_le_bytes(payload.get(..8)?.try_into().ok()?);
    Some((sn, *payload.get(8)? != 0))
}

/// Header and payload of a durable record.
///
/// Clients never hold a `PBlk` directly. They hold a [`BlockId`] and go through
/// a [`Worker`](crate::Worker) or [`OpGuard`](crate::OpGuard), which keeps the
/// header consistent with the epoch protocol.
///
/// 持久记录的头部和负载。客户端只持有 `BlockId`。
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PBlk {
    pub(crate) epoch: u64,
    pub(crate) blktype: BlkType,
    pub(crate) owner_id: u64,
    pub(crate) id: u64,
    /// Tombstone created for this version. Transient, never written back.
    pub(crate) retire: Option<BlockId>,
    pub(crate) tid_sn: u64,
    pub(crate) payload: Vec<u8>,
}

impl PBlk {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    /// A block whose lifetime is tied to the record with id `owner_id`.
    pub fn owned_by(owner_id: u64, payload: Vec<u8>) -> Self {
        Self {
            blktype: BlkType::Owned,
            owner_id,
            payload,
            ..Self::default()
        }
    }

    /// A block owned by the engine itself (`Epoch` or `Desc`).
    pub(crate) fn engine(blktype: BlkType, tid_sn: u64, payload: Vec<u8>) -> Self {
        Self {
            blktype,
            tid_sn,
            payload,
            ..Self::default()
        }
    }

    /// A copy sharing identity with `self` but none of its transient state.
    pub(crate) fn new_version(&self) -> Self {
        Self {
            retire: None,
            ..self.clone()
        }
    }

    /// A tombstone recording that `self.id` was deleted.
    pub(crate) fn tombstone(&self, epoch: u64, tid_sn: u64) -> Self {
        Self {
            epoch,
            blktype: BlkType::Delete,
            owner_id: self.owner_id,
            id: self.id,
            retire: None,
            tid_sn,
            payload: Vec::new(),
        }
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[inline]
    pub fn blktype(&self) -> BlkType {
        self.blktype
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    #[inline]
    pub fn retire(&self) -> Option<BlockId> {
        self.retire
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub(crate) fn tid_sn(&self) -> u64 {
        self.tid_sn
    }

    /// The durable image: everything except the transient retire link.
    pub(crate) fn durable_image(&self) -> Self {
        Self {
            retire: None,
            ..self.clone()
        }
    }

    /// What a never-flushed block looks like after a crash.
    pub(crate) fn zeroed(&self) -> Self {
        Self {
            payload: vec![0; self.payload.len()],
            ..Self::default()
        }
    }
}

impl fmt::Debug for PBlk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PBlk")
            .field("epoch", &self.epoch)
            .field("blktype", &self.blktype)
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("retire", &self.retire)
            .field("tid_sn", &self.tid_sn)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Per-thread generator of record ids.
///
/// Thread `t` hands out ids from `[t << shift, (t + 1) << shift)`, so ids are
/// unique without any shared counter.
///
/// 每线程的记录 id 生成器。线程 `t` 从自己的区间分配 id，无需共享计数器。
pub(crate) struct UidGenerator {
    shift: u32,
    next: Box<[crossbeam_utils::CachePadded<AtomicU64>]>,
}

impl UidGenerator {
    pub(crate) fn new(task_num: usize) -> Self {
        let bits = (task_num.max(2) - 1).ilog2() + 1;
        let shift = 64 - bits;
        let next = (0..task_num)
            .map(|tid| crossbeam_utils::CachePadded::new(AtomicU64::new(((tid as u64) << shift) + 1)))
            .collect();
        Self { shift, next }
    }

    #[inline]
    pub(crate) fn get_id(&self, tid: usize) -> u64 {
        self.next[tid].fetch_add(1, Ordering::Relaxed)
    }

    /// Make every id space resume above the highest id already in use.
    pub(crate) fn resume_after<I: IntoIterator<Item = u64>>(&self, seen: I) {
        for id in seen {
            if let Some(slot) = self.next.get((id >> self.shift) as usize) {
                slot.fetch_max(id + 1, Ordering::Relaxed);
            }
        }
    }
}
