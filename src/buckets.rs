//! Per-epoch buffers of pending write-backs.
//!
//! 按纪元划分的待写回缓冲区。

use crate::block::{BlockId, EPOCH_WINDOW};
use std::collections::{HashMap, VecDeque};

/// A block range waiting for a write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PersistEntry {
    pub(crate) blk: BlockId,
    pub(crate) len: usize,
}

/// Backing store of one epoch bucket.
///
/// 一个纪元桶的底层存储。
#[derive(Debug)]
pub(crate) enum EpochBucket {
    /// Fixed-capacity ring. A full ring refuses the push.
    Ring {
        entries: VecDeque<PersistEntry>,
        capacity: usize,
    },
    /// Unbounded vector.
    Vector(Vec<PersistEntry>),
    /// Coalesces repeated registrations of one block, keeping the largest
    /// range. Bounded when `capacity` is set.
    Set {
        entries: HashMap<BlockId, usize>,
        capacity: Option<usize>,
    },
}

impl EpochBucket {
    pub(crate) fn ring(capacity: usize) -> Self {
        Self::Ring {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn vector() -> Self {
        Self::Vector(Vec::new())
    }

    pub(crate) fn set(capacity: Option<usize>) -> Self {
        Self::Set {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Hands the entry back when the bucket is full.
    pub(crate) fn try_push(&mut self, entry: PersistEntry) -> Result<(), PersistEntry> {
        match self {
            Self::Ring { entries, capacity } => {
                if entries.len() >= *capacity {
                    return Err(entry);
                }
                entries.push_back(entry);
            }
            Self::Vector(entries) => entries.push(entry),
            Self::Set { entries, capacity } => {
                if let Some(len) = entries.get_mut(&entry.blk) {
                    *len = (*len).max(entry.len);
                    return Ok(());
                }
                if capacity.is_some_and(|cap| entries.len() >= cap) {
                    return Err(entry);
                }
                entries.insert(entry.blk, entry.len);
            }
        }
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<PersistEntry> {
        match self {
            Self::Ring { entries, .. } => entries.pop_front(),
            Self::Vector(entries) => entries.pop(),
            Self::Set { entries, .. } => {
                let blk = *entries.keys().next()?;
                entries
                    .remove(&blk)
                    .map(|len| PersistEntry { blk, len })
            }
        }
    }

    pub(crate) fn drain(&mut self, mut f: impl FnMut(PersistEntry)) {
        match self {
            Self::Ring { entries, .. } => entries.drain(..).for_each(f),
            Self::Vector(entries) => entries.drain(..).for_each(f),
            Self::Set { entries, .. } => entries
                .drain()
                .for_each(|(blk, len)| f(PersistEntry { blk, len })),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Ring { entries, .. } => entries.len(),
            Self::Vector(entries) => entries.len(),
            Self::Set { entries, .. } => entries.len(),
        }
    }
}

/// One thread's buckets, indexed by `epoch % EPOCH_WINDOW`.
pub(crate) type EpochBuckets = [EpochBucket; EPOCH_WINDOW];
