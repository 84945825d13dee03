//! An in-memory stand-in for a persistent-memory region.
//!
//! Each live block keeps two images: the volatile one every access sees, and
//! the durable one that survives [`SimHeap::simulate_crash`]. Only
//! [`write_back`](PersistentHeap::write_back) moves data from the first to the
//! second, so a test can check exactly what the engine made durable.
//!
//! 持久内存区域的内存模拟。每个块保存易失映像和持久映像，只有 `write_back` 会把数据写入持久映像。

use crate::block::{BlockId, CACHE_LINE_SIZE, PBLK_HEADER_SIZE, PBlk};
use crate::heap::{HeapRecovery, PersistentHeap};
use antidote::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct Entry {
    volatile: PBlk,
    durable: Option<PBlk>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Simulated persistent heap with crash injection.
///
/// 带崩溃注入的模拟持久堆。
pub struct SimHeap {
    slots: RwLock<Vec<Mutex<Slot>>>,
    free: Mutex<Vec<u32>>,
    restarted: AtomicBool,
    dirty: AtomicBool,
    flushed_lines: AtomicU64,
    deallocations: AtomicU64,
}

impl Default for SimHeap {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::default(),
            restarted: AtomicBool::default(),
            dirty: AtomicBool::default(),
            flushed_lines: AtomicU64::default(),
            deallocations: AtomicU64::default(),
        }
    }
}

impl SimHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lose every volatile image, as a power failure would.
    ///
    /// Blocks never written back come back zeroed. The next engine opened on
    /// this heap runs recovery.
    pub fn simulate_crash(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.reload();
    }

    /// Reopen the image after a shutdown, clean or not.
    pub fn restart(&self) {
        self.reload();
    }

    fn reload(&self) {
        let slots = self.slots.write();
        for slot in slots.iter() {
            let mut slot = slot.lock();
            if let Some(entry) = slot.entry.as_mut() {
                entry.volatile = match &entry.durable {
                    Some(durable) => durable.clone(),
                    None => entry.volatile.zeroed(),
                };
            }
        }
        self.restarted.store(true, Ordering::SeqCst);
    }

    /// Durable image of a live block.
    pub fn durable(&self, id: BlockId) -> Option<PBlk> {
        self.with_entry(id, |entry| entry.durable.clone()).flatten()
    }

    pub fn is_live(&self, id: BlockId) -> bool {
        self.with_entry(id, |_| ()).is_some()
    }

    /// Snapshot of every live block's volatile image.
    pub fn live_blocks(&self) -> Vec<(BlockId, PBlk)> {
        let slots = self.slots.read();
        slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let slot = slot.lock();
                slot.entry
                    .as_ref()
                    .map(|entry| (BlockId::new(index as u32, slot.generation), entry.volatile.clone()))
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        let slots = self.slots.read();
        slots.iter().filter(|slot| slot.lock().entry.is_some()).count()
    }

    /// Cache lines written back so far.
    pub fn flushed_lines(&self) -> u64 {
        self.flushed_lines.load(Ordering::Relaxed)
    }

    pub fn deallocations(&self) -> u64 {
        self.deallocations.load(Ordering::Relaxed)
    }

    fn with_entry<R>(&self, id: BlockId, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let slots = self.slots.read();
        let mut slot = slots.get(id.index() as usize)?.lock();
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_mut().map(f)
    }
}

impl PersistentHeap for SimHeap {
    type Cursor = std::vec::IntoIter<BlockId>;

    fn allocate(&self, blk: PBlk) -> BlockId {
        let entry = Entry {
            volatile: blk,
            durable: None,
        };
        if let Some(index) = self.free.lock().pop() {
            let slots = self.slots.read();
            let mut slot = slots[index as usize].lock();
            slot.generation = (slot.generation + 1) % BlockId::MAX_GENERATION;
            slot.entry = Some(entry);
            return BlockId::new(index, slot.generation);
        }
        let mut slots = self.slots.write();
        let index = slots.len() as u32;
        slots.push(Mutex::new(Slot {
            generation: 0,
            entry: Some(entry),
        }));
        BlockId::new(index, 0)
    }

    fn deallocate(&self, id: BlockId) {
        let released = {
            let slots = self.slots.read();
            match slots.get(id.index() as usize).map(Mutex::lock) {
                Some(mut slot) if slot.generation == id.generation() => slot.entry.take().is_some(),
                _ => false,
            }
        };
        assert!(released, "BUG: deallocating {id:?}, which is not live");
        self.free.lock().push(id.index());
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    fn malloc_size(&self, id: BlockId) -> Option<usize> {
        self.with_entry(id, |entry| PBLK_HEADER_SIZE + entry.volatile.payload.len())
    }

    fn read<R>(&self, id: BlockId, f: impl FnOnce(&PBlk) -> R) -> Option<R> {
        self.with_entry(id, |entry| f(&entry.volatile))
    }

    fn write<R>(&self, id: BlockId, f: impl FnOnce(&mut PBlk) -> R) -> Option<R> {
        self.with_entry(id, |entry| f(&mut entry.volatile))
    }

    fn write_back(&self, id: BlockId, len: usize) {
        let flushed = self.with_entry(id, |entry| {
            entry.durable = Some(entry.volatile.durable_image());
        });
        if flushed.is_some() {
            let lines = len.div_ceil(CACHE_LINE_SIZE).max(1) as u64;
            self.flushed_lines.fetch_add(lines, Ordering::Relaxed);
        }
    }

    fn is_restart(&self) -> bool {
        self.restarted.load(Ordering::SeqCst)
    }

    fn recover(&self, threads: usize) -> HeapRecovery<Self::Cursor> {
        let threads = threads.max(1);
        let mut shards = vec![Vec::new(); threads];
        let slots = self.slots.read();
        for (index, slot) in slots.iter().enumerate() {
            let slot = slot.lock();
            if slot.entry.is_some() {
                shards[index % threads].push(BlockId::new(index as u32, slot.generation));
            }
        }
        HeapRecovery {
            dirty: self.dirty.load(Ordering::SeqCst),
            cursors: shards.into_iter().map(Vec::into_iter).collect(),
        }
    }

    fn close(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}
