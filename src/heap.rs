//! The persistent heap interface the engine runs on.
//!
//! 引擎所依赖的持久堆接口。

use crate::block::{BlockId, PBlk};
use crate::sync::{Arc, Ordering, fence};

/// Blocks handed back by a restarted heap, split for parallel scanning.
///
/// 重启后的堆返回的块，按并行扫描划分。
pub struct HeapRecovery<C> {
    /// The previous run did not shut down cleanly.
    pub dirty: bool,
    /// One cursor per recovery thread. Together they yield every allocated
    /// block exactly once.
    pub cursors: Vec<C>,
}

/// The persistent-region allocator the engine runs on.
///
/// The engine only needs storage that survives a crash in the state left by
/// the last [`write_back`](Self::write_back), plus a way to enumerate every
/// allocated block after a restart. Block contents are reached through the
/// `read`/`write` closures; both return `None` for a stale handle.
///
/// 引擎运行所依赖的持久区域分配器。
/// 引擎只需要：崩溃后保留最近一次 `write_back` 状态的存储，以及重启后枚举所有已分配块的方法。
pub trait PersistentHeap: Send + Sync {
    type Cursor: Iterator<Item = BlockId> + Send;

    fn allocate(&self, blk: PBlk) -> BlockId;

    /// Return a block's storage. The deallocation itself is durable.
    fn deallocate(&self, id: BlockId);

    /// Bytes occupied by the block, header included.
    fn malloc_size(&self, id: BlockId) -> Option<usize>;

    fn read<R>(&self, id: BlockId, f: impl FnOnce(&PBlk) -> R) -> Option<R>;

    fn write<R>(&self, id: BlockId, f: impl FnOnce(&mut PBlk) -> R) -> Option<R>;

    /// Flush the first `len` bytes of the block toward durable media.
    /// Ordering against later stores requires a [`fence`](Self::fence).
    fn write_back(&self, id: BlockId, len: usize);

    fn fence(&self) {
        fence(Ordering::SeqCst);
    }

    /// The heap was opened over an existing image.
    fn is_restart(&self) -> bool;

    fn recover(&self, threads: usize) -> HeapRecovery<Self::Cursor>;

    /// Mark the image as cleanly shut down.
    fn close(&self) {}
}

impl<H: PersistentHeap + ?Sized> PersistentHeap for Arc<H> {
    type Cursor = H::Cursor;

    #[inline]
    fn allocate(&self, blk: PBlk) -> BlockId {
        (**self).allocate(blk)
    }

    #[inline]
    fn deallocate(&self, id: BlockId) {
        (**self).deallocate(id)
    }

    #[inline]
    fn malloc_size(&self, id: BlockId) -> Option<usize> {
        (**self).malloc_size(id)
    }

    #[inline]
    fn read<R>(&self, id: BlockId, f: impl FnOnce(&PBlk) -> R) -> Option<R> {
        (**self).read(id, f)
    }

    #[inline]
    fn write<R>(&self, id: BlockId, f: impl FnOnce(&mut PBlk) -> R) -> Option<R> {
        (**self).write(id, f)
    }

    #[inline]
    fn write_back(&self, id: BlockId, len: usize) {
        (**self).write_back(id, len)
    }

    #[inline]
    fn fence(&self) {
        (**self).fence()
    }

    #[inline]
    fn is_restart(&self) -> bool {
        (**self).is_restart()
    }

    #[inline]
    fn recover(&self, threads: usize) -> HeapRecovery<Self::Cursor> {
        (**self).recover(threads)
    }

    #[inline]
    fn close(&self) {
        (**self).close()
    }
}
