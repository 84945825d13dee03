//! Epoch-based persistence and reclamation for concurrent data structures on
//! persistent memory.
//!
//! Time is cut into epochs. Every operation runs inside one epoch and stamps
//! the blocks it writes with it. At each epoch boundary the engine waits for
//! the operations of the epoch before the previous one to finish, writes
//! their blocks back, and only then publishes the next epoch. After a crash
//! the state is therefore consistent as of the end of some epoch, and
//! [recovery](EpochSys::recovered_blocks) rebuilds it from the blocks alone.
//!
//! Deleted and superseded blocks are freed once no operation can still hold
//! them, which is the same epoch argument run for reclamation.
//!
//! # Example
//! ```
//! use nvm_epoch::{AdvancerKind, EpochSys, SimHeap};
//!
//! let sys = EpochSys::builder()
//!     .advancer(AdvancerKind::No)
//!     .open(SimHeap::new())
//!     .unwrap();
//! let worker = sys.register_worker(0);
//!
//! let blk = worker.run_op(|op| Ok(op.pnew(b"hello".to_vec())));
//! let (blk, _) = worker.run_op(|op| op.write(blk, |data| data.extend_from_slice(b" world")));
//! worker.run_op(|op| op.read(blk, |data| assert_eq!(data, b"hello world")));
//!
//! sys.sync();
//! ```
//!
//! 面向持久内存上并发数据结构的基于纪元的持久化与回收。
//! 时间被划分为纪元；每个纪元边界时，引擎等待前一纪元的操作结束并写回其数据，
//! 然后才发布下一个纪元。崩溃后的状态因此总是一致于某个纪元的末尾。

mod advancer;
mod block;
mod buckets;
mod config;
mod domain;
mod error;
mod garbage;
mod heap;
mod lin_var;
mod mindicator;
mod persist;
mod recovery;
mod sim_heap;
mod state;
mod sync;
mod trans_tracker;
mod worker;

pub use block::{BlkType, BlockId, INIT_EPOCH, NULL_EPOCH, PBLK_HEADER_SIZE, PBlk, RECLAIM_LAG};
pub use config::{
    AdvancerKind, ContainerKind, DEFAULT_BUFFER_SIZE, DEFAULT_EPOCH_FREQ, DEFAULT_EPOCH_LENGTH,
    DEFAULT_HELP_FREQ, EngineMode, EpochConfig, EpochConfigBuilder, FreeStrategy,
    PersistTrackerKind, PersisterKind, TransTrackerKind, WriteBackStrategy,
};
pub use domain::{EpochSys, EpochSysBuilder};
pub use error::{ConfigError, EpochError, RecoveryError, SetupError};
pub use heap::{HeapRecovery, PersistentHeap};
pub use lin_var::{AtomicLinVar, MAX_LIN_VALUE};
pub use mindicator::{IncreasingMindicator, Mindicator, NOTHING_PENDING};
pub use recovery::RecoveryReport;
pub use sim_heap::SimHeap;
pub use worker::{OpGuard, Worker};

#[cfg(loom)]
#[doc(hidden)]
pub use trans_tracker::TransactionTracker;

#[cfg(test)]
mod tests;
