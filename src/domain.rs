//! The engine handle: opening, background threads and shutdown.
//!
//! # Logging
//! - `info` (`nvm_epoch::sys`): engine open and shutdown.
//!
//! 引擎句柄：打开、后台线程与关闭。

use crate::advancer::run_dedicated;
use crate::block::{BlkType, BlockId, INIT_EPOCH, PBLK_HEADER_SIZE, PBlk, encode_epoch};
use crate::config::{
    AdvancerKind, EngineMode, EpochConfig, EpochConfigBuilder, FreeStrategy, PersisterKind,
    TransTrackerKind, WriteBackStrategy,
};
use crate::error::SetupError;
use crate::heap::PersistentHeap;
use crate::recovery::{RecoveryReport, recover};
use crate::state::{Boot, SharedState};
use crate::sync::Arc;
use crate::worker::Worker;
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

/// Builder for an [`EpochSys`].
///
/// Every setter forwards to [`EpochConfigBuilder`]; see there for defaults.
///
/// # Example
/// ```
/// use nvm_epoch::{AdvancerKind, EpochSys, SimHeap};
///
/// let sys = EpochSys::builder()
///     .task_num(2)
///     .advancer(AdvancerKind::No)
///     .open(SimHeap::new())
///     .unwrap();
/// assert_eq!(sys.current_epoch(), nvm_epoch::INIT_EPOCH);
/// ```
///
/// `EpochSys` 的构建器。
#[derive(Debug, Clone, Default)]
pub struct EpochSysBuilder {
    config: EpochConfigBuilder,
}

impl EpochSysBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn task_num(mut self, task_num: usize) -> Self {
        self.config = self.config.task_num(task_num);
        self
    }

    #[inline]
    pub fn epoch_length(mut self, length: Duration) -> Self {
        self.config = self.config.epoch_length(length);
        self
    }

    #[inline]
    pub fn write_back(mut self, strategy: WriteBackStrategy) -> Self {
        self.config = self.config.write_back(strategy);
        self
    }

    #[inline]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config = self.config.buffer_size(size);
        self
    }

    #[inline]
    pub fn persister(mut self, persister: PersisterKind) -> Self {
        self.config = self.config.persister(persister);
        self
    }

    #[inline]
    pub fn free(mut self, free: FreeStrategy) -> Self {
        self.config = self.config.free(free);
        self
    }

    #[inline]
    pub fn trans_tracker(mut self, tracker: TransTrackerKind) -> Self {
        self.config = self.config.trans_tracker(tracker);
        self
    }

    #[inline]
    pub fn advancer(mut self, advancer: AdvancerKind) -> Self {
        self.config = self.config.advancer(advancer);
        self
    }

    #[inline]
    pub fn mode(mut self, mode: EngineMode) -> Self {
        self.config = self.config.mode(mode);
        self
    }

    #[inline]
    pub fn recovery_threads(mut self, threads: usize) -> Self {
        self.config = self.config.recovery_threads(threads);
        self
    }

    /// Adjust any other option on the underlying [`EpochConfigBuilder`].
    #[inline]
    pub fn configure(mut self, f: impl FnOnce(EpochConfigBuilder) -> EpochConfigBuilder) -> Self {
        self.config = f(self.config);
        self
    }

    /// Validate the configuration and open the engine on `heap`.
    pub fn open<H: PersistentHeap + 'static>(self, heap: H) -> Result<EpochSys<H>, SetupError> {
        EpochSys::open(heap, self.config.build()?)
    }
}

/// An epoch-based persistence engine running on one persistent heap.
///
/// Opening the engine on a restarted heap recovers it first; the surviving
/// records are available from [`recovered_blocks`](Self::recovered_blocks).
/// Dropping the engine stops its threads, makes every pending write durable
/// and marks the heap as cleanly shut down. [`crash`](Self::crash) skips the
/// last two.
///
/// 运行在一个持久堆上的基于纪元的持久化引擎。
/// 在重启的堆上打开时会先执行恢复；销毁时停止后台线程、使所有写入持久化并标记干净关闭。
pub struct EpochSys<H: PersistentHeap + 'static> {
    shared: Arc<SharedState<H>>,
    threads: Vec<JoinHandle<()>>,
    crashed: bool,
    recovered: Option<HashMap<u64, BlockId>>,
    report: Option<RecoveryReport>,
}

impl EpochSys<crate::SimHeap> {
    /// Create a builder.
    ///
    /// 创建构建器。
    #[inline]
    pub fn builder() -> EpochSysBuilder {
        EpochSysBuilder::new()
    }
}

impl<H: PersistentHeap + 'static> EpochSys<H> {
    /// Open the engine with an already validated configuration.
    ///
    /// 使用已验证的配置打开引擎。
    pub fn open(heap: H, config: EpochConfig) -> Result<Self, SetupError> {
        info!(
            target: "nvm_epoch::sys",
            event = "open",
            task_num = config.task_num(),
            mode = ?config.mode(),
            write_back = ?config.write_back(),
            restart = heap.is_restart(),
        );

        let (boot, recovered, report) = if heap.is_restart() {
            let outcome = recover(&heap, config.recovery_threads())?;
            let epoch_block = match outcome.epoch_block {
                Some(blk) => blk,
                None => Self::new_epoch_block(&heap),
            };
            let boot = Boot {
                epoch_block,
                start_epoch: outcome.report.resumed_epoch,
                desc_seqs: outcome.desc_seqs,
                seen_ids: outcome.seen_ids,
            };
            (boot, Some(outcome.blocks), Some(outcome.report))
        } else {
            let boot = Boot {
                epoch_block: Self::new_epoch_block(&heap),
                start_epoch: INIT_EPOCH,
                desc_seqs: Vec::new(),
                seen_ids: Vec::new(),
            };
            (boot, None, None)
        };

        let shared = Arc::new(SharedState::new(heap, config, boot));
        let mut sys = Self {
            shared,
            threads: Vec::new(),
            crashed: false,
            recovered,
            report,
        };
        // On failure `sys` drops here and joins whatever already started.
        sys.spawn_threads()?;
        Ok(sys)
    }

    fn new_epoch_block(heap: &H) -> BlockId {
        let blk = heap.allocate(PBlk::engine(BlkType::Epoch, 0, encode_epoch(INIT_EPOCH)));
        heap.write_back(blk, PBLK_HEADER_SIZE + 8);
        heap.fence();
        blk
    }

    fn spawn_threads(&mut self) -> Result<(), SetupError> {
        if self.shared.advancer.dedicated().is_some() {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("nvm-epoch-advancer".to_owned())
                .spawn(move || run_dedicated(&shared))
                .map_err(|err| SetupError::Spawn {
                    name: "epoch advancer",
                    reason: err.to_string(),
                })?;
            self.threads.push(handle);
        }
        if self.shared.to_be_persisted.signals().is_some() {
            for tid in 0..self.shared.config.task_num() {
                let shared = Arc::clone(&self.shared);
                let handle = std::thread::Builder::new()
                    .name(format!("nvm-epoch-persister-{tid}"))
                    .spawn(move || shared.to_be_persisted.run_persister(&shared.heap, tid))
                    .map_err(|err| SetupError::Spawn {
                        name: "persister",
                        reason: err.to_string(),
                    })?;
                self.threads.push(handle);
            }
        }
        Ok(())
    }

    /// Bind worker id `tid` to a new [`Worker`].
    ///
    /// # Panics
    /// If `tid` is not below the configured task number or is already bound.
    ///
    /// 将工作线程 id `tid` 绑定到新的 `Worker`。
    pub fn register_worker(&self, tid: usize) -> Worker<H> {
        Worker::new(Arc::clone(&self.shared), tid)
    }

    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.shared.current_epoch()
    }

    #[inline]
    pub fn config(&self) -> &EpochConfig {
        &self.shared.config
    }

    /// Block until everything written before the call is durable.
    ///
    /// 阻塞直到调用前的所有写入都已持久化。
    pub fn sync(&self) {
        self.shared.sync();
    }

    /// Advance until every pending write-back and deferred free has run.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Advance once from the current epoch, whatever the advancer policy.
    pub fn advance_epoch(&self) {
        self.shared.advance_epoch_dedicated();
    }

    /// Force the global epoch to `epoch` and make it durable.
    ///
    /// Meant for tests and tools; no transaction may be running.
    pub fn set_epoch(&self, epoch: u64) {
        self.shared.set_epoch(epoch);
    }

    /// Live records found by recovery, keyed by record id. `None` on a
    /// fresh heap.
    ///
    /// 恢复得到的存活记录，以记录 id 为键。新堆上为 `None`。
    #[inline]
    pub fn recovered_blocks(&self) -> Option<&HashMap<u64, BlockId>> {
        self.recovered.as_ref()
    }

    #[inline]
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.report.as_ref()
    }

    #[inline]
    pub fn heap(&self) -> &H {
        &self.shared.heap
    }

    /// Stop the engine without the clean-shutdown work, leaving the heap as
    /// a crash at this instant would.
    pub fn crash(mut self) {
        self.crashed = true;
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &SharedState<H> {
        &self.shared
    }

    fn stop_threads(&mut self) {
        if let Some(dedicated) = self.shared.advancer.dedicated() {
            dedicated.stop();
        }
        if let Some(signals) = self.shared.to_be_persisted.signals() {
            signals.iter().for_each(|signal| signal.shutdown());
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<H: PersistentHeap + 'static> Drop for EpochSys<H> {
    fn drop(&mut self) {
        self.stop_threads();
        if !self.crashed {
            self.shared.flush();
            self.shared.to_be_freed.free_all(&self.shared.heap);
            self.shared.heap.close();
        }
        info!(
            target: "nvm_epoch::sys",
            event = "shutdown",
            epoch = self.shared.current_epoch(),
            clean = !self.crashed,
        );
    }
}
