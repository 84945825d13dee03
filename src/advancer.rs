//! Policies deciding when the global epoch moves.
//!
//! # Logging
//! - `debug` (`nvm_epoch::advancer`): advancer thread start and stop.
//! - `warn` (`nvm_epoch::advancer`): a boundary took longer than the epoch length.
//!
//! 决定全局纪元何时推进的策略。

use crate::config::AdvancerKind;
use crate::heap::PersistentHeap;
use crate::state::SharedState;
use crate::sync::{AtomicU64, Condvar, Mutex, Ordering};
use crossbeam_utils::CachePadded;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sleep/stop handshake of the dedicated advancer thread.
pub(crate) struct DedicatedAdvancer {
    length: Duration,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl DedicatedAdvancer {
    /// Sleep for `dur` unless stopped first. Returns `false` once stopped.
    fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self.wake.wait_timeout(stopped, deadline - now);
            stopped = guard;
        }
        false
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

/// The advancing policy of an engine.
///
/// 引擎的纪元推进策略。
pub(crate) enum EpochAdvancer {
    /// A background thread advancing once per epoch length.
    Dedicated(DedicatedAdvancer),
    /// Thread 0 advances after every `epoch_freq` of its transactions.
    SingleThread {
        epoch_freq: u64,
        count: CachePadded<AtomicU64>,
    },
    /// Whoever ends the `epoch_freq`-th transaction advances; every
    /// `help_freq`-th transaction drains its own write-back backlog.
    GlobalCounter {
        epoch_freq: u64,
        help_freq: u64,
        count: CachePadded<AtomicU64>,
    },
    No,
}

impl EpochAdvancer {
    pub(crate) fn new(kind: AdvancerKind, length: Duration) -> Self {
        match kind {
            AdvancerKind::Dedicated => Self::Dedicated(DedicatedAdvancer {
                length,
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
            AdvancerKind::SingleThread { epoch_freq } => Self::SingleThread {
                epoch_freq,
                count: CachePadded::new(AtomicU64::new(0)),
            },
            AdvancerKind::GlobalCounter {
                epoch_freq,
                help_freq,
            } => Self::GlobalCounter {
                epoch_freq,
                help_freq,
                count: CachePadded::new(AtomicU64::new(0)),
            },
            AdvancerKind::No => Self::No,
        }
    }

    /// Hook run by every committed transaction of epoch `c`.
    pub(crate) fn on_end_transaction<H: PersistentHeap>(
        &self,
        sys: &SharedState<H>,
        c: u64,
        tid: usize,
    ) {
        match self {
            Self::SingleThread { epoch_freq, count } if tid == 0 => {
                let n = count.fetch_add(1, Ordering::Relaxed) + 1;
                if n % epoch_freq == 0 {
                    sys.advance_epoch(c);
                }
            }
            Self::GlobalCounter {
                epoch_freq,
                help_freq,
                count,
            } => {
                let n = count.fetch_add(1, Ordering::Relaxed) + 1;
                if n % epoch_freq == 0 {
                    sys.advance_epoch(c);
                } else if n % help_freq == 0 {
                    sys.help_persist_local(c, tid);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn dedicated(&self) -> Option<&DedicatedAdvancer> {
        match self {
            Self::Dedicated(dedicated) => Some(dedicated),
            _ => None,
        }
    }
}

/// Body of the dedicated advancer thread.
///
/// The time spent on a boundary is taken off the next sleep, so epochs keep
/// their configured length as long as boundaries are shorter than that.
///
/// 专用推进线程的主体。推进所花的时间会从下一次睡眠中扣除。
pub(crate) fn run_dedicated<H: PersistentHeap>(sys: &SharedState<H>) {
    let Some(control) = sys.advancer.dedicated() else {
        return;
    };
    debug!(target: "nvm_epoch::advancer", event = "advancer_start", length_us = control.length.as_micros() as u64);
    let mut next_sleep = control.length;
    while control.sleep(next_sleep) {
        let started = Instant::now();
        sys.advance_epoch_dedicated();
        let spent = started.elapsed();
        next_sleep = match control.length.checked_sub(spent) {
            Some(rest) => rest,
            None => {
                warn!(
                    target: "nvm_epoch::advancer",
                    event = "slow_boundary",
                    spent_us = spent.as_micros() as u64,
                    length_us = control.length.as_micros() as u64,
                );
                Duration::ZERO
            }
        };
    }
    debug!(target: "nvm_epoch::advancer", event = "advancer_stop");
}
