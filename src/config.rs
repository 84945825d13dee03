//! Engine configuration.
//!
//! Options can be set programmatically through [`EpochConfigBuilder`] or read
//! from environment-style `key=value` pairs with [`EpochConfig::from_env`] and
//! [`EpochConfig::from_pairs`]. Unknown values are rejected, never ignored.
//!
//! | Key | Values | Default |
//! |-----|--------|---------|
//! | `EpochLength` | positive integer | `50` |
//! | `EpochLengthUnit` | `Second`, `Millisecond`, `Microsecond` | `Millisecond` |
//! | `PersistStrat` | `DirWB`, `BufferedWB`, `PerEpoch`, `No` | `BufferedWB` |
//! | `BufferSize` | positive integer | `64` |
//! | `Container` | `CircBuffer`, `Vector`, `HashSet` | per strategy |
//! | `Persister` | `Worker`, `PerThreadDedicated` | `Worker` |
//! | `Free` | `PerEpoch`, `ThreadLocal`/`PerThread`, `No` | `PerEpoch` |
//! | `TransTracker` | `CurrEpoch`, `AtomicCounter`, `ActiveThread`, `NoFence`, `No` | `CurrEpoch` |
//! | `PersistTracker` | `Mindicator`, `IncreasingMindicator` | `Mindicator` |
//! | `EpochAdvance` | `Dedicated`, `SingleThread`, `GlobalCounter`, `No` | `Dedicated` |
//! | `EpochFreq` | positive integer | `1000` |
//! | `HelpFreq` | positive integer | `500` |
//! | `Mode` | `Blocking`, `Nonblocking` | `Blocking` |
//!
//! `PersistStrat=No` turns off the whole machinery: nothing is written back,
//! blocks are freed immediately, and neither trackers nor advancers run.
//!
//! 引擎配置。可以通过构建器设置，也可以从环境变量风格的键值对读取。未知取值会被拒绝。

use crate::error::ConfigError;
use std::time::Duration;

/// Default length of an epoch.
/// 纪元的默认长度。
pub const DEFAULT_EPOCH_LENGTH: Duration = Duration::from_millis(50);

/// Default capacity of a per-thread write-back ring.
pub const DEFAULT_BUFFER_SIZE: usize = 64;

pub const DEFAULT_EPOCH_FREQ: u64 = 1000;
pub const DEFAULT_HELP_FREQ: u64 = 500;

/// Descriptor words reserve 16 bits for the owning thread.
pub(crate) const MAX_NONBLOCKING_TASKS: usize = 1 << 16;

const KEYS: [&str; 13] = [
    "EpochLength",
    "EpochLengthUnit",
    "PersistStrat",
    "BufferSize",
    "Container",
    "Persister",
    "Free",
    "TransTracker",
    "PersistTracker",
    "EpochAdvance",
    "EpochFreq",
    "HelpFreq",
    "Mode",
];

/// When registered writes are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBackStrategy {
    DirWB,
    BufferedWB,
    PerEpoch,
    No,
}

/// Backing container of the per-thread write-back buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    CircBuffer,
    Vector,
    HashSet,
}

/// Who drains a full or finished write-back bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterKind {
    /// The worker itself, or the epoch advancer at a boundary.
    Worker,
    /// One background thread per worker.
    PerThreadDedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeStrategy {
    PerEpoch,
    ThreadLocal,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransTrackerKind {
    CurrEpoch,
    AtomicCounter,
    ActiveThread,
    NoFence,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistTrackerKind {
    Mindicator,
    IncreasingMindicator,
}

/// What drives the global epoch forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancerKind {
    /// A background thread advancing every epoch length.
    Dedicated,
    /// Thread 0 advances every `epoch_freq` of its own transactions.
    SingleThread { epoch_freq: u64 },
    /// Any thread advances every `epoch_freq` transactions counted globally,
    /// and helps write back every `help_freq`.
    GlobalCounter { epoch_freq: u64, help_freq: u64 },
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Writers publish with plain stores; persistence is by epoch only.
    Blocking,
    /// Writers publish through descriptor-guarded CAS; recovery checks
    /// per-thread commit sequence numbers.
    Nonblocking,
}

/// Validated engine configuration.
///
/// 经过校验的引擎配置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochConfig {
    pub(crate) task_num: usize,
    pub(crate) epoch_length: Duration,
    pub(crate) write_back: WriteBackStrategy,
    pub(crate) buffer_size: usize,
    pub(crate) container: ContainerKind,
    pub(crate) persister: PersisterKind,
    pub(crate) free: FreeStrategy,
    pub(crate) trans_tracker: TransTrackerKind,
    pub(crate) persist_tracker: PersistTrackerKind,
    pub(crate) advancer: AdvancerKind,
    pub(crate) mode: EngineMode,
    pub(crate) recovery_threads: usize,
}

impl EpochConfig {
    #[inline]
    pub fn builder() -> EpochConfigBuilder {
        EpochConfigBuilder::new()
    }

    /// Read every known key from the process environment.
    pub fn from_env(task_num: usize) -> Result<Self, ConfigError> {
        Self::from_pairs(
            task_num,
            KEYS.iter()
                .filter_map(|key| std::env::var(key).ok().map(|value| (*key, value))),
        )
    }

    /// Build from `(key, value)` pairs. Keys this engine does not know are
    /// skipped, values it does not know are errors.
    pub fn from_pairs<K, V>(
        task_num: usize,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = EpochConfigBuilder::new().task_num(task_num);
        let mut length = None;
        let mut unit = None;
        let mut advance = None;
        let mut epoch_freq = DEFAULT_EPOCH_FREQ;
        let mut help_freq = DEFAULT_HELP_FREQ;

        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                "EpochLength" => length = Some(parse_number("EpochLength", value)?),
                "EpochLengthUnit" => {
                    unit = Some(match value {
                        "Second" => Duration::from_secs as fn(u64) -> Duration,
                        "Millisecond" => Duration::from_millis,
                        "Microsecond" => Duration::from_micros,
                        _ => return Err(unknown("EpochLengthUnit", value)),
                    })
                }
                "PersistStrat" => {
                    builder = builder.write_back(match value {
                        "DirWB" => WriteBackStrategy::DirWB,
                        "BufferedWB" => WriteBackStrategy::BufferedWB,
                        "PerEpoch" => WriteBackStrategy::PerEpoch,
                        "No" => WriteBackStrategy::No,
                        _ => return Err(unknown("PersistStrat", value)),
                    })
                }
                "BufferSize" => {
                    builder = builder.buffer_size(parse_number("BufferSize", value)? as usize)
                }
                "Container" => {
                    builder = builder.container(match value {
                        "CircBuffer" => ContainerKind::CircBuffer,
                        "Vector" => ContainerKind::Vector,
                        "HashSet" => ContainerKind::HashSet,
                        _ => return Err(unknown("Container", value)),
                    })
                }
                "Persister" => {
                    builder = builder.persister(match value {
                        "Worker" => PersisterKind::Worker,
                        "PerThreadDedicated" => PersisterKind::PerThreadDedicated,
                        _ => return Err(unknown("Persister", value)),
                    })
                }
                "Free" => {
                    builder = builder.free(match value {
                        "PerEpoch" => FreeStrategy::PerEpoch,
                        "ThreadLocal" | "PerThread" => FreeStrategy::ThreadLocal,
                        "No" => FreeStrategy::No,
                        _ => return Err(unknown("Free", value)),
                    })
                }
                "TransTracker" => {
                    builder = builder.trans_tracker(match value {
                        "CurrEpoch" => TransTrackerKind::CurrEpoch,
                        "AtomicCounter" => TransTrackerKind::AtomicCounter,
                        "ActiveThread" => TransTrackerKind::ActiveThread,
                        "NoFence" => TransTrackerKind::NoFence,
                        "No" => TransTrackerKind::No,
                        _ => return Err(unknown("TransTracker", value)),
                    })
                }
                "PersistTracker" => {
                    builder = builder.persist_tracker(match value {
                        "Mindicator" => PersistTrackerKind::Mindicator,
                        "IncreasingMindicator" => PersistTrackerKind::IncreasingMindicator,
                        _ => return Err(unknown("PersistTracker", value)),
                    })
                }
                "EpochAdvance" => {
                    advance = Some(match value {
                        "Dedicated" | "SingleThread" | "GlobalCounter" | "No" => value.to_owned(),
                        _ => return Err(unknown("EpochAdvance", value)),
                    })
                }
                "EpochFreq" => epoch_freq = parse_number("EpochFreq", value)?,
                "HelpFreq" => help_freq = parse_number("HelpFreq", value)?,
                "Mode" => {
                    builder = builder.mode(match value {
                        "Blocking" => EngineMode::Blocking,
                        "Nonblocking" => EngineMode::Nonblocking,
                        _ => return Err(unknown("Mode", value)),
                    })
                }
                _ => {}
            }
        }

        if length.is_some() || unit.is_some() {
            let to_duration = unit.unwrap_or(Duration::from_millis);
            builder = builder.epoch_length(to_duration(length.unwrap_or(50)));
        }
        if let Some(advance) = advance {
            builder = builder.advancer(match advance.as_str() {
                "SingleThread" => AdvancerKind::SingleThread { epoch_freq },
                "GlobalCounter" => AdvancerKind::GlobalCounter {
                    epoch_freq,
                    help_freq,
                },
                "No" => AdvancerKind::No,
                _ => AdvancerKind::Dedicated,
            });
        }
        builder.build()
    }

    #[inline]
    pub fn task_num(&self) -> usize {
        self.task_num
    }

    #[inline]
    pub fn epoch_length(&self) -> Duration {
        self.epoch_length
    }

    #[inline]
    pub fn write_back(&self) -> WriteBackStrategy {
        self.write_back
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn container(&self) -> ContainerKind {
        self.container
    }

    #[inline]
    pub fn persister(&self) -> PersisterKind {
        self.persister
    }

    #[inline]
    pub fn free(&self) -> FreeStrategy {
        self.free
    }

    #[inline]
    pub fn trans_tracker(&self) -> TransTrackerKind {
        self.trans_tracker
    }

    #[inline]
    pub fn persist_tracker(&self) -> PersistTrackerKind {
        self.persist_tracker
    }

    #[inline]
    pub fn advancer(&self) -> AdvancerKind {
        self.advancer
    }

    #[inline]
    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    #[inline]
    pub fn recovery_threads(&self) -> usize {
        self.recovery_threads
    }
}

impl Default for EpochConfig {
    fn default() -> Self {
        EpochConfigBuilder::new().resolve()
    }
}

fn unknown(key: &'static str, value: &str) -> ConfigError {
    ConfigError::UnknownValue {
        key,
        value: value.to_owned(),
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: value.to_owned(),
        }),
    }
}

/// Builder for [`EpochConfig`].
///
/// # Example
/// ```
/// use nvm_epoch::{EpochConfig, FreeStrategy, WriteBackStrategy};
/// use std::time::Duration;
///
/// let config = EpochConfig::builder()
///     .task_num(4)
///     .epoch_length(Duration::from_millis(10))
///     .write_back(WriteBackStrategy::DirWB)
///     .free(FreeStrategy::ThreadLocal)
///     .build()
///     .unwrap();
/// assert_eq!(config.task_num(), 4);
/// ```
///
/// `EpochConfig` 的构建器。
#[derive(Debug, Clone)]
pub struct EpochConfigBuilder {
    task_num: usize,
    epoch_length: Duration,
    write_back: WriteBackStrategy,
    buffer_size: usize,
    container: Option<ContainerKind>,
    persister: PersisterKind,
    free: FreeStrategy,
    trans_tracker: TransTrackerKind,
    persist_tracker: PersistTrackerKind,
    advancer: AdvancerKind,
    mode: EngineMode,
    recovery_threads: usize,
}

impl EpochConfigBuilder {
    pub fn new() -> Self {
        Self {
            task_num: 1,
            epoch_length: DEFAULT_EPOCH_LENGTH,
            write_back: WriteBackStrategy::BufferedWB,
            buffer_size: DEFAULT_BUFFER_SIZE,
            container: None,
            persister: PersisterKind::Worker,
            free: FreeStrategy::PerEpoch,
            trans_tracker: TransTrackerKind::CurrEpoch,
            persist_tracker: PersistTrackerKind::Mindicator,
            advancer: AdvancerKind::Dedicated,
            mode: EngineMode::Blocking,
            recovery_threads: 1,
        }
    }

    /// Number of worker threads, i.e. the range of valid `tid`s.
    #[inline]
    pub fn task_num(mut self, task_num: usize) -> Self {
        self.task_num = task_num;
        self
    }

    #[inline]
    pub fn epoch_length(mut self, length: Duration) -> Self {
        self.epoch_length = length;
        self
    }

    #[inline]
    pub fn write_back(mut self, strategy: WriteBackStrategy) -> Self {
        self.write_back = strategy;
        self
    }

    #[inline]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Backing container of the write-back buckets. `None` picks the
    /// strategy's default: a ring for `BufferedWB`, a vector for `PerEpoch`.
    #[inline]
    pub fn container(mut self, container: impl Into<Option<ContainerKind>>) -> Self {
        self.container = container.into();
        self
    }

    #[inline]
    pub fn persister(mut self, persister: PersisterKind) -> Self {
        self.persister = persister;
        self
    }

    #[inline]
    pub fn free(mut self, free: FreeStrategy) -> Self {
        self.free = free;
        self
    }

    #[inline]
    pub fn trans_tracker(mut self, tracker: TransTrackerKind) -> Self {
        self.trans_tracker = tracker;
        self
    }

    #[inline]
    pub fn persist_tracker(mut self, tracker: PersistTrackerKind) -> Self {
        self.persist_tracker = tracker;
        self
    }

    #[inline]
    pub fn advancer(mut self, advancer: AdvancerKind) -> Self {
        self.advancer = advancer;
        self
    }

    #[inline]
    pub fn mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    #[inline]
    pub fn recovery_threads(mut self, threads: usize) -> Self {
        self.recovery_threads = threads;
        self
    }

    fn resolve(self) -> EpochConfig {
        let container = self.container.unwrap_or(match self.write_back {
            WriteBackStrategy::PerEpoch => ContainerKind::Vector,
            _ => ContainerKind::CircBuffer,
        });
        let mut config = EpochConfig {
            task_num: self.task_num,
            epoch_length: self.epoch_length,
            write_back: self.write_back,
            buffer_size: self.buffer_size,
            container,
            persister: self.persister,
            free: self.free,
            trans_tracker: self.trans_tracker,
            persist_tracker: self.persist_tracker,
            advancer: self.advancer,
            mode: self.mode,
            recovery_threads: self.recovery_threads.max(1),
        };
        if config.write_back == WriteBackStrategy::No {
            config.free = FreeStrategy::No;
            config.trans_tracker = TransTrackerKind::No;
            config.advancer = AdvancerKind::No;
        }
        config
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<EpochConfig, ConfigError> {
        if self.task_num == 0 {
            return Err(ConfigError::Incompatible("at least one worker thread is required"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "BufferSize",
                value: "0".to_owned(),
            });
        }
        if self.epoch_length.is_zero() {
            return Err(ConfigError::InvalidNumber {
                key: "EpochLength",
                value: "0".to_owned(),
            });
        }
        match self.advancer {
            AdvancerKind::SingleThread { epoch_freq: 0 }
            | AdvancerKind::GlobalCounter { epoch_freq: 0, .. } => {
                return Err(ConfigError::InvalidNumber {
                    key: "EpochFreq",
                    value: "0".to_owned(),
                });
            }
            AdvancerKind::GlobalCounter { help_freq: 0, .. } => {
                return Err(ConfigError::InvalidNumber {
                    key: "HelpFreq",
                    value: "0".to_owned(),
                });
            }
            _ => {}
        }
        let config = self.resolve();
        if config.write_back == WriteBackStrategy::BufferedWB
            && config.container == ContainerKind::Vector
        {
            return Err(ConfigError::Incompatible(
                "buffered write-back needs a bounded container",
            ));
        }
        if config.mode == EngineMode::Nonblocking {
            if !matches!(config.advancer, AdvancerKind::Dedicated | AdvancerKind::No) {
                return Err(ConfigError::Incompatible(
                    "the nonblocking engine only runs with a dedicated epoch advancer",
                ));
            }
            if config.free == FreeStrategy::PerEpoch {
                return Err(ConfigError::Incompatible(
                    "the nonblocking engine cannot use a per-epoch free container",
                ));
            }
            if config.task_num > MAX_NONBLOCKING_TASKS {
                return Err(ConfigError::Incompatible(
                    "the nonblocking engine supports at most 65536 worker threads",
                ));
            }
        }
        Ok(config)
    }
}

impl Default for EpochConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
