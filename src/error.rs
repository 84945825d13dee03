//! Error types for the persistence engine.
//!
//! | Kind | Type | Recovery |
//! |------|------|----------|
//! | Reader saw a newer write | [`EpochError::OldSeeNew`] | abort and retry the whole operation |
//! | Linearization check lost the epoch | [`EpochError::EpochVerify`] | abort and retry the whole operation |
//! | Bad option or option combination | [`ConfigError`] | fix the configuration |
//! | Unusable heap image | [`RecoveryError`] | none, the image is not an engine heap |
//!
//! Protocol violations by a client (double retire, double free, touching a
//! dangling block handle) are not represented here. They panic.
//!
//! 持久化引擎的错误类型。
//! 客户端违反协议（重复退休、重复释放、访问悬垂句柄）不在此表示，它们会 panic。

use thiserror::Error;

/// A retryable failure of a transactional access.
///
/// Both variants mean the operation raced with an epoch boundary. The caller
/// aborts the operation and starts it again from `begin`; see
/// [`Worker::run_op`](crate::Worker::run_op).
///
/// 事务访问的可重试失败。调用者应中止操作并从头重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EpochError {
    /// The block was written in an epoch newer than the reading transaction.
    #[error("old-see-new: block epoch {block_epoch} is newer than transaction epoch {txn_epoch}")]
    OldSeeNew { block_epoch: u64, txn_epoch: u64 },

    /// The global epoch moved away from the transaction epoch before a
    /// linearizing access could take effect.
    #[error("epoch verification failed: transaction epoch {expected}, global epoch {current}")]
    EpochVerify { expected: u64, current: u64 },
}

impl EpochError {
    /// Whether retrying the whole operation can succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OldSeeNew { .. } | Self::EpochVerify { .. })
    }
}

/// Invalid engine configuration.
///
/// 无效的引擎配置。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unrecognized value {value:?} for option {key}")]
    UnknownValue { key: &'static str, value: String },

    #[error("option {key} expects a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("incompatible configuration: {0}")]
    Incompatible(&'static str),
}

/// The heap handed to the engine on restart cannot be recovered.
///
/// 重启时交给引擎的堆无法恢复。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("restarted heap holds no epoch block")]
    MissingEpochBlock,

    #[error("restarted heap holds {count} epoch blocks")]
    DuplicateEpochBlock { count: usize },
}

/// Failure to construct an [`EpochSys`](crate::EpochSys).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("failed to spawn the {name} thread: {reason}")]
    Spawn { name: &'static str, reason: String },
}
