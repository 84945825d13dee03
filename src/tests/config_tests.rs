/// 配置测试模块
/// 测试默认值、键值对解析与不兼容组合的拒绝
use crate::{
    AdvancerKind, ConfigError, ContainerKind, DEFAULT_EPOCH_FREQ, DEFAULT_EPOCH_LENGTH,
    EngineMode, EpochConfig, FreeStrategy, PersistTrackerKind, PersisterKind, TransTrackerKind,
    WriteBackStrategy,
};
use std::time::Duration;

/// 测试1: 默认配置
#[test]
fn test_defaults() {
    let config = EpochConfig::builder().build().unwrap();
    assert_eq!(config.task_num(), 1);
    assert_eq!(config.epoch_length(), DEFAULT_EPOCH_LENGTH);
    assert_eq!(config.write_back(), WriteBackStrategy::BufferedWB);
    assert_eq!(config.container(), ContainerKind::CircBuffer);
    assert_eq!(config.persister(), PersisterKind::Worker);
    assert_eq!(config.free(), FreeStrategy::PerEpoch);
    assert_eq!(config.trans_tracker(), TransTrackerKind::CurrEpoch);
    assert_eq!(config.persist_tracker(), PersistTrackerKind::Mindicator);
    assert_eq!(config.advancer(), AdvancerKind::Dedicated);
    assert_eq!(config.mode(), EngineMode::Blocking);
    assert_eq!(config.recovery_threads(), 1);
    assert_eq!(EpochConfig::default(), config);
}

/// 测试2: 按纪元写回默认使用向量容器
#[test]
fn test_per_epoch_default_container() {
    let config = EpochConfig::builder()
        .write_back(WriteBackStrategy::PerEpoch)
        .build()
        .unwrap();
    assert_eq!(config.container(), ContainerKind::Vector);

    let config = EpochConfig::builder()
        .write_back(WriteBackStrategy::PerEpoch)
        .container(ContainerKind::HashSet)
        .build()
        .unwrap();
    assert_eq!(config.container(), ContainerKind::HashSet);
}

/// 测试3: 不写回时关闭回收、跟踪与推进
#[test]
fn test_write_back_no_disables_machinery() {
    let config = EpochConfig::builder()
        .write_back(WriteBackStrategy::No)
        .free(FreeStrategy::ThreadLocal)
        .build()
        .unwrap();
    assert_eq!(config.free(), FreeStrategy::No);
    assert_eq!(config.trans_tracker(), TransTrackerKind::No);
    assert_eq!(config.advancer(), AdvancerKind::No);
}

/// 测试4: 从键值对解析
#[test]
fn test_from_pairs() {
    let config = EpochConfig::from_pairs(
        4,
        [
            ("EpochLength", "2"),
            ("EpochLengthUnit", "Second"),
            ("PersistStrat", "PerEpoch"),
            ("Container", "HashSet"),
            ("Free", "PerThread"),
            ("TransTracker", "AtomicCounter"),
            ("PersistTracker", "IncreasingMindicator"),
            ("EpochAdvance", "GlobalCounter"),
            ("EpochFreq", "10"),
            ("HelpFreq", "3"),
            ("SomethingElse", "ignored"),
        ],
    )
    .unwrap();
    assert_eq!(config.task_num(), 4);
    assert_eq!(config.epoch_length(), Duration::from_secs(2));
    assert_eq!(config.write_back(), WriteBackStrategy::PerEpoch);
    assert_eq!(config.container(), ContainerKind::HashSet);
    assert_eq!(config.free(), FreeStrategy::ThreadLocal);
    assert_eq!(config.trans_tracker(), TransTrackerKind::AtomicCounter);
    assert_eq!(config.persist_tracker(), PersistTrackerKind::IncreasingMindicator);
    assert_eq!(
        config.advancer(),
        AdvancerKind::GlobalCounter {
            epoch_freq: 10,
            help_freq: 3
        }
    );
}

/// 测试5: 推进频率在推进策略之前或之后给出都生效
#[test]
fn test_from_pairs_freq_order() {
    let config = EpochConfig::from_pairs(
        2,
        [("EpochFreq", "7"), ("EpochAdvance", "SingleThread")],
    )
    .unwrap();
    assert_eq!(config.advancer(), AdvancerKind::SingleThread { epoch_freq: 7 });

    let config = EpochConfig::from_pairs(2, [("EpochAdvance", "SingleThread")]).unwrap();
    assert_eq!(
        config.advancer(),
        AdvancerKind::SingleThread {
            epoch_freq: DEFAULT_EPOCH_FREQ
        }
    );
}

/// 测试6: 未知取值与非法数字被拒绝
#[test]
fn test_rejects_unknown_values() {
    assert_eq!(
        EpochConfig::from_pairs(1, [("PersistStrat", "Sometimes")]),
        Err(ConfigError::UnknownValue {
            key: "PersistStrat",
            value: "Sometimes".to_owned()
        })
    );
    assert_eq!(
        EpochConfig::from_pairs(1, [("BufferSize", "zero")]),
        Err(ConfigError::InvalidNumber {
            key: "BufferSize",
            value: "zero".to_owned()
        })
    );
    assert!(matches!(
        EpochConfig::from_pairs(1, [("EpochLength", "0")]),
        Err(ConfigError::InvalidNumber { key: "EpochLength", .. })
    ));
    assert!(matches!(
        EpochConfig::from_pairs(1, [("Mode", "Lockfree")]),
        Err(ConfigError::UnknownValue { key: "Mode", .. })
    ));
}

/// 测试7: 不兼容的组合
#[test]
fn test_incompatible_combinations() {
    assert!(matches!(
        EpochConfig::builder().task_num(0).build(),
        Err(ConfigError::Incompatible(_))
    ));
    assert!(matches!(
        EpochConfig::builder()
            .mode(EngineMode::Nonblocking)
            .free(FreeStrategy::ThreadLocal)
            .advancer(AdvancerKind::GlobalCounter {
                epoch_freq: 10,
                help_freq: 5
            })
            .build(),
        Err(ConfigError::Incompatible(_))
    ));
    assert!(matches!(
        EpochConfig::builder().mode(EngineMode::Nonblocking).build(),
        Err(ConfigError::Incompatible(_))
    ));
    assert!(matches!(
        EpochConfig::builder()
            .container(ContainerKind::Vector)
            .build(),
        Err(ConfigError::Incompatible(_))
    ));
    assert!(matches!(
        EpochConfig::builder()
            .advancer(AdvancerKind::SingleThread { epoch_freq: 0 })
            .build(),
        Err(ConfigError::InvalidNumber { key: "EpochFreq", .. })
    ));

    let config = EpochConfig::builder()
        .mode(EngineMode::Nonblocking)
        .free(FreeStrategy::ThreadLocal)
        .build()
        .unwrap();
    assert_eq!(config.mode(), EngineMode::Nonblocking);
}

/// 测试8: 从环境变量读取配置，未设置的键保持默认值
#[test]
fn test_from_env() {
    let vars = [
        ("EpochLength", "5"),
        ("EpochLengthUnit", "Millisecond"),
        ("Free", "ThreadLocal"),
        ("TransTracker", "AtomicCounter"),
    ];
    // SAFETY: no other test reads or writes these variables.
    unsafe {
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
    }
    let config = EpochConfig::from_env(4);
    // SAFETY: as above.
    unsafe { std::env::set_var("TransTracker", "Sometimes") };
    let rejected = EpochConfig::from_env(4);
    // SAFETY: as above.
    unsafe {
        for (key, _) in vars {
            std::env::remove_var(key);
        }
    }

    let config = config.unwrap();
    assert_eq!(config.task_num(), 4);
    assert_eq!(config.epoch_length(), Duration::from_millis(5));
    assert_eq!(config.free(), FreeStrategy::ThreadLocal);
    assert_eq!(config.trans_tracker(), TransTrackerKind::AtomicCounter);
    assert_eq!(config.write_back(), WriteBackStrategy::BufferedWB);
    assert_eq!(
        rejected,
        Err(ConfigError::UnknownValue {
            key: "TransTracker",
            value: "Sometimes".to_owned()
        })
    );
}
