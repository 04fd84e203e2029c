//! Tests for configuration parsing and validation

use std::time::Duration;

use gpu_parallel::config::{EngineKind, ParallelConfig};
use gpu_parallel::core::{ConfigError, DeviceId};

#[test]
fn test_config_from_json() {
    let cfg = ParallelConfig::from_json_str(
        r#"{
            "device_ids": ["cuda:2", "cuda:5"],
            "workers_per_device": 3,
            "preserve_order": true,
            "engine": "flume",
            "join_timeout_ms": 250
        }"#,
    )
    .unwrap();

    assert_eq!(
        cfg.devices().unwrap(),
        vec![DeviceId::new("cuda:2"), DeviceId::new("cuda:5")]
    );
    assert_eq!(cfg.total_workers().unwrap(), 6);
    assert!(cfg.preserve_order);
    assert!(!cfg.ignore_errors);
    assert_eq!(cfg.engine, EngineKind::Flume);
    assert_eq!(cfg.join_timeout(), Duration::from_millis(250));
}

#[test]
fn test_config_from_json_uses_defaults() {
    let cfg = ParallelConfig::from_json_str("{}").unwrap();
    assert_eq!(cfg, ParallelConfig::default());
}

#[test]
fn test_config_from_json_rejects_conflicting_devices() {
    let err = ParallelConfig::from_json_str(r#"{"device_ids": ["cuda:0"], "n_devices": 1}"#)
        .unwrap_err();
    assert_eq!(err, ConfigError::ConflictingDevices);
}

#[test]
fn test_config_from_json_rejects_malformed_input() {
    let err = ParallelConfig::from_json_str("{ workers_per_device: }").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = ParallelConfig::from_json_str(r#"{"engine": 3}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_config_from_json_rejects_unknown_engine() {
    let err = ParallelConfig::from_json_str(r#"{"engine": "billiard"}"#).unwrap_err();
    assert_eq!(err, ConfigError::UnknownEngine("billiard".into()));
}

#[test]
fn test_config_validation_errors() {
    assert_eq!(
        ParallelConfig::new().with_device_ids(Vec::<String>::new()).validate(),
        Err(ConfigError::EmptyDeviceIds)
    );
    assert_eq!(
        ParallelConfig::new().with_n_devices(0).validate(),
        Err(ConfigError::ZeroDevices)
    );
    assert_eq!(
        ParallelConfig::new().with_workers_per_device(0).validate(),
        Err(ConfigError::ZeroWorkersPerDevice)
    );
}

#[test]
fn test_config_from_lookup_flags() {
    let cfg = ParallelConfig::from_lookup(|key| match key {
        "GPU_PARALLEL_N_DEVICES" => Some("2".into()),
        "GPU_PARALLEL_IGNORE_ERRORS" => Some("yes".into()),
        "GPU_PARALLEL_DEBUG" => Some("0".into()),
        "GPU_PARALLEL_JOIN_TIMEOUT_MS" => Some("50".into()),
        _ => None,
    })
    .unwrap();

    assert_eq!(cfg.n_devices, Some(2));
    assert!(cfg.ignore_errors);
    assert!(!cfg.debug);
    assert_eq!(cfg.join_timeout(), Duration::from_millis(50));
}

#[test]
fn test_config_from_lookup_rejects_bad_flag() {
    let err = ParallelConfig::from_lookup(|key| {
        (key == "GPU_PARALLEL_PRESERVE_ORDER").then(|| "maybe".to_string())
    })
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "GPU_PARALLEL_PRESERVE_ORDER"));
}

#[test]
fn test_engine_serde_names() {
    assert_eq!(serde_json::to_string(&EngineKind::Crossbeam).unwrap(), r#""crossbeam""#);
    assert_eq!(EngineKind::Flume.to_string(), "flume");
}
