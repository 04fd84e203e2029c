//! Tests for error types

use gpu_parallel::core::{ConfigError, DeviceId, Outcome, PoolError, WorkerFailure};

#[test]
fn test_initializer_error_display() {
    let err = PoolError::Initializer {
        worker_id: 0,
        device_id: "cuda:0".into(),
        message: "out of memory".into(),
    };
    assert_eq!(
        err.to_string(),
        "initializer failed on worker-0 (cuda:0): out of memory"
    );
}

#[test]
fn test_spawn_error_from_io() {
    let err: PoolError = std::io::Error::other("no threads left").into();
    assert!(matches!(err, PoolError::Spawn(_)));
    assert!(err.to_string().contains("no threads left"));
}

#[test]
fn test_config_error_converts() {
    let err: PoolError = ConfigError::ZeroBatchSize.into();
    assert!(matches!(err, PoolError::Config(ConfigError::ZeroBatchSize)));
}

#[test]
fn test_uninitialized_is_never_ignored() {
    let outcome: Outcome<u8> = Outcome::WorkerUninitialized;
    let err = outcome.resolve(true).unwrap_err();
    assert!(matches!(err, PoolError::WorkerUninitialized));
}

#[test]
fn test_worker_failure_resolution() {
    let failure = WorkerFailure {
        message: "bad input".into(),
        worker_id: 2,
        device_id: DeviceId::cuda(1),
    };

    let ignored: Outcome<u8> = Outcome::WorkerFailure(failure.clone());
    assert_eq!(ignored.resolve(true).unwrap(), None);

    let raised: Outcome<u8> = Outcome::WorkerFailure(failure);
    match raised.resolve(false) {
        Err(PoolError::Worker(f)) => {
            assert_eq!(f.worker_id, 2);
            assert_eq!(f.message, "bad input");
        }
        other => panic!("expected worker error, got {other:?}"),
    }
}
