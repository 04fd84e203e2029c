//! Integration tests for the batching adapter.

use std::collections::BTreeMap;

use gpu_parallel::builders::ParallelBuilder;
use gpu_parallel::config::ParallelConfig;
use gpu_parallel::core::{BatchArgs, BatchCall, BatchRunner, PoolError, WorkerSlot};
use serde_json::{json, Value};

fn doubled(call: BatchCall, _slot: &WorkerSlot) -> anyhow::Result<Value> {
    let values: Vec<i64> = call.decode_arg(0)?;
    Ok(json!(values.iter().map(|v| v * 2).collect::<Vec<_>>()))
}

fn runner(flat_result: bool, config: ParallelConfig) -> BatchRunner {
    BatchRunner::new(doubled, 9, flat_result, config, None).unwrap()
}

#[test]
fn test_batches_cover_the_dataset() {
    let mut runner = runner(
        false,
        ParallelConfig::new().with_n_devices(2).with_preserve_order(true),
    );
    let args = BatchArgs::new().arg((0..100).collect::<Vec<i64>>());

    let batches = runner.run(&args).unwrap();
    assert_eq!(batches.len(), 12);
    assert_eq!(batches[0], Some(json!([0, 2, 4, 6, 8, 10, 12, 14, 16])));
    assert_eq!(batches[11], Some(json!([198])));
}

#[test]
fn test_flat_result_matches_per_sample_calls() {
    // Completion order must not matter for flat results.
    let mut runner = runner(true, ParallelConfig::new().with_n_devices(2).with_workers_per_device(2));
    let args = BatchArgs::new().arg((0..100).collect::<Vec<i64>>());

    let samples = runner.run(&args).unwrap();
    let expected: Vec<_> = (0..100).map(|i| Some(json!(i * 2))).collect();
    assert_eq!(samples, expected);
}

#[test]
fn test_keyword_and_broadcast_arguments() {
    let mut runner = BatchRunner::new(
        |call: BatchCall, _slot: &WorkerSlot| {
            let xs: Vec<f64> = call.decode_arg(0)?;
            let offsets: Vec<f64> = call.decode_arg(1)?;
            let scale: f64 = call.decode_kwarg("scale")?;
            let mask: Vec<bool> = call.decode_kwarg("mask")?;
            anyhow::ensure!(offsets.len() == 3, "offsets were sliced");
            anyhow::ensure!(mask.len() == xs.len(), "mask was not sliced");
            let out: Vec<f64> = xs
                .iter()
                .zip(&mask)
                .map(|(x, keep)| if *keep { x * scale + offsets[0] } else { 0.0 })
                .collect();
            Ok(json!(out))
        },
        4,
        true,
        ParallelConfig::new().with_n_devices(2),
        None,
    )
    .unwrap();

    let args = BatchArgs::new()
        .arg((0..10).map(f64::from).collect::<Vec<_>>())
        .arg(json!([1.0, 0.0, 0.0]))
        .kwarg("scale", 0.5)
        .kwarg("mask", (0..10).map(|i| i % 2 == 0).collect::<Vec<_>>());

    let samples = runner.run(&args).unwrap();
    let expected: Vec<_> = (0..10)
        .map(|i| {
            let value = if i % 2 == 0 { f64::from(i) * 0.5 + 1.0 } else { 0.0 };
            Some(json!(value))
        })
        .collect();
    assert_eq!(samples, expected);
}

#[test]
fn test_run_samples_collates_records() {
    let mut runner = ParallelBuilder::new()
        .configure(|c| c.with_preserve_order(true))
        .build_batch(
            |call, _slot| {
                let words: Vec<String> = call.decode_kwarg("word")?;
                Ok(json!(words.iter().map(String::len).collect::<Vec<_>>()))
            },
            2,
            true,
        )
        .unwrap();

    let records = ["a", "bb", "ccc", "dddd", "eeeee"].into_iter().map(|w| {
        (Vec::new(), BTreeMap::from([("word".to_string(), json!(w))]))
    });
    let lengths = runner.run_samples(records).unwrap();
    assert_eq!(
        lengths,
        vec![Some(json!(1)), Some(json!(2)), Some(json!(3)), Some(json!(4)), Some(json!(5))]
    );
}

#[test]
fn test_flat_result_rejects_wrong_shape() {
    let mut runner = BatchRunner::new(
        |_call: BatchCall, _slot: &WorkerSlot| Ok(json!("not an array")),
        4,
        true,
        ParallelConfig::new(),
        None,
    )
    .unwrap();

    let err = runner.run(&BatchArgs::new().arg(json!([1, 2, 3]))).unwrap_err();
    assert!(matches!(err, PoolError::Batch(_)));
}

#[test]
fn test_ignored_batch_failure_blanks_its_samples() {
    let mut runner = BatchRunner::new(
        |call: BatchCall, slot: &WorkerSlot| {
            if call.range.start == 4 {
                anyhow::bail!("batch at {} failed on {}", call.range.start, slot.device_id);
            }
            doubled(call, slot)
        },
        4,
        true,
        ParallelConfig::new().with_ignore_errors(true),
        None,
    )
    .unwrap();

    let samples = runner.run(&BatchArgs::new().arg((0..10).collect::<Vec<i64>>())).unwrap();
    assert_eq!(samples.len(), 10);
    for (i, sample) in samples.iter().enumerate() {
        if (4..8).contains(&i) {
            assert_eq!(*sample, None);
        } else {
            assert_eq!(*sample, Some(json!(i * 2)));
        }
    }
}

#[test]
fn test_batching_in_debug_mode() {
    let mut runner = runner(true, ParallelConfig::new().with_debug(true));
    let samples = runner.run(&BatchArgs::new().arg(json!([5, 6]))).unwrap();
    assert_eq!(samples, vec![Some(json!(10)), Some(json!(12))]);
    assert!(runner.stats().is_none());
}

#[test]
fn test_empty_dataset_runs_no_batches() {
    for flat_result in [false, true] {
        let mut runner = runner(flat_result, ParallelConfig::new().with_workers_per_device(2));
        let out = runner.run(&BatchArgs::new().arg(json!([]))).unwrap();
        assert!(out.is_empty());

        let out = runner.run(&BatchArgs::new().arg(json!([1, 2]))).unwrap();
        assert!(!out.is_empty());
        assert_eq!(runner.stats().unwrap().submitted_tasks, 1);
    }
}

#[test]
fn test_zero_batch_size_is_rejected() {
    let err = BatchRunner::new(doubled, 0, false, ParallelConfig::new(), None)
        .err()
        .unwrap();
    assert!(matches!(err, PoolError::Config(_)));
}
