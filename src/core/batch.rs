//! Batching adapter: one per-sample function, dispatched per batch.
//!
//! Arguments are JSON values. The dataset length comes from the first
//! positional argument (or the first keyword argument in key order when
//! there are no positional ones). Every array argument of exactly that
//! length is sliced per batch; everything else is broadcast unchanged to
//! every batch.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::ParallelConfig;
use crate::core::device::WorkerSlot;
use crate::core::error::{ConfigError, PoolError, TaskResult};
use crate::core::parallel::GpuParallel;
use crate::core::task::{Initializer, Task};
use crate::core::worker_pool::{PoolStats, TeardownReport};

/// User function invoked once per batch.
pub type BatchFn = dyn Fn(BatchCall, &WorkerSlot) -> TaskResult<Value> + Send + Sync + 'static;

/// Positional and keyword arguments for a whole dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchArgs {
    /// Positional arguments, in call order.
    pub positional: Vec<Value>,
    /// Keyword arguments.
    pub keyword: BTreeMap<String, Value>,
}

impl BatchArgs {
    /// No arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Collate per-sample `(positional, keyword)` records into dataset arguments.
    ///
    /// Every argument becomes an array with one entry per sample, so all of
    /// them are batched.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Batch` if there are no samples or samples disagree
    /// on their positional arity or keyword names.
    pub fn from_samples<I>(samples: I) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = (Vec<Value>, BTreeMap<String, Value>)>,
    {
        let mut samples = samples.into_iter();
        let Some((first_pos, first_kw)) = samples.next() else {
            return Err(PoolError::Batch("no samples to collate".into()));
        };

        let mut positional: Vec<Vec<Value>> = first_pos.into_iter().map(|v| vec![v]).collect();
        let mut keyword: BTreeMap<String, Vec<Value>> =
            first_kw.into_iter().map(|(k, v)| (k, vec![v])).collect();

        for (idx, (pos, mut kw)) in samples.enumerate() {
            if pos.len() != positional.len() || kw.len() != keyword.len() {
                return Err(PoolError::Batch(format!(
                    "sample {} has a different argument layout than sample 0",
                    idx + 1
                )));
            }
            for (column, value) in positional.iter_mut().zip(pos) {
                column.push(value);
            }
            for (name, column) in &mut keyword {
                let value = kw.remove(name).ok_or_else(|| {
                    PoolError::Batch(format!("sample {} is missing keyword `{name}`", idx + 1))
                })?;
                column.push(value);
            }
        }

        Ok(Self {
            positional: positional.into_iter().map(Value::Array).collect(),
            keyword: keyword
                .into_iter()
                .map(|(k, v)| (k, Value::Array(v)))
                .collect(),
        })
    }
}

/// How an argument is handed to each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Sliced to the batch's sample range.
    Batched,
    /// Passed unchanged to every batch.
    Broadcast,
}

/// How a dataset is split into batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Dataset length.
    pub n_samples: usize,
    /// Contiguous sample ranges, one per batch.
    pub ranges: Vec<Range<usize>>,
    /// Classification of each positional argument.
    pub positional: Vec<ArgKind>,
    /// Classification of each keyword argument.
    pub keyword: BTreeMap<String, ArgKind>,
}

impl BatchPlan {
    /// Classify `args` and split `0..n_samples` into `batch_size` slices.
    ///
    /// # Errors
    ///
    /// - `PoolError::Config` if `batch_size` is zero
    /// - `PoolError::Batch` if there is no argument or the first one is not an array
    pub fn new(args: &BatchArgs, batch_size: usize) -> Result<Self, PoolError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize.into());
        }

        let first = args
            .positional
            .first()
            .or_else(|| args.keyword.values().next())
            .ok_or_else(|| {
                PoolError::Batch("at least one argument is needed to size the dataset".into())
            })?;
        let n_samples = first.as_array().map(Vec::len).ok_or_else(|| {
            PoolError::Batch("the first argument must be an array of samples".into())
        })?;

        let classify = |value: &Value| {
            if value.as_array().is_some_and(|a| a.len() == n_samples) {
                ArgKind::Batched
            } else {
                ArgKind::Broadcast
            }
        };

        let ranges = (0..n_samples)
            .step_by(batch_size)
            .map(|start| start..(start + batch_size).min(n_samples))
            .collect();

        Ok(Self {
            n_samples,
            ranges,
            positional: args.positional.iter().map(classify).collect(),
            keyword: args
                .keyword
                .iter()
                .map(|(k, v)| (k.clone(), classify(v)))
                .collect(),
        })
    }

    /// Number of batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Arguments of the batch covering `range`.
    #[must_use]
    pub fn call(&self, args: &BatchArgs, range: Range<usize>) -> BatchCall {
        BatchCall {
            positional: args
                .positional
                .iter()
                .zip(&self.positional)
                .map(|(value, kind)| slice(value, *kind, &range))
                .collect(),
            keyword: args
                .keyword
                .iter()
                .map(|(name, value)| {
                    let kind = self.keyword.get(name).copied().unwrap_or(ArgKind::Broadcast);
                    (name.clone(), slice(value, kind, &range))
                })
                .collect(),
            range,
        }
    }
}

fn slice(value: &Value, kind: ArgKind, range: &Range<usize>) -> Value {
    match (kind, value) {
        (ArgKind::Batched, Value::Array(items)) => {
            Value::Array(items.get(range.clone()).map(<[Value]>::to_vec).unwrap_or_default())
        }
        _ => value.clone(),
    }
}

/// Arguments of one batch as seen by the batch function.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCall {
    /// Dataset samples covered by this batch.
    pub range: Range<usize>,
    /// Positional arguments: batched ones sliced, broadcast ones whole.
    pub positional: Vec<Value>,
    /// Keyword arguments: batched ones sliced, broadcast ones whole.
    pub keyword: BTreeMap<String, Value>,
}

impl BatchCall {
    /// Number of samples in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the batch holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Positional argument `idx`.
    #[must_use]
    pub fn arg(&self, idx: usize) -> Option<&Value> {
        self.positional.get(idx)
    }

    /// Keyword argument `name`.
    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// Deserialize positional argument `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the argument is missing or has the wrong shape.
    pub fn decode_arg<D: DeserializeOwned>(&self, idx: usize) -> TaskResult<D> {
        let value = self
            .arg(idx)
            .ok_or_else(|| anyhow::anyhow!("missing positional argument {idx}"))?;
        Ok(D::deserialize(value)?)
    }

    /// Deserialize keyword argument `name`.
    ///
    /// # Errors
    ///
    /// Fails if the argument is missing or has the wrong shape.
    pub fn decode_kwarg<D: DeserializeOwned>(&self, name: &str) -> TaskResult<D> {
        let value = self
            .kwarg(name)
            .ok_or_else(|| anyhow::anyhow!("missing keyword argument `{name}`"))?;
        Ok(D::deserialize(value)?)
    }
}

/// Batch result tagged with the samples it covers.
struct BatchOutput {
    range: Range<usize>,
    value: Value,
}

/// Runs a per-sample function over a dataset in batches on a worker pool.
pub struct BatchRunner {
    parallel: GpuParallel<BatchOutput>,
    task_fn: Arc<BatchFn>,
    batch_size: usize,
    flat_result: bool,
}

impl BatchRunner {
    /// Start a pool for `task_fn`.
    ///
    /// With `flat_result`, `task_fn` must return an array with one entry per
    /// sample of its batch, and results are emitted per sample.
    ///
    /// # Errors
    ///
    /// - `PoolError::Config` if `batch_size` is zero or `config` is invalid
    /// - anything [`GpuParallel::new`] returns
    pub fn new<F>(
        task_fn: F,
        batch_size: usize,
        flat_result: bool,
        config: ParallelConfig,
        initializer: Option<Initializer>,
    ) -> Result<Self, PoolError>
    where
        F: Fn(BatchCall, &WorkerSlot) -> TaskResult<Value> + Send + Sync + 'static,
    {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize.into());
        }
        Ok(Self {
            parallel: GpuParallel::new(config, initializer)?,
            task_fn: Arc::new(task_fn),
            batch_size,
            flat_result,
        })
    }

    /// Samples per batch.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether results are emitted per sample.
    #[must_use]
    pub const fn flat_result(&self) -> bool {
        self.flat_result
    }

    /// Pool statistics; `None` in debug mode.
    #[must_use]
    pub fn stats(&self) -> Option<PoolStats> {
        self.parallel.stats()
    }

    /// Split `args` into batches without running anything.
    ///
    /// # Errors
    ///
    /// See [`BatchPlan::new`].
    pub fn plan(&self, args: &BatchArgs) -> Result<BatchPlan, PoolError> {
        BatchPlan::new(args, self.batch_size)
    }

    /// Run the dataset described by `args`.
    ///
    /// Without `flat_result` the output holds one entry per batch, in the
    /// order the pool yields them. With `flat_result` it holds one entry per
    /// sample in dataset order; samples of a batch whose failure was ignored
    /// are `None`.
    ///
    /// # Errors
    ///
    /// - errors of [`BatchPlan::new`]
    /// - the first error of the result sequence
    /// - `PoolError::Batch` if a flat batch result is not an array of the batch length
    pub fn run(&mut self, args: &BatchArgs) -> Result<Vec<Option<Value>>, PoolError> {
        let plan = self.plan(args)?;
        debug!(
            n_samples = plan.n_samples,
            batches = plan.len(),
            batch_size = self.batch_size,
            "Planned batches"
        );

        let task_fn = Arc::clone(&self.task_fn);
        let tasks = plan.ranges.iter().map(|range| {
            let call = plan.call(args, range.clone());
            let task_fn = Arc::clone(&task_fn);
            Task::new(move |slot| {
                let range = call.range.clone();
                let value = task_fn(call, slot)?;
                Ok(BatchOutput { range, value })
            })
        });
        let results = self.parallel.run(tasks);

        if !self.flat_result {
            return results
                .map(|item| item.map(|out| out.map(|batch| batch.value)))
                .collect();
        }

        let mut samples = vec![None; plan.n_samples];
        for item in results {
            let Some(batch) = item? else {
                continue;
            };
            let expected = batch.range.len();
            let items = match batch.value {
                Value::Array(items) if items.len() == expected => items,
                other => {
                    return Err(PoolError::Batch(format!(
                        "flat_result expects an array of {expected} items for samples {:?}, got {}",
                        batch.range,
                        describe(&other)
                    )));
                }
            };
            for (idx, value) in batch.range.zip(items) {
                samples[idx] = Some(value);
            }
        }
        Ok(samples)
    }

    /// Collate per-sample records and run them.
    ///
    /// # Errors
    ///
    /// See [`BatchArgs::from_samples`] and [`BatchRunner::run`].
    pub fn run_samples<I>(&mut self, samples: I) -> Result<Vec<Option<Value>>, PoolError>
    where
        I: IntoIterator<Item = (Vec<Value>, BTreeMap<String, Value>)>,
    {
        let args = BatchArgs::from_samples(samples)?;
        self.run(&args)
    }

    /// Tear the workers down. Safe to call more than once.
    pub fn shutdown(&self) -> TeardownReport {
        self.parallel.shutdown()
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Array(items) => format!("an array of {} items", items.len()),
        Value::Null => "null".into(),
        Value::Bool(_) => "a boolean".into(),
        Value::Number(_) => "a number".into(),
        Value::String(_) => "a string".into(),
        Value::Object(_) => "an object".into(),
    }
}
