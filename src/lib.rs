//! # GPU Parallel
//!
//! Run batches of independent tasks on a fixed pool of worker threads, each
//! bound for its whole life to one accelerator device.
//!
//! Inference-style workloads load an expensive model once per device and then
//! serve many small calls against it. This crate keeps those workers alive
//! across rounds of tasks, hands every worker a stable `(worker_id, device_id)`
//! identity and collects results in submission order or as they complete.
//!
//! ## Key Features
//!
//! - **Device affinity**: `workers_per_device` workers per device, each claiming one slot
//! - **Per-worker initialization**: load models once, before any task runs
//! - **Ordered or completion-order results**: ordered mode buffers only what arrived early
//! - **Failure policy**: task errors and panics surface as errors or as `None` placeholders
//! - **Debug mode**: run everything inline on the calling thread
//! - **Batching**: split sample-aligned arguments into fixed-size batches
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use gpu_parallel::builders::ParallelBuilder;
//! use gpu_parallel::core::Task;
//!
//! let mut gp = ParallelBuilder::new()
//!     .configure(|c| c.with_n_devices(2).with_workers_per_device(2))
//!     .initializer(|slot| load_model(&slot.device_id))
//!     .build::<Vec<f32>>()?;
//!
//! for result in gp.run(prompts.into_iter().map(|p| Task::new(move |slot| embed(slot, &p)))) {
//!     let embedding = result?;
//! }
//! ```
//!
//! ## Batching
//!
//! ```rust,ignore
//! use gpu_parallel::core::BatchArgs;
//!
//! let mut runner = ParallelBuilder::new().build_batch(
//!     |call, _slot| Ok(serde_json::json!(call.len())),
//!     16,
//!     false,
//! )?;
//! let per_batch = runner.run(BatchArgs::new().arg(serde_json::json!(samples)))?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Workers, dispatch, result ordering and batching.
pub mod core;
/// Configuration models and environment loading.
pub mod config;
/// Builders that combine configuration with initializer closures.
pub mod builders;
/// Async adapters driving rounds from a tokio runtime.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
