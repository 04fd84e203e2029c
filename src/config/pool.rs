//! Pool configuration structures.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::device::DeviceId;
use crate::core::error::ConfigError;

/// Prefix of the environment variables read by [`ParallelConfig::from_env`].
pub const ENV_PREFIX: &str = "GPU_PARALLEL_";

/// Queue primitive feeding the worker threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum EngineKind {
    /// `crossbeam-channel` unbounded queue.
    #[default]
    Crossbeam,
    /// `flume` unbounded queue.
    Flume,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crossbeam => f.write_str("crossbeam"),
            Self::Flume => f.write_str("flume"),
        }
    }
}

impl TryFrom<String> for EngineKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crossbeam" => Ok(Self::Crossbeam),
            "flume" => Ok(Self::Flume),
            _ => Err(ConfigError::UnknownEngine(s.to_string())),
        }
    }
}

/// Configuration of a [`GpuParallel`](crate::core::GpuParallel) instance.
///
/// Validated at construction, never at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Explicit device identifiers, e.g. `["cuda:3", "cuda:4"]`.
    pub device_ids: Option<Vec<String>>,
    /// Number of devices, shortcut for `cuda:0..cuda:{n-1}`.
    pub n_devices: Option<usize>,
    /// Workers bound to every device.
    pub workers_per_device: usize,
    /// Yield results in submission order.
    pub preserve_order: bool,
    /// Replace failed task results with placeholders instead of raising.
    pub ignore_errors: bool,
    /// Run everything inline on the caller's thread.
    pub debug: bool,
    /// Queue primitive feeding the workers.
    pub engine: EngineKind,
    /// Per-worker join timeout at teardown, in milliseconds.
    pub join_timeout_ms: u64,
    /// Stack size of worker threads; platform default when unset.
    pub thread_stack_size: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            device_ids: None,
            n_devices: None,
            workers_per_device: 1,
            preserve_order: false,
            ignore_errors: false,
            debug: false,
            engine: EngineKind::Crossbeam,
            join_timeout_ms: 2_000,
            thread_stack_size: None,
        }
    }
}

impl ParallelConfig {
    /// Default configuration: one worker on `cuda:0`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit list of devices.
    #[must_use]
    pub fn with_device_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Use `n` CUDA-style devices.
    #[must_use]
    pub const fn with_n_devices(mut self, n: usize) -> Self {
        self.n_devices = Some(n);
        self
    }

    /// Set the number of workers per device.
    #[must_use]
    pub const fn with_workers_per_device(mut self, workers: usize) -> Self {
        self.workers_per_device = workers;
        self
    }

    /// Yield results in submission order.
    #[must_use]
    pub const fn with_preserve_order(mut self, preserve: bool) -> Self {
        self.preserve_order = preserve;
        self
    }

    /// Replace failed task results with placeholders.
    #[must_use]
    pub const fn with_ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    /// Run inline on the caller's thread.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Select the intake queue engine.
    #[must_use]
    pub const fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Set the per-worker join timeout used at teardown.
    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }

    /// Per-worker join timeout at teardown.
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_ids.is_some() && self.n_devices.is_some() {
            return Err(ConfigError::ConflictingDevices);
        }
        if self.device_ids.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::EmptyDeviceIds);
        }
        if self.n_devices == Some(0) {
            return Err(ConfigError::ZeroDevices);
        }
        if self.workers_per_device == 0 {
            return Err(ConfigError::ZeroWorkersPerDevice);
        }
        Ok(())
    }

    /// Resolve the device list. Neither form set means a single `cuda:0`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the configuration is invalid.
    pub fn devices(&self) -> Result<Vec<DeviceId>, ConfigError> {
        self.validate()?;
        Ok(match (&self.device_ids, self.n_devices) {
            (Some(ids), _) => ids.iter().cloned().map(DeviceId::from).collect(),
            (None, n) => (0..n.unwrap_or(1)).map(DeviceId::cuda).collect(),
        })
    }

    /// Total number of workers the pool will spawn.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the configuration is invalid.
    pub fn total_workers(&self) -> Result<usize, ConfigError> {
        Ok(self.devices()?.len() * self.workers_per_device)
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` on malformed input,
    /// `ConfigError::UnknownEngine` for an unknown engine, or a validation error.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(engine) = value.get("engine").and_then(serde_json::Value::as_str) {
            engine.parse::<EngineKind>()?;
        }
        let cfg: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `GPU_PARALLEL_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// Recognised variables: `DEVICE_IDS` (comma separated), `N_DEVICES`,
    /// `WORKERS_PER_DEVICE`, `PRESERVE_ORDER`, `IGNORE_ERRORS`, `DEBUG`,
    /// `ENGINE`, `JOIN_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` for unparsable values,
    /// `ConfigError::UnknownEngine` for an unknown engine, or a validation error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// Keys passed to `lookup` carry the [`ENV_PREFIX`].
    ///
    /// # Errors
    ///
    /// Same as [`ParallelConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut cfg = Self::default();

        if let Some(ids) = get("DEVICE_IDS") {
            cfg.device_ids = Some(
                ids.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        if let Some(n) = get("N_DEVICES") {
            cfg.n_devices = Some(parse_env("N_DEVICES", &n)?);
        }
        if let Some(w) = get("WORKERS_PER_DEVICE") {
            cfg.workers_per_device = parse_env("WORKERS_PER_DEVICE", &w)?;
        }
        if let Some(v) = get("PRESERVE_ORDER") {
            cfg.preserve_order = parse_flag("PRESERVE_ORDER", &v)?;
        }
        if let Some(v) = get("IGNORE_ERRORS") {
            cfg.ignore_errors = parse_flag("IGNORE_ERRORS", &v)?;
        }
        if let Some(v) = get("DEBUG") {
            cfg.debug = parse_flag("DEBUG", &v)?;
        }
        if let Some(engine) = get("ENGINE") {
            cfg.engine = engine.parse()?;
        }
        if let Some(ms) = get("JOIN_TIMEOUT_MS") {
            cfg.join_timeout_ms = parse_env("JOIN_TIMEOUT_MS", &ms)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
    })
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: format!("{ENV_PREFIX}{name}"),
            value: value.to_string(),
        }),
    }
}
