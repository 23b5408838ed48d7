//! Engine configuration.
//!
//! Every section has working defaults; a JSON file may override any subset
//! of fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub assigner: AssignerConfig,
    pub reconciler: ReconcilerConfig,

    /// HTTP gateway bind address (used by `hivesync-node`).
    pub http_bind_addr: String,
}

impl Config {
    /// Load a configuration file; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Store selection flags shared by the HiveSync binaries.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct StoreArgs {
    /// Path to a JSON config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Use a SQLite database at this path as the store
    #[arg(long, conflicts_with = "log")]
    pub sqlite: Option<PathBuf>,

    /// Use an append-only log file at this path as the store
    #[arg(long)]
    pub log: Option<PathBuf>,
}

impl StoreArgs {
    /// Load the config file (or defaults) and apply the store flags on top.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(path) = &self.sqlite {
            config.store.backend = StoreBackend::Sqlite { path: path.clone() };
        } else if let Some(path) = &self.log {
            config.store.backend = StoreBackend::Log {
                path: path.clone(),
                replica_id: None,
            };
        }
        Ok(config)
    }
}

/// Which store backend to open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process only.
    #[default]
    Memory,
    /// Shared SQLite database file.
    Sqlite { path: PathBuf },
    /// Shared append-only log file with a local replica per process.
    Log {
        path: PathBuf,
        /// Name recorded on appended entries; defaults to one derived from the pid.
        #[serde(default)]
        replica_id: Option<String>,
    },
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Attempts for one optimistic read-modify-write before giving up.
    pub max_cas_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            max_cas_retries: 8,
        }
    }
}

/// Worker registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expected heartbeat interval from workers (seconds).
    pub heartbeat_interval_secs: u64,

    /// Liveness timeout as a multiple of the heartbeat interval.
    pub timeout_multiplier: u32,

    /// Explicit liveness timeout (seconds); overrides the multiplier.
    pub liveness_timeout_secs: Option<u64>,

    /// Concurrency limit for workers that do not declare one.
    pub default_max_concurrent_tasks: u32,

    /// Added to a worker's performance score per completed task.
    pub completion_reward: f64,

    /// Subtracted from a worker's performance score per failed task.
    pub failure_penalty: f64,

    /// Upper bound of the performance score.
    pub max_performance_score: f64,
}

impl RegistryConfig {
    /// Heartbeat age after which a worker is declared OFFLINE.
    pub fn liveness_timeout(&self) -> Duration {
        match self.liveness_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(
                self.heartbeat_interval_secs * u64::from(self.timeout_multiplier.max(1)),
            ),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            timeout_multiplier: 4,
            liveness_timeout_secs: None,
            default_max_concurrent_tasks: 1,
            completion_reward: 2.0,
            failure_penalty: 10.0,
            max_performance_score: 200.0,
        }
    }
}

/// Weights of the assignment score
/// `workload + capability + performance - conflict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Points for a worker with no load; scaled down linearly as it fills up.
    pub workload: f64,

    /// Points for covering every tag the task asks for; scaled by the covered fraction.
    pub capability: f64,

    /// Multiplier applied to the worker's performance score.
    pub performance: f64,

    /// Points deducted per task resource the worker already holds.
    pub conflict: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            workload: 40.0,
            capability: 30.0,
            performance: 0.5,
            conflict: 20.0,
        }
    }
}

/// Assigner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignerConfig {
    pub weights: ScoringWeights,

    /// Workers lacking a required capability are skipped instead of scored lower.
    pub require_capabilities: bool,
}

/// Reconciler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Base time between ticks (milliseconds).
    pub interval_ms: u64,

    /// Shortest sleep when ticks keep finding work.
    pub min_interval_ms: u64,

    /// Longest sleep when the fleet is idle.
    pub max_interval_ms: u64,

    /// Shorten the sleep after busy ticks and stretch it after idle ones.
    pub adaptive: bool,

    /// First backoff after a tick with failed steps.
    pub backoff_initial_ms: u64,

    /// Backoff ceiling.
    pub backoff_max_ms: u64,

    /// Put FAILED tasks back in the queue.
    pub requeue_failed: bool,
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.min(self.interval_ms))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.interval_ms))
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            min_interval_ms: 1_000,
            max_interval_ms: 30_000,
            adaptive: true,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            requeue_failed: false,
        }
    }
}
