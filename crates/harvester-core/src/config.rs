//! Configuration for the harvester daemon.
//!
//! Values come from `$HARVESTER_CONFIG` or `~/.harvester/config.yaml`, then
//! the deployment environment variables override individual fields.

use crate::CoreError;
use harvester_engine::{HarvestOptions, OutboxOptions, DEFAULT_LEDGER_PREFIX};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HARVESTER_CONFIG";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    /// Unix socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// PID file path
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Data directory for daemon state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root directory of the filesystem object store (one directory per bucket)
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Directory holding the per-topic message outboxes
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,

    /// Rotate an outbox file past this size in bytes (default: 10MB)
    #[serde(default = "default_max_outbox_size")]
    pub max_outbox_size: u64,

    /// Bucket holding workspace files
    #[serde(default = "default_source_bucket")]
    pub source_bucket: String,

    /// Bucket receiving ledgers and harvested output
    #[serde(default = "default_target_bucket")]
    pub target_bucket: String,

    /// Bucket receiving access-policy documents
    #[serde(default = "default_policy_bucket")]
    pub policy_bucket: String,

    /// Directory inside each workspace that is harvested
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Maximum upserts + deletions per emitted batch
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Minimum seconds between runs of one workspace
    #[serde(default = "default_runtime_frequency_limit_secs")]
    pub runtime_frequency_limit_secs: u64,

    /// Listings larger than this use the bulk topic
    #[serde(default = "default_bulk_queue_minimum")]
    pub bulk_queue_minimum: usize,

    #[serde(default = "default_standard_topic")]
    pub standard_topic: String,

    #[serde(default = "default_bulk_topic")]
    pub bulk_topic: String,

    /// Concurrent content fetches per run
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,

    /// Number of workspaces whose last run summary is kept
    #[serde(default = "default_recent_runs")]
    pub recent_runs: usize,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(harvester_ipc::DEFAULT_SOCKET_PATH)
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/tmp/harvester.pid")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".harvester")
}

fn default_storage_root() -> PathBuf {
    default_data_dir().join("storage")
}

fn default_outbox_dir() -> PathBuf {
    default_data_dir().join("outbox")
}

fn default_max_outbox_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_source_bucket() -> String {
    "workspaces-source".to_string()
}

fn default_target_bucket() -> String {
    "workspaces-harvested".to_string()
}

fn default_policy_bucket() -> String {
    "access-control".to_string()
}

fn default_config_dir() -> String {
    "eodh-config".to_string()
}

fn default_max_entries() -> usize {
    1000
}

fn default_runtime_frequency_limit_secs() -> u64 {
    10
}

fn default_bulk_queue_minimum() -> usize {
    100
}

fn default_standard_topic() -> String {
    "harvested".to_string()
}

fn default_bulk_topic() -> String {
    "harvested-bulk".to_string()
}

fn default_fetch_concurrency() -> usize {
    8
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_recent_runs() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file: default_pid_file(),
            data_dir: default_data_dir(),
            storage_root: default_storage_root(),
            outbox_dir: default_outbox_dir(),
            max_outbox_size: default_max_outbox_size(),
            source_bucket: default_source_bucket(),
            target_bucket: default_target_bucket(),
            policy_bucket: default_policy_bucket(),
            config_dir: default_config_dir(),
            max_entries: default_max_entries(),
            runtime_frequency_limit_secs: default_runtime_frequency_limit_secs(),
            bulk_queue_minimum: default_bulk_queue_minimum(),
            standard_topic: default_standard_topic(),
            bulk_topic: default_bulk_topic(),
            fetch_concurrency: default_fetch_concurrency(),
            storage_timeout_secs: default_storage_timeout_secs(),
            recent_runs: default_recent_runs(),
            log_level: default_log_level(),
        }
    }
}

impl HarvesterConfig {
    /// Load configuration from file and environment, falling back to defaults
    pub fn load() -> Self {
        let config_path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir().join("config.yaml"));

        let mut config = if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to load config file: {}", e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| CoreError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply deployment environment overrides. Unparsable numbers are logged
    /// and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SOURCE_S3_BUCKET") {
            self.source_bucket = value;
        }
        if let Some(value) = lookup("TARGET_S3_BUCKET") {
            self.target_bucket = value;
        }
        if let Some(value) = lookup("CATALOGUE_DATA_ACCESS_CONTROL_S3_BUCKET") {
            self.policy_bucket = value;
        }
        if let Some(value) = lookup("EODH_CONFIG_DIR") {
            self.config_dir = value;
        }
        if let Some(value) = lookup("PULSAR_TOPIC") {
            self.standard_topic = value;
        }
        if let Some(value) = lookup("PULSAR_TOPIC_BULK") {
            self.bulk_topic = value;
        }

        override_number(&lookup, "MAX_ENTRIES", &mut self.max_entries);
        override_number(
            &lookup,
            "RUNTIME_FREQUENCY_LIMIT",
            &mut self.runtime_frequency_limit_secs,
        );
        override_number(&lookup, "BULK_QUEUE_MINIMUM", &mut self.bulk_queue_minimum);
    }

    /// Engine settings for harvest runs
    pub fn harvest_options(&self) -> HarvestOptions {
        HarvestOptions {
            source_bucket: self.source_bucket.clone(),
            target_bucket: self.target_bucket.clone(),
            config_dir: self.config_dir.clone(),
            ledger_prefix: DEFAULT_LEDGER_PREFIX.to_string(),
            max_entries: self.max_entries,
            minimum_interval: Duration::from_secs(self.runtime_frequency_limit_secs),
            fetch_concurrency: self.fetch_concurrency,
            storage_timeout: self.storage_timeout(),
            bulk_queue_minimum: self.bulk_queue_minimum,
            ..HarvestOptions::default()
        }
    }

    /// Outbox notifier settings
    pub fn outbox_options(&self) -> OutboxOptions {
        OutboxOptions {
            dir: self.outbox_dir.clone(),
            standard_topic: self.standard_topic.clone(),
            bulk_topic: self.bulk_topic.clone(),
            output_bucket: self.target_bucket.clone(),
            max_size: self.max_outbox_size,
            storage_timeout: self.storage_timeout(),
        }
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    /// Ensure data directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.storage_root)?;
        std::fs::create_dir_all(&self.outbox_dir)?;
        Ok(())
    }
}

fn override_number<F, T>(lookup: &F, name: &str, field: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(name) {
        match value.trim().parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => tracing::warn!(var = name, value = %value, "Ignoring invalid numeric override"),
        }
    }
}
