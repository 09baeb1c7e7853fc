use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::models::{BusinessDomain, ConflictStrategy};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Whether the engine may touch the network at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Normal,
    /// Behave as permanently disconnected: every write is queued.
    OfflineOnly,
}

impl RunMode {
    pub fn allows_network(&self) -> bool {
        matches!(self, RunMode::Normal)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "normal" => Ok(RunMode::Normal),
            "offline_only" | "offline" => Ok(RunMode::OfflineOnly),
            _ => Err(format!(
                "Invalid run mode '{}'. Valid options: normal, offline_only",
                s
            )),
        }
    }
}

/// Remote API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the backend (e.g., "https://api.example.com")
    pub base_url: Option<String>,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Token exchanged for a new access token on 401
    pub refresh_token: Option<String>,
    pub refresh_endpoint: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            refresh_token: None,
            refresh_endpoint: "/auth/refresh".to_string(),
        }
    }
}

impl ApiConfig {
    /// Returns true if a backend URL is configured
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }
}

/// Offline queue retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long completed items are kept for auditing (0 = purge immediately)
    pub audit_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            audit_retention_secs: 0,
        }
    }
}

impl QueueConfig {
    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(self.audit_retention_secs)
    }
}

/// Engine configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    pub run_mode: ConfigValue<RunMode>,
    pub batch_size: ConfigValue<usize>,
    pub compression_enabled: bool,
    pub network_timeout_secs: u64,
    pub db_timeout_secs: u64,
    pub default_conflict_strategy: ConflictStrategy,
    pub api: ApiConfig,
    pub queue: QueueConfig,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    run_mode: Option<RunMode>,
    batch_size: Option<usize>,
    compression_enabled: Option<bool>,
    network_timeout_secs: Option<u64>,
    db_timeout_secs: Option<u64>,
    default_conflict_strategy: Option<ConflictStrategy>,
    api: Option<ApiConfig>,
    queue: Option<QueueConfig>,
}

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 10;

impl EngineConfig {
    /// Defaults pointing at an explicit database file, for embedding hosts
    /// that build their configuration in code.
    pub fn for_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: ConfigValue::new(path.into(), ConfigSource::Default),
            run_mode: ConfigValue::new(RunMode::Normal, ConfigSource::Default),
            batch_size: ConfigValue::new(DEFAULT_BATCH_SIZE, ConfigSource::Default),
            compression_enabled: true,
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            db_timeout_secs: DEFAULT_DB_TIMEOUT_SECS,
            default_conflict_strategy: ConflictStrategy::Merge,
            api: ApiConfig::default(),
            queue: QueueConfig::default(),
            config_file: None,
        }
    }

    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::for_database(Self::default_data_dir().join("fieldsync.db"));

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config.apply_file(&path, file_config);
        }

        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path, file: ConfigFile) {
        self.config_file = Some(path.to_path_buf());

        if let Some(db_path) = file.database_path {
            // Resolve relative paths against config file's directory
            let resolved = if db_path.is_relative() {
                path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
            } else {
                db_path
            };
            self.database_path = ConfigValue::new(resolved, ConfigSource::File);
        }
        if let Some(mode) = file.run_mode {
            self.run_mode = ConfigValue::new(mode, ConfigSource::File);
        }
        if let Some(size) = file.batch_size {
            self.batch_size = ConfigValue::new(size, ConfigSource::File);
        }
        if let Some(enabled) = file.compression_enabled {
            self.compression_enabled = enabled;
        }
        if let Some(secs) = file.network_timeout_secs {
            self.network_timeout_secs = secs;
        }
        if let Some(secs) = file.db_timeout_secs {
            self.db_timeout_secs = secs;
        }
        if let Some(strategy) = file.default_conflict_strategy {
            self.default_conflict_strategy = strategy;
        }
        if let Some(api) = file.api {
            self.api = api;
        }
        if let Some(queue) = file.queue {
            self.queue = queue;
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(db_path) = std::env::var("FIELDSYNC_DATABASE_PATH") {
            self.database_path =
                ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(mode) = std::env::var("FIELDSYNC_RUN_MODE") {
            let parsed = RunMode::from_str(&mode)
                .map_err(|_| ConfigError::InvalidValue("FIELDSYNC_RUN_MODE", mode.clone()))?;
            self.run_mode = ConfigValue::new(parsed, ConfigSource::Environment);
        }
        if let Ok(size) = std::env::var("FIELDSYNC_BATCH_SIZE") {
            let parsed = size
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("FIELDSYNC_BATCH_SIZE", size.clone()))?;
            self.batch_size = ConfigValue::new(parsed, ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("FIELDSYNC_API_URL") {
            self.api.base_url = Some(url);
        }
        if let Ok(token) = std::env::var("FIELDSYNC_API_TOKEN") {
            self.api.token = Some(token);
        }
        Ok(())
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs)
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/fieldsync/
    /// - macOS: ~/Library/Application Support/fieldsync/
    /// - Windows: %APPDATA%/fieldsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/fieldsync/
    /// - macOS: ~/Library/Application Support/fieldsync/
    /// - Windows: %APPDATA%/fieldsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

/// Per-run options passed to the orchestrator.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub compression_enabled: bool,
    /// Ignore checkpoints and incremental markers; pull everything.
    pub force_full_sync: bool,
    pub resume_from_checkpoint: bool,
    /// Empty means every registered domain.
    pub domains: Vec<BusinessDomain>,
    /// Empty means every entity.
    pub entities: Vec<String>,
    /// Drive `synchronize_batch` loops instead of one `synchronize` call.
    pub batch_mode: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            compression_enabled: true,
            force_full_sync: false,
            resume_from_checkpoint: true,
            domains: Vec::new(),
            entities: Vec::new(),
            batch_mode: true,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size.value,
            compression_enabled: config.compression_enabled,
            ..Self::default()
        }
    }

    pub fn forced_full() -> Self {
        Self {
            force_full_sync: true,
            resume_from_checkpoint: false,
            ..Self::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    ReadError(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    ParseError(PathBuf, serde_yaml::Error),
    #[error("Invalid value for {0}: '{1}'")]
    InvalidValue(&'static str, String),
}
