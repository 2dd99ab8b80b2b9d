//! Configuration management with validation and defaults
//!
//! Values come from built-in defaults, an optional TOML file, then
//! `FAIRPLAY_*` environment variables, in that order.

use crate::errors::{ConfigurationError, EngineResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FairplayConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Game engine limits and background behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest accepted bet, in the smallest currency unit
    pub max_bet: u64,
    pub max_client_seed_len: usize,
    /// Playing sessions idle this long are cancelled by the sweeper
    pub session_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Transparent retries after a version-guard conflict
    pub ledger_conflict_retries: u32,
    /// SEQUENCE auto-resolves after this many winning guesses
    pub sequence_max_steps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bet: 1_000_000,
            max_client_seed_len: 64,
            session_idle_timeout_secs: 900,
            sweep_interval_secs: 30,
            ledger_conflict_retries: 3,
            sequence_max_steps: 20,
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    /// none | snappy | lz4 | zstd
    pub compression: String,
    /// fsync every batch; ledger writes must survive a crash
    pub sync_writes: bool,
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/fairplay_data".to_string(),
            write_buffer_size_mb: 64,
            compression: "lz4".to_string(),
            sync_writes: true,
            clear_on_start: false,
        }
    }
}

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// Shared secret for the `/admin` routes; they are not mounted when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
            admin_token: None,
        }
    }
}

/// Monitoring and observability configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Default filter when RUST_LOG is unset
    pub log_level: String,
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_metrics: true,
        }
    }
}

/// Configuration loader with file and environment support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> EngineResult<FairplayConfig> {
        self.load_with(|name| env::var(name).ok())
    }

    /// Same as `load`, reading overrides through `lookup` instead of the process environment
    pub fn load_with<F>(&self, lookup: F) -> EngineResult<FairplayConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => FairplayConfig::default(),
        };

        self.apply_overrides(&mut config, lookup)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> EngineResult<FairplayConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_overrides<F>(&self, config: &mut FairplayConfig, lookup: F) -> EngineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // API overrides
        if let Some(host) = lookup("FAIRPLAY_API_HOST") {
            config.api.host = host;
        }
        if let Some(port) = parse_override(&lookup, "FAIRPLAY_API_PORT", "Invalid port number")? {
            config.api.port = port;
        }
        if let Some(token) = lookup("FAIRPLAY_ADMIN_TOKEN") {
            config.api.admin_token = Some(token);
        }

        // Storage overrides
        if let Some(dir) = lookup("FAIRPLAY_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Some(sync) = parse_override(&lookup, "FAIRPLAY_SYNC_WRITES", "Invalid boolean value")? {
            config.storage.sync_writes = sync;
        }

        // Engine overrides
        if let Some(max_bet) = parse_override(&lookup, "FAIRPLAY_MAX_BET", "Invalid amount")? {
            config.engine.max_bet = max_bet;
        }
        if let Some(secs) = parse_override(&lookup, "FAIRPLAY_SESSION_IDLE_TIMEOUT_SECS", "Invalid duration")? {
            config.engine.session_idle_timeout_secs = secs;
        }
        if let Some(retries) = parse_override(&lookup, "FAIRPLAY_LEDGER_CONFLICT_RETRIES", "Invalid count")? {
            config.engine.ledger_conflict_retries = retries;
        }

        if let Some(level) = lookup("FAIRPLAY_LOG_LEVEL") {
            config.monitoring.log_level = level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &FairplayConfig) -> EngineResult<()> {
        if config.engine.max_bet == 0 {
            return Err(invalid("engine.max_bet", "0", "Max bet cannot be zero"));
        }
        if config.engine.max_client_seed_len == 0 {
            return Err(invalid(
                "engine.max_client_seed_len",
                "0",
                "Client seeds need at least one character",
            ));
        }
        if config.engine.sweep_interval_secs == 0 {
            return Err(invalid("engine.sweep_interval_secs", "0", "Sweep interval cannot be zero"));
        }
        if config.engine.sequence_max_steps == 0 {
            return Err(invalid("engine.sequence_max_steps", "0", "Must allow at least one step"));
        }

        if config.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()).into());
        }
        if config.storage.write_buffer_size_mb == 0 {
            return Err(invalid("storage.write_buffer_size_mb", "0", "Write buffer cannot be zero"));
        }
        if !["none", "snappy", "lz4", "zstd"].contains(&config.storage.compression.to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "storage.compression",
                &config.storage.compression,
                "Expected none, snappy, lz4 or zstd",
            ));
        }

        if config.api.port == 0 {
            return Err(invalid("api.port", "0", "API port cannot be zero"));
        }
        if config.api.request_timeout_secs == 0 {
            return Err(invalid("api.request_timeout_secs", "0", "Timeout cannot be zero"));
        }
        if config.api.admin_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(invalid("api.admin_token", "", "Admin token cannot be blank"));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &FairplayConfig, path: &str) -> EngineResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

fn parse_override<F, T>(lookup: &F, name: &str, reason: &str) -> EngineResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            ConfigurationError::InvalidValue {
                field: name.to_string(),
                value: raw,
                reason: reason.to_string(),
            }
            .into()
        }),
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::errors::EngineError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Generate a sample configuration file
pub fn generate_sample_config(path: &str) -> EngineResult<()> {
    ConfigLoader::new().save(&FairplayConfig::default(), path)
}
