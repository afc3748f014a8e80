//! Configuration loading and environment variable handling

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::pool::PoolConfig;
use crate::domains::VimapConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "VIMAP".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<VimapConfig> {
        let path = path.as_ref();
        debug!("Reading configuration file {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let mut config: VimapConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<VimapConfig> {
        let mut config = VimapConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<VimapConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut VimapConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(&mut config.pool)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply pool config overrides
    fn apply_pool_overrides(&self, config: &mut PoolConfig) -> ConfigResult<()> {
        if let Some(count) = self.parse_env_var::<usize>("WORKER_COUNT")? {
            config.worker_count = count;
        }

        if let Some(factor) = self.parse_env_var::<usize>("SPOOL_FACTOR")? {
            config.spool_factor = factor;
        }

        if let Some(ms) = self.parse_env_var::<u64>("WORKER_POLL_MS")? {
            config.worker_poll_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = self.parse_env_var::<u64>("RESULT_POLL_MS")? {
            config.result_poll_interval = Duration::from_millis(ms);
        }

        if let Some(query) = self.parse_env_var::<bool>("QUERY_INPUT_DEPTH")? {
            config.query_input_depth = query;
        }

        if let Some(close) = self.parse_env_var::<bool>("CLOSE_IF_DONE")? {
            config.close_if_done = close;
        }

        if let Some(ms) = self.parse_env_var::<u64>("JOIN_TIMEOUT_MS")? {
            config.join_timeout = Some(Duration::from_millis(ms));
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
