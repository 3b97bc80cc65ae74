//! YAML configuration parsing.
//!
//! Parses the engine configuration from YAML files and validates it.

use std::collections::HashSet;
use std::path::Path;

use crate::core::cron::{parse_timezone, validate_cron};

use super::error::ConfigError;
use super::types::{EngineConfig, StorageConfig};

/// Loader for YAML configuration files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load engine configuration from a file.
    pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_engine_config(&config)?;
        Ok(config)
    }

    /// Parse engine configuration from a YAML string.
    pub fn parse_engine_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        Self::validate_engine_config(&config)?;
        Ok(config)
    }

    /// Validate an engine configuration.
    pub fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
        if config.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_ms cannot be zero".into(),
            ));
        }

        if config.workers.concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "workers.concurrency cannot be zero".into(),
            ));
        }

        if config.workers.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "workers.poll_interval_ms cannot be zero".into(),
            ));
        }

        let ratio = config.queues.unhealthy_failure_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "queues.unhealthy_failure_ratio must be in (0, 1], got {}",
                ratio
            )));
        }

        if config.queues.default_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "queues.default_attempts cannot be zero".into(),
            ));
        }

        if config.retry.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.base_delay_ms cannot be zero".into(),
            ));
        }

        if config.retry.max_delay_ms < config.retry.base_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                config.retry.max_delay_ms, config.retry.base_delay_ms
            )));
        }

        if !(0.0..=1.0).contains(&config.retry.jitter_ratio) {
            return Err(ConfigError::InvalidConfig(format!(
                "retry.jitter_ratio must be in [0, 1], got {}",
                config.retry.jitter_ratio
            )));
        }

        if let StorageConfig::Sqlite { path } = &config.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::MissingField("storage.path".into()));
            }
        }

        if config.api.host.trim().is_empty() {
            return Err(ConfigError::MissingField("api.host".into()));
        }

        Self::validate_seeds(config)
    }

    /// Seeds must be valid jobs with unique names and parseable schedules.
    fn validate_seeds(config: &EngineConfig) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for seed in &config.jobs {
            if !names.insert(seed.job.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate job name: {}",
                    seed.job.name
                )));
            }

            seed.job.clone().into_job().map_err(|e| {
                ConfigError::InvalidConfig(format!("job '{}': {}", seed.job.name, e))
            })?;

            if let Some(schedule) = &seed.schedule {
                validate_cron(schedule.cron()).map_err(|e| {
                    ConfigError::InvalidConfig(format!(
                        "job '{}' has an invalid schedule: {}",
                        seed.job.name, e
                    ))
                })?;
                if let Some(tz) = schedule.timezone() {
                    parse_timezone(tz).map_err(|e| {
                        ConfigError::InvalidConfig(format!("job '{}': {}", seed.job.name, e))
                    })?;
                }
            }
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        YamlLoader::load_engine_config(path)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        YamlLoader::parse_engine_config(yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        YamlLoader::validate_engine_config(self)
    }
}
