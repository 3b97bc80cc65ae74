//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the engine, its workers
//! and the jobs seeded at startup.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{
    ApiConfig, EngineConfig, JobSeedConfig, QueuesConfig, RetryConfig, ScheduleConfig,
    StorageConfig, WorkersConfig,
};
pub use yaml::YamlLoader;
