//! Configuration type definitions.
//!
//! This module contains the type definitions for the engine's YAML
//! configuration: runner, workers, queues, retry backoff, storage, API and
//! the jobs seeded at startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::backoff::BackoffCalculator;
use crate::core::job::NewJob;
use crate::core::schedule::ScheduleOptions;
use crate::execution::WorkerConfig;
use crate::queue::RouterSettings;

/// Engine configuration (chronoq.yaml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Schedule runner tick in milliseconds.
    pub tick_interval_ms: u64,
    pub workers: WorkersConfig,
    pub queues: QueuesConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    /// Default tracing filter; `RUST_LOG` wins when set.
    pub log_level: String,
    /// Jobs created when the server starts.
    pub jobs: Vec<JobSeedConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            workers: WorkersConfig::default(),
            queues: QueuesConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            log_level: "info".into(),
            jobs: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub default_timeout_ms: u64,
    /// Defaults to `worker-<pid>`.
    pub worker_id: Option<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 250,
            default_timeout_ms: 300_000,
            worker_id: None,
        }
    }
}

impl WorkersConfig {
    pub fn to_worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig {
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            ..WorkerConfig::default()
        };
        if let Some(id) = &self.worker_id {
            config.worker_id = id.clone();
        }
        config
    }
}

/// Broker routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub high_priority_threshold: i32,
    pub default_attempts: u32,
    pub backoff_delay_ms: u64,
    pub unhealthy_failure_ratio: f64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        let settings = RouterSettings::default();
        Self {
            high_priority_threshold: settings.high_priority_threshold,
            default_attempts: settings.default_attempts,
            backoff_delay_ms: settings.backoff_delay_ms,
            unhealthy_failure_ratio: settings.unhealthy_failure_ratio,
        }
    }
}

impl QueuesConfig {
    pub fn to_router_settings(&self) -> RouterSettings {
        RouterSettings {
            high_priority_threshold: self.high_priority_threshold,
            default_attempts: self.default_attempts,
            backoff_delay_ms: self.backoff_delay_ms,
            unhealthy_failure_ratio: self.unhealthy_failure_ratio,
        }
    }
}

/// Job retry backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Additive jitter as a fraction of the delay.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 60_000,
            max_delay_ms: 86_400_000,
            jitter_ratio: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn to_backoff(&self) -> BackoffCalculator {
        BackoffCalculator::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter_ratio)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// HTTP API bind address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8565,
        }
    }
}

impl ApiConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A job created at startup, optionally with a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSeedConfig {
    #[serde(flatten)]
    pub job: NewJob,
    pub schedule: Option<ScheduleConfig>,
}

/// Schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleConfig {
    /// Simple cron expression string.
    Simple(String),
    /// Detailed schedule with timezone.
    Detailed {
        cron: String,
        timezone: Option<String>,
        max_executions: Option<u64>,
    },
}

impl ScheduleConfig {
    /// Get the cron expression.
    pub fn cron(&self) -> &str {
        match self {
            ScheduleConfig::Simple(s) => s,
            ScheduleConfig::Detailed { cron, .. } => cron,
        }
    }

    /// Get the timezone, if specified.
    pub fn timezone(&self) -> Option<&str> {
        match self {
            ScheduleConfig::Simple(_) => None,
            ScheduleConfig::Detailed { timezone, .. } => timezone.as_deref(),
        }
    }

    pub fn to_options(&self) -> ScheduleOptions {
        let mut options = ScheduleOptions::new(self.cron());
        if let Some(tz) = self.timezone() {
            options = options.timezone(tz);
        }
        if let ScheduleConfig::Detailed {
            max_executions: Some(max),
            ..
        } = self
        {
            options = options.max_executions(*max);
        }
        options
    }
}
