//! chronoq - job scheduling and queue execution engine.
//!
//! Usage:
//!   chronoq serve [--config FILE]       Run engine, schedule runner, workers and HTTP API
//!   chronoq validate-cron <EXPR>        Validate a cron expression and print next occurrences
//!   chronoq check-config <FILE>         Validate a configuration file

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use chronoq::api::{create_api_state, start_server};
use chronoq::config::{EngineConfig, StorageConfig};
use chronoq::core::cron::parse_timezone;
use chronoq::{
    CronExpression, EventBus, HandlerError, HandlerRegistry, InMemoryStorage, Job, JobFilter,
    JobHandler, LoggingHandler, QueueRouter, ScheduleRunner, SchedulerEngine, SchedulerError,
    Storage, WorkerPool,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// chronoq - job scheduling and queue execution engine
#[derive(Parser)]
#[command(name = "chronoq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine with its schedule runner, worker pool and HTTP API
    Serve {
        /// Path to a YAML configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Override the API port from the configuration
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate a cron expression and print its next occurrences
    ValidateCron {
        /// Five-field cron expression, quoted
        #[arg(value_name = "EXPR")]
        expression: String,

        /// IANA timezone the expression is evaluated in
        #[arg(short, long, default_value = "UTC")]
        timezone: String,

        /// Number of occurrences to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },

    /// Validate a configuration file without running
    CheckConfig {
        /// Path to the YAML configuration file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

/// Fallback handler for the standalone server: logs the delivery and
/// succeeds. Embedders register real handlers per job type.
struct LogOnlyHandler;

#[async_trait]
impl JobHandler for LogOnlyHandler {
    async fn execute(&self, job: &Job) -> Result<Option<Value>, HandlerError> {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            name = %job.name,
            "Handling job (no handler registered, logging only)"
        );
        Ok(None)
    }
}

fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port } => {
            let mut config = match config {
                Some(path) => EngineConfig::from_file(&path)?,
                None => EngineConfig::default(),
            };
            if let Some(port) = port {
                config.api.port = port;
            }
            init_logging(&config.log_level);
            serve(config).await?;
        }
        Commands::ValidateCron {
            expression,
            timezone,
            count,
        } => {
            validate_cron(&expression, &timezone, count)?;
        }
        Commands::CheckConfig { file } => {
            check_config(file)?;
        }
    }

    Ok(())
}

/// Pick the storage backend and run the server on it.
async fn serve(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage (state is lost on exit)");
            run_server(config.clone(), InMemoryStorage::new()).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!(path = %path, "Using SQLite storage");
            let storage = chronoq::SqliteStorage::new(path).await?;
            run_server(config.clone(), storage).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("sqlite storage requires the `sqlite` feature".into())
        }
    }
}

async fn run_server<S: Storage + 'static>(
    config: EngineConfig,
    storage: S,
) -> Result<(), Box<dyn std::error::Error>> {
    // Create event bus with logging handler
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let router = QueueRouter::in_memory(config.queues.to_router_settings());
    let engine = Arc::new(
        SchedulerEngine::new(Arc::new(storage), Arc::new(router))
            .with_event_bus(event_bus)
            .with_backoff(config.retry.to_backoff()),
    );

    seed_jobs(&engine, &config).await?;

    let registry = HandlerRegistry::new().with_fallback(Arc::new(LogOnlyHandler));

    info!(
        tick_interval_ms = config.tick_interval_ms,
        "Starting schedule runner"
    );
    let (handle, runner_task) = ScheduleRunner::new(Arc::clone(&engine))
        .with_tick_interval(config.tick_interval())
        .start();

    let workers = WorkerPool::new(
        Arc::clone(&engine),
        Arc::new(registry),
        config.workers.to_worker_config(),
    )
    .start();

    let state = create_api_state(Arc::clone(&engine), Some(handle.clone()));
    let server = start_server(&config.api, state).await?;

    info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = runner_task => {
            warn!("Schedule runner stopped");
        }
    }

    server.abort();
    workers.shutdown().await;
    info!("Goodbye!");
    Ok(())
}

/// Create the configured jobs that do not exist yet and attach their
/// schedules. Jobs are matched by name and type.
async fn seed_jobs<S: Storage + 'static>(
    engine: &SchedulerEngine<S>,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    for seed in &config.jobs {
        let filter = JobFilter {
            job_type: Some(seed.job.job_type),
            ..Default::default()
        };
        let existing = engine
            .list_jobs(&filter)
            .await?
            .into_iter()
            .find(|job| job.name == seed.job.name.trim());

        let job = match existing {
            Some(job) => {
                info!(job_id = %job.id, name = %job.name, "Seed job already exists");
                job
            }
            None => engine.create_job(seed.job.clone()).await?,
        };

        let Some(schedule) = &seed.schedule else {
            continue;
        };
        match engine.get_schedule(&job.id).await {
            Ok(_) => {}
            Err(SchedulerError::NotFound(_)) => {
                let schedule = engine.schedule_job(&job.id, schedule.to_options()).await?;
                info!(
                    job_id = %job.id,
                    cron = %schedule.cron_expression,
                    next_execution = ?schedule.next_execution,
                    "Seed schedule attached"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Validate a cron expression and print its next occurrences.
fn validate_cron(
    expression: &str,
    timezone: &str,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let cron = CronExpression::parse(expression)?;
    let tz = parse_timezone(timezone)?;

    println!("Expression '{}' is valid ({})", cron, tz);
    let occurrences = cron.next_n_after(Utc::now(), tz, count);
    if occurrences.is_empty() {
        println!("No upcoming occurrences");
        return Ok(());
    }

    println!("Next {} occurrence(s):", occurrences.len());
    for at in occurrences {
        println!(
            "  {}  ({} UTC)",
            at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z"),
            at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

/// Validate a configuration file and print a summary.
fn check_config(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_file(&file)?;

    println!("Configuration {} is valid", file.display());
    println!("  Tick interval: {} ms", config.tick_interval_ms);
    println!(
        "  Workers: {} (poll {} ms, default timeout {} ms)",
        config.workers.concurrency,
        config.workers.poll_interval_ms,
        config.workers.default_timeout_ms
    );
    println!(
        "  Priority threshold: {}",
        config.queues.high_priority_threshold
    );
    match &config.storage {
        StorageConfig::Memory => println!("  Storage: memory"),
        StorageConfig::Sqlite { path } => println!("  Storage: sqlite ({})", path),
    }
    println!("  API: {}", config.api.bind_address());

    if !config.jobs.is_empty() {
        println!("  Jobs:");
        for seed in &config.jobs {
            let schedule = seed
                .schedule
                .as_ref()
                .map(|s| s.cron().to_string())
                .unwrap_or_else(|| "manual only".to_string());
            println!(
                "    - {} ({}): {}",
                seed.job.name, seed.job.job_type, schedule
            );
        }
    }
    Ok(())
}
