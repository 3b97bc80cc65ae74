//! chronoq - job scheduling and queue execution engine.
//!
//! Jobs carry a type, a payload and a retry budget. The [`SchedulerEngine`]
//! drives them through their lifecycle, hands dispatched work to a broker
//! through the [`QueueRouter`] and attaches cron schedules that the
//! [`ScheduleRunner`] fires. A [`WorkerPool`] pulls deliveries back out and
//! runs the [`JobHandler`] registered for each job type.

pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, EngineConfig, StorageConfig, YamlLoader};
pub use core::backoff::BackoffCalculator;
pub use core::cron::{CronError, CronExpression, validate_cron};
pub use core::execution::{ExecutionStatus, JobExecution};
pub use core::job::{Job, JobError, JobFilter, JobPatch, JobStatus, JobType, NewJob};
pub use core::schedule::{JobSchedule, ScheduleError, ScheduleOptions, ScheduleStatus};
pub use core::types::{ExecutionId, JobId, ScheduleId};
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use execution::{
    DeliveryOutcome, HandlerError, HandlerRegistry, JobHandler, WorkerConfig, WorkerPool,
    WorkerPoolHandle,
};
pub use queue::{
    InMemoryQueue, ItemState, QueueBackend, QueueError, QueueItem, QueueName, QueueRouter,
    RouteOptions, RouterSettings,
};
pub use scheduler::{
    ErrorKind, JobStatistics, ScheduleRunner, SchedulerEngine, SchedulerError, SchedulerHandle,
    SchedulerState, WorkItem,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, Storage, StorageError};
