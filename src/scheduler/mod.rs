//! Scheduling engine and the runner that fires due schedules.

mod engine;
mod handle;
mod runner;
mod types;

pub use engine::{JobStatistics, MAX_WRITE_ATTEMPTS, SchedulerEngine, WorkItem};
pub use handle::SchedulerHandle;
pub use runner::ScheduleRunner;
pub use types::{ErrorKind, SchedulerError, SchedulerState};
