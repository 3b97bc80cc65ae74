//! Domain model: identifiers, jobs, schedules, executions and the leaf
//! utilities they depend on.

pub mod backoff;
pub mod cron;
pub mod execution;
pub mod job;
pub mod schedule;
pub mod types;
