//! Job execution.
//!
//! This module provides the worker side of the engine: handlers that do the
//! work for each job type and a pool that pulls deliveries from the broker
//! and runs them.

mod handler;
mod worker;

pub use handler::{HandlerError, HandlerRegistry, JobHandler};
pub use worker::{DeliveryOutcome, WorkerConfig, WorkerPool, WorkerPoolHandle};
