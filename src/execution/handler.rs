//! Job handlers and their registry.
//!
//! The engine never runs payloads itself. A [`JobHandler`] does the actual
//! work for one or more [`JobType`]s and the [`HandlerRegistry`] picks the
//! handler for each delivery.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::job::{Job, JobType};

/// Errors a handler can report.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Execution failed with a message.
    #[error("execution failed: {0}")]
    Failed(String),

    /// Execution failed with structured details kept on the execution record.
    #[error("execution failed: {message}")]
    FailedWithDetails { message: String, details: Value },

    /// No handler is registered for the job's type.
    #[error("no handler registered for job type {0}")]
    Unsupported(JobType),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Structured details, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            HandlerError::FailedWithDetails { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

/// Performs the work of a job.
///
/// # Example
///
/// ```ignore
/// use chronoq::{Job, JobHandler, HandlerError};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct EmailHandler;
///
/// #[async_trait]
/// impl JobHandler for EmailHandler {
///     async fn execute(&self, job: &Job) -> Result<Option<Value>, HandlerError> {
///         let to = job.payload["to"].as_str().ok_or_else(|| HandlerError::failed("missing recipient"))?;
///         // send the mail...
///         Ok(Some(json!({ "delivered_to": to })))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. The returned value is stored as the execution output.
    async fn execute(&self, job: &Job) -> Result<Option<Value>, HandlerError>;
}

/// Handlers keyed by job type, with an optional fallback.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    /// Handler for types with no handler of their own.
    pub fn with_fallback(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(&job_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Whether a delivery of `job_type` can be handled.
    pub fn supports(&self, job_type: JobType) -> bool {
        self.fallback.is_some() || self.handlers.contains_key(&job_type)
    }

    /// Types with a dedicated handler.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}
