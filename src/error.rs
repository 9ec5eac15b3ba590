//! Error types used by the service runtime, its tasks and their engines.
//!
//! - [`ConfigError`]: the declared tasks or options cannot form a valid service.
//! - [`OptionError`]: reading or writing a named option failed.
//! - [`ServiceError`]: the service could not be created or a lookup missed.
//! - [`QueueError`]: a work queue rejected an item.
//! - [`CompletionError`]: an asynchronous result could not be delivered.
//!
//! Errors raised by user code inside tasks are plain [`anyhow::Error`]s,
//! see [`crate::TaskError`].

use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// The declared tasks, dependencies or options are inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("unknown task {name:?} selected; available tasks: {}", .available.join(", "))]
    UnknownTask {
        name: String,
        available: Vec<String>,
    },

    #[error("no tasks selected; available tasks: {}", .available.join(", "))]
    NoTasksSelected { available: Vec<String> },

    #[error("option {0:?} registered more than once")]
    DuplicateOption(String),

    #[error("task {task} has no interval configured")]
    MissingInterval { task: String },
}

/// Reading, writing or coercing a named option failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptionError {
    #[error("unknown option {0:?}")]
    Unknown(String),

    #[error("option {name:?}: cannot coerce {value:?} to {kind}")]
    Coerce {
        name: String,
        kind: &'static str,
        value: String,
    },
}

/// Creating, running or querying a service failed.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Option(#[from] OptionError),

    #[error("{count} task(s) failed to initialize")]
    InitFailed {
        count: usize,
        errors: Vec<(String, anyhow::Error)>,
    },

    #[error("task {task} could not be created: {error:#}")]
    CreateFailed { task: String, error: anyhow::Error },

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("tasks have not been created yet")]
    NotCreated,

    #[error("service has been dropped")]
    Gone,

    #[error("service supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ServiceError {
    /// Returns a short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "service_config",
            ServiceError::Option(_) => "service_option",
            ServiceError::InitFailed { .. } => "service_init_failed",
            ServiceError::CreateFailed { .. } => "service_create_failed",
            ServiceError::TaskNotFound(_) => "service_task_not_found",
            ServiceError::NotCreated => "service_not_created",
            ServiceError::Gone => "service_gone",
            ServiceError::Join(_) => "service_join",
        }
    }
}

/// A work queue refused an item.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("item is already queued")]
    Duplicate,

    #[error("queue is full")]
    Full,
}

/// An asynchronous execution result could not be obtained.
#[derive(Debug, Error, Clone)]
pub enum CompletionError {
    #[error("worker not running")]
    NotRunning,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution failed: {0}")]
    Failed(Arc<anyhow::Error>),

    #[error("result was dropped before completion")]
    Dropped,
}
