//! Error types for regpool.

use crate::job::{JobId, JobStatus};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while creating, preparing, or transitioning a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job id '{0}'")]
    InvalidId(String),

    #[error("Workspace error: {reason}")]
    Workspace { reason: String },

    #[error("Failed to prepare job {job_id}: {reason}")]
    Preparation { job_id: JobId, reason: String },

    #[error("Invalid job parameters: {0}")]
    InvalidParams(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Errors surfaced by a container runtime adapter.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to connect to container engine: {reason}")]
    Connection { reason: String },

    #[error("Failed to create container {name}: {reason}")]
    CreationFailed { name: String, reason: String },

    #[error("Failed to wire container {name} to network {network}: {reason}")]
    Network {
        name: String,
        network: String,
        reason: String,
    },

    #[error("Failed to start container {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Error while waiting for container {name}: {reason}")]
    Wait { name: String, reason: String },

    #[error("Failed to read logs of container {name}: {reason}")]
    Logs { name: String, reason: String },
}

/// Errors raised while pushing frames to a log subscriber.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Subscriber connection closed")]
    Closed,

    #[error("Failed to send frame: {0}")]
    SendFailed(String),
}
