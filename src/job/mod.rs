//! Jobs: identity, on-disk workspace, configuration, and the status lifecycle.
//!
//! ```text
//!   created ──▶ prepared ──▶ running ──▶ finished
//!      │           │  │         │  │
//!      │           │  └─────────┼──┴──▶ failed
//!      └───────────┼────────────┼─────▶ failed
//!                  └────────────┴─────▶ canceled
//! ```
//!
//! `finished`, `canceled` and `failed` are terminal. `unknown` is only ever
//! reported for identities nobody knows about; it is never stored.

pub mod transform;
pub mod workdir;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::JobError;

pub use transform::{PRE_TRANSFORM_FILE, RotationParams, write_pre_transform};
pub use workdir::{JobDir, Workspace};

/// Length of generated job identities.
pub const JOB_ID_LEN: usize = 12;

/// Longest identity accepted from clients.
const MAX_JOB_ID_LEN: usize = 64;

/// Prefix of every worker container name.
pub const CONTAINER_PREFIX: &str = "regpool-worker-";

/// Opaque job identity. Also the directory name and container name suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Draw a fresh identity from `[A-Za-z0-9]`.
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(JOB_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Validate an identity received from a client.
    ///
    /// Only ASCII alphanumerics are accepted, so an id can always be used
    /// as a single path segment under the workspace root.
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_JOB_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_alphanumeric());
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(JobError::InvalidId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic container name for this job.
    pub fn container_name(&self) -> String {
        format!("{}{}", CONTAINER_PREFIX, self.0)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        JobId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Prepared,
    Running,
    Finished,
    Canceled,
    Failed,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// No transition ever leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }

    /// Whether the lifecycle has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Prepared)
                | (Created, Failed)
                | (Prepared, Running)
                | (Prepared, Canceled)
                | (Prepared, Failed)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "prepared" => Ok(Self::Prepared),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "failed" => Ok(Self::Failed),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Declarative job parameters, serialized to `config.json` before execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Path of the uploaded input volume.
    pub moving_image: String,
    /// File name of the generated pre-transform, relative to the workdir.
    /// Empty when no pre-transform applies.
    #[serde(default)]
    pub pre_transform: String,
}

/// Mutable part of a job, guarded by the job's lock.
#[derive(Debug, Clone)]
pub struct JobState {
    pub status: JobStatus,
    /// Last diagnostic; only set on failure paths.
    pub last_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A unit of containerized work.
///
/// Identity, workdir and config are fixed at construction; the status only
/// moves through [`Job::transition`] so the lifecycle edges hold no matter
/// which task (executor, cancellation) drives it.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    workdir: PathBuf,
    config: JobConfig,
    state: RwLock<JobState>,
}

impl Job {
    pub fn new(dir: JobDir, config: JobConfig) -> Self {
        Self {
            id: dir.id,
            workdir: dir.path,
            config,
            state: RwLock::new(JobState {
                status: JobStatus::Created,
                last_message: None,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
            }),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn container_name(&self) -> String {
        self.id.container_name()
    }

    pub async fn status(&self) -> JobStatus {
        self.state.read().await.status
    }

    /// Copy of the current mutable state.
    pub async fn snapshot(&self) -> JobState {
        self.state.read().await.clone()
    }

    /// Move to `next` if the lifecycle allows it. Returns the previous status.
    pub async fn transition(&self, next: JobStatus) -> Result<JobStatus, JobError> {
        let mut state = self.state.write().await;
        let previous = state.status;
        Self::apply(&self.id, &mut state, next)?;
        Ok(previous)
    }

    /// Move to `failed` and record the diagnostic.
    pub async fn fail(&self, message: impl Into<String>) -> Result<JobStatus, JobError> {
        let mut state = self.state.write().await;
        let previous = state.status;
        Self::apply(&self.id, &mut state, JobStatus::Failed)?;
        state.last_message = Some(message.into());
        Ok(previous)
    }

    /// Serialize the config into the workdir and mark the job `prepared`.
    ///
    /// On any error the job is marked `failed` with a diagnostic.
    pub async fn prepare(&self) -> Result<(), JobError> {
        let reason = match serde_json::to_vec_pretty(&self.config) {
            Ok(bytes) => match tokio::fs::write(self.workdir.join(workdir::CONFIG_FILE), bytes).await
            {
                Ok(()) => None,
                Err(e) => Some(format!("Error writing config file: {}", e)),
            },
            Err(e) => Some(format!("Error generating config file: {}", e)),
        };

        match reason {
            None => {
                self.transition(JobStatus::Prepared).await?;
                Ok(())
            }
            Some(reason) => {
                tracing::warn!(job_id = %self.id, %reason, "Job preparation failed");
                let _ = self.fail(reason.clone()).await;
                Err(JobError::Preparation {
                    job_id: self.id.clone(),
                    reason,
                })
            }
        }
    }

    fn apply(id: &JobId, state: &mut JobState, next: JobStatus) -> Result<(), JobError> {
        if !state.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: id.clone(),
                from: state.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            state.started_at = Some(now);
        }
        if next.is_terminal() {
            state.ended_at = Some(now);
        }
        state.status = next;
        Ok(())
    }
}
