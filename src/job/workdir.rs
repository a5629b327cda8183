//! On-disk job workspace.
//!
//! Every job owns one directory under the workspace root, named by its id:
//!
//! ```text
//! <root>/<job id>/
//!     <uploaded input>
//!     config.json            job configuration, written at preparation
//!     initialTransform.tfm   optional pre-transform
//!     STATUS                 first line = fallback status
//!     results/...            written by the worker image
//! ```
//!
//! The `STATUS` marker is written with `created` at allocation and again
//! when the job reaches a terminal state. It is only read for identities
//! that are no longer tracked in memory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::JobError;
use crate::job::{JobId, JobStatus};

pub const CONFIG_FILE: &str = "config.json";
pub const STATUS_FILE: &str = "STATUS";

/// Attempts before giving up on finding an unused id.
const ALLOCATE_ATTEMPTS: usize = 8;

/// A freshly allocated job directory.
#[derive(Debug, Clone)]
pub struct JobDir {
    pub id: JobId,
    pub path: PathBuf,
}

/// Root of all job directories.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a job with this id would live in (whether or not it exists).
    pub fn job_path(&self, id: &JobId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Create a new, exclusively owned job directory and mark it `created`.
    pub async fn allocate(&self) -> Result<JobDir, JobError> {
        for _ in 0..ALLOCATE_ATTEMPTS {
            let id = JobId::generate();
            let path = self.job_path(&id);
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    write_marker(&path, JobStatus::Created).await.map_err(|e| {
                        JobError::Workspace {
                            reason: format!("failed to write status marker for {}: {}", id, e),
                        }
                    })?;
                    tracing::debug!(job_id = %id, path = %path.display(), "Allocated job directory");
                    return Ok(JobDir { id, path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(job_id = %id, "Job id collision, drawing another");
                }
                Err(e) => {
                    return Err(JobError::Workspace {
                        reason: format!("failed to create {}: {}", path.display(), e),
                    });
                }
            }
        }
        Err(JobError::Workspace {
            reason: format!(
                "no free job id after {} attempts under {}",
                ALLOCATE_ATTEMPTS,
                self.root.display()
            ),
        })
    }

    /// Existing directory of a job, if any.
    pub async fn locate(&self, id: &JobId) -> Option<PathBuf> {
        let path = self.job_path(id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Some(path),
            _ => None,
        }
    }

    /// Fallback status from the on-disk marker.
    ///
    /// No directory means `unknown`. A directory whose marker is missing,
    /// unreadable or garbled can say no more than `created`.
    pub async fn read_marker(&self, id: &JobId) -> JobStatus {
        let Some(dir) = self.locate(id).await else {
            return JobStatus::Unknown;
        };
        match tokio::fs::read_to_string(dir.join(STATUS_FILE)).await {
            Ok(contents) => contents
                .lines()
                .next()
                .and_then(|line| line.parse::<JobStatus>().ok())
                .filter(|status| *status != JobStatus::Unknown)
                .unwrap_or(JobStatus::Created),
            Err(_) => JobStatus::Created,
        }
    }
}

/// Overwrite the status marker of a job directory.
pub async fn write_marker(dir: &Path, status: JobStatus) -> std::io::Result<()> {
    tokio::fs::write(dir.join(STATUS_FILE), format!("{}\n", status)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_creates_directory_with_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());

        let dir = ws.allocate().await.unwrap();
        assert!(dir.path.is_dir());
        assert_eq!(dir.path, tmp.path().join(dir.id.as_str()));

        let marker = std::fs::read_to_string(dir.path.join(STATUS_FILE)).unwrap();
        assert_eq!(marker.lines().next(), Some("created"));
        assert_eq!(ws.read_marker(&dir.id).await, JobStatus::Created);
    }

    #[tokio::test]
    async fn test_allocate_fails_without_root() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path().join("nope"));
        assert!(matches!(
            ws.allocate().await,
            Err(JobError::Workspace { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_marker_fallbacks() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());

        let absent = JobId::parse("doesnotexist").unwrap();
        assert_eq!(ws.read_marker(&absent).await, JobStatus::Unknown);

        let bare = JobId::parse("bare").unwrap();
        std::fs::create_dir(tmp.path().join("bare")).unwrap();
        assert_eq!(ws.read_marker(&bare).await, JobStatus::Created);

        std::fs::write(tmp.path().join("bare").join(STATUS_FILE), "stopping\n").unwrap();
        assert_eq!(ws.read_marker(&bare).await, JobStatus::Created);

        std::fs::write(tmp.path().join("bare").join(STATUS_FILE), "").unwrap();
        assert_eq!(ws.read_marker(&bare).await, JobStatus::Created);
    }

    #[tokio::test]
    async fn test_terminal_marker_is_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let dir = ws.allocate().await.unwrap();

        write_marker(&dir.path, JobStatus::Finished).await.unwrap();
        assert_eq!(ws.read_marker(&dir.id).await, JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_file_is_not_a_job_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        std::fs::write(tmp.path().join("plainfile"), "x").unwrap();

        let id = JobId::parse("plainfile").unwrap();
        assert!(ws.locate(&id).await.is_none());
        assert_eq!(ws.read_marker(&id).await, JobStatus::Unknown);
    }
}
