//! Contract between the scheduler and a container engine.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

use crate::error::RuntimeError;
use crate::job::Job;

/// Live, appendable stream of combined stdout/stderr output.
pub type LogStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

/// Deployment-wide settings every worker container shares.
#[derive(Debug, Clone)]
pub struct ContainerTemplate {
    /// Image the worker containers are created from.
    pub image: String,
    /// Volume (or host path) holding the workspace root.
    pub volume: String,
    /// Where the volume is mounted inside the container. Matches the
    /// workspace root so job paths resolve identically on both sides.
    pub mount_target: PathBuf,
    /// Private network jobs are attached to, instead of the default bridge.
    pub network: String,
}

impl ContainerTemplate {
    /// Spec for one job's container.
    pub fn for_job(&self, job: &Job) -> ContainerSpec {
        ContainerSpec {
            name: job.container_name(),
            image: self.image.clone(),
            volume: self.volume.clone(),
            mount_target: self.mount_target.clone(),
            network: self.network.clone(),
            working_dir: job.workdir().to_path_buf(),
        }
    }
}

/// Everything needed to run one job's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub volume: String,
    pub mount_target: PathBuf,
    pub network: String,
    pub working_dir: PathBuf,
}

impl ContainerSpec {
    /// Bind string in engine syntax: `<volume>:<target>:rw`.
    pub fn bind(&self) -> String {
        format!("{}:{}:rw", self.volume, self.mount_target.display())
    }
}

/// How a container ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerExit {
    pub status_code: i64,
}

impl ContainerExit {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// A container engine able to run, stop and tail job containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create, wire, attach and start the container, then block until it stops.
    ///
    /// `started` is signalled exactly once, right after the engine confirms
    /// the start. If creation, network wiring or start fails, it is dropped
    /// without being signalled and the error is returned.
    async fn run(
        &self,
        spec: &ContainerSpec,
        started: oneshot::Sender<()>,
    ) -> Result<ContainerExit, RuntimeError>;

    /// Stop with a bounded grace period, then force removal.
    ///
    /// A container that no longer exists is a successful no-op. Stop and
    /// remove failures are logged, not returned.
    async fn stop_and_remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Follow the container's output, or `None` if it cannot be reached.
    async fn follow_logs(&self, name: &str) -> Option<LogStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_string() {
        let spec = ContainerSpec {
            name: "regpool-worker-x".to_string(),
            image: "worker:latest".to_string(),
            volume: "regpool_data".to_string(),
            mount_target: PathBuf::from("/datawd"),
            network: "regpool_private".to_string(),
            working_dir: PathBuf::from("/datawd/x"),
        };
        assert_eq!(spec.bind(), "regpool_data:/datawd:rw");
    }

    #[test]
    fn test_exit_success() {
        assert!(ContainerExit { status_code: 0 }.success());
        assert!(!ContainerExit { status_code: 137 }.success());
    }
}
