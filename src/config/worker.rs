use std::path::Path;
use std::time::Duration;

use crate::config::helpers::{parse_optional_env, require_env};
use crate::error::ConfigError;
use crate::orchestrator::ContainerTemplate;

/// Worker container configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub image: String,
    /// Volume (or host path) mounted at the workspace root inside workers.
    pub volume: String,
    /// Private network workers join.
    pub network: String,
    /// Grace period before a stopped container is killed.
    pub stop_timeout_secs: u64,
}

impl WorkerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            image: require_env(
                "REGPOOL_WORKER_IMAGE",
                "Set it to the registration worker image, e.g. regpool-worker:latest",
            )?,
            volume: require_env(
                "REGPOOL_WORK_VOL",
                "Set it to the volume or host path holding the workspace",
            )?,
            network: require_env(
                "REGPOOL_PRIVATE_NET",
                "Set it to the Docker network worker containers attach to",
            )?,
            stop_timeout_secs: parse_optional_env("REGPOOL_STOP_TIMEOUT_SECS", 10)?,
        })
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Template mounting the volume at `workspace_root`.
    pub fn container_template(&self, workspace_root: &Path) -> ContainerTemplate {
        ContainerTemplate {
            image: self.image.clone(),
            volume: self.volume.clone(),
            mount_target: workspace_root.to_path_buf(),
            network: self.network.clone(),
        }
    }
}
