use std::path::PathBuf;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::orchestrator::SchedulerConfig;

/// Workspace root used when none (or an unusable one) is configured.
pub const DEFAULT_BASE_WORKDIR: &str = "/datawd";

/// Worker pool and workspace configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Root under which every job directory is allocated.
    pub base_workdir: PathBuf,
    /// Number of executors, i.e. the most containers running at once.
    pub max_workers: usize,
    /// Admission queue capacity.
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let base_workdir = match optional_env("REGPOOL_BASE_WORKDIR")? {
            Some(raw) => {
                let path = PathBuf::from(&raw);
                if path.is_dir() {
                    path
                } else {
                    tracing::warn!(
                        path = %raw,
                        fallback = DEFAULT_BASE_WORKDIR,
                        "REGPOOL_BASE_WORKDIR is not an existing directory, using default"
                    );
                    PathBuf::from(DEFAULT_BASE_WORKDIR)
                }
            }
            None => PathBuf::from(DEFAULT_BASE_WORKDIR),
        };

        let max_workers: usize = parse_optional_env("REGPOOL_WORKER_MAXNUM", 1)?;
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REGPOOL_WORKER_MAXNUM".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let queue_capacity = parse_optional_env("REGPOOL_QUEUE_CAPACITY", max_workers)?;

        Ok(Self {
            base_workdir,
            max_workers,
            queue_capacity: queue_capacity.max(max_workers),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers,
            queue_capacity: self.queue_capacity,
        }
    }
}
