//! In-memory registry of tracked jobs.
//!
//! A job is present from the moment it is queued until it reaches a terminal
//! state or is cancelled. Executors, cancellation requests and log followers
//! all go through the same lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::job::{Job, JobId};

/// Shared map from job id to the live job.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, Arc<Job>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job, replacing any previous entry for the same id.
    pub async fn put(&self, job: Arc<Job>) {
        self.jobs.write().await.insert(job.id().clone(), job);
    }

    pub async fn get(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Evict a job. Returns the evicted entry, if it was still tracked.
    pub async fn remove(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobs.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
