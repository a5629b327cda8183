//! Bounded worker pool.
//!
//! Submissions are unlimited; execution is not. `submit` hands job ids to an
//! unbounded intake, and a single forwarder moves them, in order, into a
//! bounded admission queue. N executors drain that queue, each running one
//! container at a time:
//!
//! ```text
//!  submit ──▶ intake (unbounded) ──▶ forwarder ──▶ admission queue (bounded)
//!                                                      │
//!                          ┌───────────────┬───────────┴───┐
//!                          ▼               ▼               ▼
//!                      executor 0      executor 1  …   executor N-1
//!                          │
//!                          └─▶ ContainerRuntime::run ─▶ terminal status ─▶ evict
//! ```
//!
//! The registry is checked at dequeue time, so a job cancelled while still
//! queued is simply skipped. A cancellation that lands after dequeue marks
//! the job `canceled` first and then stops the container; the executor
//! leaves a canceled job alone when the run ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{JobError, RuntimeError};
use crate::job::workdir::write_marker;
use crate::job::{Job, JobId, JobStatus, Workspace};
use crate::orchestrator::registry::JobRegistry;
use crate::orchestrator::runtime::{ContainerExit, ContainerRuntime, ContainerTemplate};

/// Worker pool sizing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of containers running at once (at least 1).
    pub max_workers: usize,
    /// Admission queue capacity; raised to `max_workers` if smaller.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            queue_capacity: 1,
        }
    }
}

impl SchedulerConfig {
    fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    fn capacity(&self) -> usize {
        self.queue_capacity.max(self.workers())
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    fn bare(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            message: None,
            created_at: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// State shared by the scheduler handle and its executors.
struct Shared {
    registry: JobRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    workspace: Workspace,
    template: ContainerTemplate,
    /// Ids handed to the intake but not yet dequeued by an executor.
    queued: AtomicUsize,
}

impl Shared {
    /// Persist a terminal status so it survives eviction from the registry.
    async fn persist_terminal(&self, job: &Job) {
        let status = job.status().await;
        if !status.is_terminal() {
            return;
        }
        if let Err(e) = write_marker(job.workdir(), status).await {
            tracing::warn!(job_id = %job.id(), error = %e, "Failed to write status marker");
        }
    }
}

/// The bounded worker pool.
pub struct Scheduler {
    shared: Arc<Shared>,
    intake: mpsc::UnboundedSender<JobId>,
    executors: Vec<JoinHandle<()>>,
    forwarder: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the forwarder and `max_workers` executors.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        workspace: Workspace,
        template: ContainerTemplate,
    ) -> Self {
        let workers = config.workers();
        let (intake, mut intake_rx) = mpsc::unbounded_channel::<JobId>();
        let (queue_tx, queue_rx) = mpsc::channel::<JobId>(config.capacity());

        let shared = Arc::new(Shared {
            registry: JobRegistry::new(),
            runtime,
            workspace,
            template,
            queued: AtomicUsize::new(0),
        });

        // The only blocking enqueue happens here, off every request path.
        let forwarder = tokio::spawn(async move {
            while let Some(id) = intake_rx.recv().await {
                if queue_tx.send(id).await.is_err() {
                    break;
                }
            }
        });

        let queue = Arc::new(Mutex::new(queue_rx));
        let executors = (0..workers)
            .map(|index| {
                let executor = Executor {
                    index,
                    shared: Arc::clone(&shared),
                    queue: Arc::clone(&queue),
                };
                tokio::spawn(executor.run())
            })
            .collect();

        tracing::info!(
            workers,
            queue_capacity = config.capacity(),
            "Scheduler started"
        );

        Self {
            shared,
            intake,
            executors,
            forwarder,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.shared.registry
    }

    pub fn workspace(&self) -> &Workspace {
        &self.shared.workspace
    }

    /// Number of submitted jobs not yet picked up by an executor.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Prepare a job and queue it for execution.
    ///
    /// Never waits for queue space. A preparation failure leaves the job
    /// `failed` (with its marker updated) and it is not queued.
    pub async fn submit(&self, job: Job) -> Result<Arc<Job>, JobError> {
        let job = Arc::new(job);

        if let Err(e) = job.prepare().await {
            self.shared.persist_terminal(&job).await;
            return Err(e);
        }

        self.shared.registry.put(Arc::clone(&job)).await;
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self.intake.send(job.id().clone()).is_err() {
            // Only possible once the forwarder is gone, i.e. during shutdown.
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            self.shared.registry.remove(job.id()).await;
            let reason = "scheduler is shutting down".to_string();
            let _ = job.fail(reason.clone()).await;
            self.shared.persist_terminal(&job).await;
            return Err(JobError::Preparation {
                job_id: job.id().clone(),
                reason,
            });
        }

        tracing::info!(job_id = %job.id(), "Job queued");
        Ok(job)
    }

    /// Cancel a tracked job. Unknown or already finished ids are a no-op.
    ///
    /// The job is marked `canceled` before its container is stopped, so the
    /// exit caused by the stop can no longer settle it as `failed`.
    pub async fn cancel(&self, id: &JobId) {
        let Some(job) = self.shared.registry.get(id).await else {
            tracing::debug!(job_id = %id, "Cancel ignored, job not tracked");
            return;
        };

        match job.transition(JobStatus::Canceled).await {
            Ok(previous) => {
                tracing::info!(job_id = %id, from = %previous, "Job canceled");
                self.shared.persist_terminal(&job).await;
                // A container that starts after this point is stopped by its
                // executor instead.
                if let Err(e) = self.shared.runtime.stop_and_remove(&job.container_name()).await {
                    tracing::warn!(job_id = %id, error = %e, "Container cleanup failed during cancel");
                }
            }
            Err(e) => tracing::debug!(job_id = %id, error = %e, "Job already settled"),
        }

        self.shared.registry.remove(id).await;
    }

    /// Live job, if still tracked.
    pub async fn get(&self, id: &JobId) -> Option<Arc<Job>> {
        self.shared.registry.get(id).await
    }

    /// Status from memory first, then from the on-disk marker.
    pub async fn status(&self, id: &JobId) -> StatusReport {
        if let Some(job) = self.shared.registry.get(id).await {
            let state = job.snapshot().await;
            return StatusReport {
                job_id: id.clone(),
                status: state.status,
                message: state.last_message,
                created_at: Some(state.created_at),
                started_at: state.started_at,
                ended_at: state.ended_at,
            };
        }
        let status = self.shared.workspace.read_marker(id).await;
        StatusReport::bare(id.clone(), status)
    }

    /// Stop accepting work and wait for executors to drain the queue.
    pub async fn shutdown(self) {
        let Self {
            intake,
            executors,
            forwarder,
            ..
        } = self;
        drop(intake);
        let _ = forwarder.await;
        for handle in executors {
            let _ = handle.await;
        }
        tracing::info!("Scheduler stopped");
    }
}

/// One of the persistent pool workers.
struct Executor {
    index: usize,
    shared: Arc<Shared>,
    queue: Arc<Mutex<mpsc::Receiver<JobId>>>,
}

impl Executor {
    async fn run(self) {
        loop {
            let next = { self.queue.lock().await.recv().await };
            let Some(id) = next else {
                break;
            };
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);

            let Some(job) = self.shared.registry.get(&id).await else {
                tracing::debug!(executor = self.index, job_id = %id, "Skipping job removed before execution");
                continue;
            };

            self.execute(&job).await;
            self.shared.persist_terminal(&job).await;
            self.shared.registry.remove(&id).await;
        }
        tracing::debug!(executor = self.index, "Executor exiting, queue closed");
    }

    async fn execute(&self, job: &Arc<Job>) {
        let spec = self.shared.template.for_job(job);
        tracing::info!(executor = self.index, job_id = %job.id(), container = %spec.name, "Executing job");

        let (started_tx, mut started_rx) = oneshot::channel();
        let run = self.shared.runtime.run(&spec, started_tx);
        tokio::pin!(run);

        let mut start_seen = false;
        let outcome = loop {
            tokio::select! {
                biased;
                signal = &mut started_rx, if !start_seen => {
                    start_seen = true;
                    if signal.is_ok() {
                        self.on_started(job).await;
                    }
                }
                outcome = &mut run => break outcome,
            }
        };
        if !start_seen && started_rx.try_recv().is_ok() {
            self.on_started(job).await;
        }

        self.settle(job, outcome).await;
    }

    async fn on_started(&self, job: &Job) {
        match job.transition(JobStatus::Running).await {
            Ok(_) => tracing::info!(job_id = %job.id(), "Job running"),
            Err(e) => {
                // Cancelled between dequeue and container start: the cancel
                // found nothing to stop, so stop it here.
                tracing::info!(job_id = %job.id(), error = %e, "Job settled before start, stopping container");
                if let Err(e) = self.shared.runtime.stop_and_remove(&job.container_name()).await {
                    tracing::warn!(job_id = %job.id(), error = %e, "Failed to stop late-started container");
                }
            }
        }
    }

    async fn settle(&self, job: &Job, outcome: Result<ContainerExit, RuntimeError>) {
        let result = match outcome {
            Ok(_) if job.status().await == JobStatus::Prepared => {
                job.fail("container exited before its start was confirmed")
                    .await
            }
            Ok(exit) if exit.success() => job.transition(JobStatus::Finished).await,
            Ok(exit) => {
                job.fail(format!("container exited with status {}", exit.status_code))
                    .await
            }
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Container run failed");
                job.fail(e.to_string()).await
            }
        };

        match result {
            Ok(_) => {
                let state = job.snapshot().await;
                tracing::info!(
                    job_id = %job.id(),
                    status = %state.status,
                    message = ?state.last_message,
                    "Job settled"
                );
            }
            Err(e) => tracing::debug!(job_id = %job.id(), error = %e, "Outcome ignored, job already settled"),
        }
    }
}
