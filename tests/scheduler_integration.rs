//! Integration tests for the worker pool.
//!
//! Uses the in-crate stub runtime so no Docker daemon is needed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regpool::error::JobError;
use regpool::job::{Job, JobConfig, JobDir, JobId, JobStatus, Workspace};
use regpool::orchestrator::{ContainerTemplate, Scheduler, SchedulerConfig};
use regpool::testing::StubRuntime;

const WAIT: Duration = Duration::from_secs(5);

fn template(root: &Path) -> ContainerTemplate {
    ContainerTemplate {
        image: "worker:test".to_string(),
        volume: "regpool_data".to_string(),
        mount_target: root.to_path_buf(),
        network: "regpool_net".to_string(),
    }
}

fn start(root: &Path, runtime: Arc<StubRuntime>, workers: usize) -> Scheduler {
    Scheduler::start(
        SchedulerConfig {
            max_workers: workers,
            queue_capacity: workers,
        },
        runtime,
        Workspace::new(root),
        template(root),
    )
}

async fn new_job(workspace: &Workspace) -> Job {
    let dir = workspace.allocate().await.expect("allocate job dir");
    let moving_image = dir.path.join("input.nii.gz").display().to_string();
    Job::new(
        dir,
        JobConfig {
            moving_image,
            pre_transform: String::new(),
        },
    )
}

/// Poll the status report until it shows `expected`.
async fn wait_for_status(scheduler: &Scheduler, id: &JobId, expected: JobStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = scheduler.status(id).await.status;
        if status == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {} stuck in {}, expected {}", id, status, expected);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_until_untracked(scheduler: &Scheduler, id: &JobId) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while scheduler.get(id).await.is_some() {
        if tokio::time::Instant::now() >= deadline {
            panic!("job {} still tracked", id);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_pool_size() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::with_run_time(Duration::from_millis(20)));
    let scheduler = start(tmp.path(), runtime.clone(), 3);

    let mut ids = Vec::new();
    for _ in 0..10 {
        let job = scheduler
            .submit(new_job(scheduler.workspace()).await)
            .await
            .unwrap();
        ids.push(job.id().clone());
    }

    for id in &ids {
        wait_for_status(&scheduler, id, JobStatus::Finished).await;
    }

    assert_eq!(runtime.created().len(), 10);
    assert!(runtime.peak() <= 3, "peak concurrency was {}", runtime.peak());
    assert!(runtime.peak() >= 2, "pool never ran jobs in parallel");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn single_worker_runs_jobs_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::holding());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let a = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();
    let b = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();

    runtime.wait_for_running(1, WAIT).await;
    wait_for_status(&scheduler, a.id(), JobStatus::Running).await;
    assert_eq!(b.status().await, JobStatus::Prepared);
    assert_eq!(runtime.created(), vec![a.container_name()]);

    runtime.release(1);
    wait_for_status(&scheduler, a.id(), JobStatus::Finished).await;
    wait_for_status(&scheduler, b.id(), JobStatus::Running).await;
    assert_eq!(runtime.created(), vec![a.container_name(), b.container_name()]);

    runtime.release(1);
    wait_for_status(&scheduler, b.id(), JobStatus::Finished).await;
    assert_eq!(runtime.peak(), 1);
}

#[tokio::test]
async fn canceled_queued_job_is_never_started() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::holding());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let a = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();
    let b = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();
    runtime.wait_for_running(1, WAIT).await;

    scheduler.cancel(b.id()).await;
    assert_eq!(b.status().await, JobStatus::Canceled);
    assert!(scheduler.get(b.id()).await.is_none());

    runtime.release(1);
    wait_for_status(&scheduler, a.id(), JobStatus::Finished).await;
    wait_until_untracked(&scheduler, a.id()).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    while scheduler.queued() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!runtime.created().contains(&b.container_name()));
    assert_eq!(scheduler.status(b.id()).await.status, JobStatus::Canceled);
}

#[tokio::test]
async fn creation_failure_fails_job_and_pool_moves_on() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::new());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let a = new_job(scheduler.workspace()).await;
    runtime.fail_create(&a.container_name());
    let a = scheduler.submit(a).await.unwrap();
    let b = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();

    wait_for_status(&scheduler, b.id(), JobStatus::Finished).await;

    let state = a.snapshot().await;
    assert_eq!(state.status, JobStatus::Failed);
    let message = state.last_message.expect("failure message");
    assert!(message.contains("scripted failure"), "message: {}", message);
    assert!(state.started_at.is_none());
    assert_eq!(scheduler.status(a.id()).await.status, JobStatus::Failed);
}

#[tokio::test]
async fn nonzero_exit_fails_job() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::new());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let job = new_job(scheduler.workspace()).await;
    runtime.set_exit_code(&job.container_name(), 2);
    let job = scheduler.submit(job).await.unwrap();

    wait_for_status(&scheduler, job.id(), JobStatus::Failed).await;
    assert_eq!(
        job.snapshot().await.last_message.as_deref(),
        Some("container exited with status 2")
    );
}

#[tokio::test]
async fn canceling_running_job_stops_its_container() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::holding());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let job = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();
    wait_for_status(&scheduler, job.id(), JobStatus::Running).await;

    scheduler.cancel(job.id()).await;

    assert!(runtime.stopped().contains(&job.container_name()));
    runtime.wait_for_running(0, WAIT).await;
    // The container's exit after the stop must not overwrite the cancel.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let state = job.snapshot().await;
    assert_eq!(state.status, JobStatus::Canceled);
    assert!(state.last_message.is_none());
    assert_eq!(scheduler.status(job.id()).await.status, JobStatus::Canceled);
}

#[tokio::test]
async fn cancel_wins_over_exit_caused_by_the_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::holding().with_stop_delay(Duration::from_millis(50)));
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let job = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();
    wait_for_status(&scheduler, job.id(), JobStatus::Running).await;

    // The container exits while the stop call is still busy removing it.
    scheduler.cancel(job.id()).await;
    runtime.wait_for_running(0, WAIT).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let state = job.snapshot().await;
    assert_eq!(state.status, JobStatus::Canceled);
    assert!(state.last_message.is_none(), "message: {:?}", state.last_message);
    assert_eq!(scheduler.status(job.id()).await.status, JobStatus::Canceled);
    let marker = std::fs::read_to_string(job.workdir().join("STATUS")).unwrap();
    assert_eq!(marker.lines().next(), Some("canceled"));
}

#[tokio::test]
async fn cancel_is_idempotent_and_ignores_unknown_ids() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::new());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    scheduler.cancel(&JobId::parse("neverSubmitted").unwrap()).await;
    assert!(runtime.stopped().is_empty());

    let job = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();
    wait_for_status(&scheduler, job.id(), JobStatus::Finished).await;
    wait_until_untracked(&scheduler, job.id()).await;

    scheduler.cancel(job.id()).await;
    scheduler.cancel(job.id()).await;
    assert_eq!(job.status().await, JobStatus::Finished);
    assert!(runtime.stopped().is_empty());
}

#[tokio::test]
async fn status_falls_back_to_marker_after_eviction() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::new());
    let scheduler = start(tmp.path(), runtime, 1);

    let job = scheduler
        .submit(new_job(scheduler.workspace()).await)
        .await
        .unwrap();
    wait_until_untracked(&scheduler, job.id()).await;

    let report = scheduler.status(job.id()).await;
    assert_eq!(report.status, JobStatus::Finished);
    assert!(report.started_at.is_none());

    let marker = std::fs::read_to_string(job.workdir().join("STATUS")).unwrap();
    assert_eq!(marker.lines().next(), Some("finished"));

    let stranger = JobId::parse("notajob").unwrap();
    assert_eq!(scheduler.status(&stranger).await.status, JobStatus::Unknown);
}

#[tokio::test]
async fn preparation_failure_is_not_queued() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::new());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let job = Job::new(
        JobDir {
            id: JobId::parse("orphan").unwrap(),
            path: tmp.path().join("orphan"),
        },
        JobConfig::default(),
    );

    let err = scheduler.submit(job).await.unwrap_err();
    assert!(matches!(err, JobError::Preparation { .. }));
    assert!(scheduler.registry().is_empty().await);
    assert_eq!(scheduler.queued(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn submit_never_blocks_on_full_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(StubRuntime::holding());
    let scheduler = start(tmp.path(), runtime.clone(), 1);

    let mut ids = Vec::new();
    for _ in 0..8 {
        let job = new_job(scheduler.workspace()).await;
        let job = tokio::time::timeout(Duration::from_millis(500), scheduler.submit(job))
            .await
            .expect("submit should not wait for queue space")
            .unwrap();
        ids.push(job.id().clone());
    }

    runtime.release(8);
    for id in &ids {
        wait_for_status(&scheduler, id, JobStatus::Finished).await;
    }

    let expected: Vec<String> = ids.iter().map(JobId::container_name).collect();
    assert_eq!(runtime.created(), expected);
}
