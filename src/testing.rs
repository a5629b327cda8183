//! Test doubles for the container runtime.
//!
//! [`StubRuntime`] stands in for Docker in unit and integration tests. It
//! records what the scheduler asks of it and lets a test decide when, and
//! how, each container ends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore, oneshot};

use crate::error::RuntimeError;
use crate::orchestrator::runtime::{ContainerExit, ContainerRuntime, ContainerSpec, LogStream};

/// Exit code reported for a container ended by `stop_and_remove`.
pub const STOPPED_EXIT_CODE: i64 = 137;

#[derive(Default)]
struct StubState {
    created: Vec<String>,
    stopped: Vec<String>,
    fail_create: HashSet<String>,
    exit_codes: HashMap<String, i64>,
    logs: HashMap<String, Vec<Bytes>>,
    stop_signals: HashMap<String, Arc<Notify>>,
}

/// Scriptable in-memory [`ContainerRuntime`].
///
/// By default every container exits 0 right after starting. A runtime built
/// with [`StubRuntime::holding`] keeps containers running until the test
/// calls [`StubRuntime::release`] or stops them.
pub struct StubRuntime {
    state: Mutex<StubState>,
    hold: bool,
    release: Semaphore,
    run_time: Duration,
    stop_delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    log_follows: AtomicUsize,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StubRuntime {
    /// Containers exit immediately with status 0.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            hold: false,
            release: Semaphore::new(0),
            run_time: Duration::ZERO,
            stop_delay: Duration::ZERO,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            log_follows: AtomicUsize::new(0),
        }
    }

    /// Containers run until released or stopped.
    pub fn holding() -> Self {
        Self {
            hold: true,
            ..Self::new()
        }
    }

    /// Containers run for `run_time` before exiting.
    pub fn with_run_time(run_time: Duration) -> Self {
        Self {
            run_time,
            ..Self::new()
        }
    }

    /// Keep `stop_and_remove` busy for `delay` after the container has
    /// exited, the way removal does on a real engine.
    pub fn with_stop_delay(self, delay: Duration) -> Self {
        Self {
            stop_delay: delay,
            ..self
        }
    }

    /// Let `n` held containers exit.
    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }

    /// Make creation of container `name` fail.
    pub fn fail_create(&self, name: &str) {
        self.lock().fail_create.insert(name.to_string());
    }

    /// Exit code for container `name` (default 0).
    pub fn set_exit_code(&self, name: &str, code: i64) {
        self.lock().exit_codes.insert(name.to_string(), code);
    }

    /// Output served by `follow_logs` for container `name`.
    pub fn set_logs(&self, name: &str, chunks: Vec<Bytes>) {
        self.lock().logs.insert(name.to_string(), chunks);
    }

    /// Names of containers `run` was asked to create, in order.
    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    /// Names passed to `stop_and_remove`, in order.
    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    /// Containers currently running.
    pub fn running(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Most containers ever running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of `follow_logs` calls.
    pub fn log_follows(&self) -> usize {
        self.log_follows.load(Ordering::SeqCst)
    }

    /// Poll until `running() == n`, panicking after `timeout`.
    pub async fn wait_for_running(&self, n: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.running() != n {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {} running containers, have {}",
                    n,
                    self.running()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop_signal(&self, name: &str) -> Arc<Notify> {
        Arc::clone(
            self.lock()
                .stop_signals
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn run(
        &self,
        spec: &ContainerSpec,
        started: oneshot::Sender<()>,
    ) -> Result<ContainerExit, RuntimeError> {
        let (failing, exit_code) = {
            let mut state = self.lock();
            state.created.push(spec.name.clone());
            (
                state.fail_create.contains(&spec.name),
                state.exit_codes.get(&spec.name).copied().unwrap_or(0),
            )
        };
        if failing {
            return Err(RuntimeError::CreationFailed {
                name: spec.name.clone(),
                reason: "scripted failure".to_string(),
            });
        }

        let stop = self.stop_signal(&spec.name);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _ = started.send(());

        let status_code = if self.hold {
            tokio::select! {
                permit = self.release.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    exit_code
                }
                _ = stop.notified() => STOPPED_EXIT_CODE,
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(self.run_time) => exit_code,
                _ = stop.notified() => STOPPED_EXIT_CODE,
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ContainerExit { status_code })
    }

    async fn stop_and_remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.lock().stopped.push(name.to_string());
        self.stop_signal(name).notify_one();
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        Ok(())
    }

    async fn follow_logs(&self, name: &str) -> Option<LogStream> {
        self.log_follows.fetch_add(1, Ordering::SeqCst);
        let chunks = self.lock().logs.get(name).cloned()?;
        Some(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}
