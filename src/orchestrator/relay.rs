//! Live log relay from a job container to a remote subscriber.
//!
//! The relay is transport-agnostic: it emits [`RelayFrame`]s into a
//! [`RelaySink`]. The HTTP layer adapts a WebSocket to that trait.
//!
//! Protocol, by job status when the subscriber connects:
//!
//! - terminal or untracked: one informational line, then close;
//! - `prepared`: a waiting notice, then a heartbeat per poll until the job
//!   leaves `prepared`, then continue with the new status;
//! - `running`: follow the container output in bounded frames until end of
//!   stream, then close.
//!
//! The relay only reads the job. Whatever happens to the subscriber has no
//! effect on the job's lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::job::{Job, JobId, JobStatus};
use crate::orchestrator::runtime::ContainerRuntime;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Largest payload pushed in one frame, in bytes.
    pub chunk_size: usize,
    /// Poll interval while the job waits in the queue.
    pub heartbeat_interval: Duration,
    /// How long the transport waits for the peer after a close frame.
    pub close_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            heartbeat_interval: Duration::from_secs(2),
            close_grace: Duration::from_secs(5),
        }
    }
}

/// A message for the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    /// Protocol-level close.
    Close,
}

/// Destination of relay frames.
#[async_trait]
pub trait RelaySink: Send {
    async fn send(&mut self, frame: RelayFrame) -> Result<(), RelayError>;
}

#[async_trait]
impl RelaySink for mpsc::Sender<RelayFrame> {
    async fn send(&mut self, frame: RelayFrame) -> Result<(), RelayError> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| RelayError::Closed)
    }
}

/// What the subscriber asked to follow.
#[derive(Debug, Clone)]
pub enum RelayTarget {
    /// Still in the registry.
    Tracked(Arc<Job>),
    /// Known only from its on-disk marker.
    Untracked { job_id: JobId, status: JobStatus },
}

impl RelayTarget {
    fn job_id(&self) -> &JobId {
        match self {
            Self::Tracked(job) => job.id(),
            Self::Untracked { job_id, .. } => job_id,
        }
    }
}

/// How a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Everything was delivered and a close frame was sent.
    Completed,
    /// The subscriber went away.
    Disconnected,
    /// Pushing a frame failed; the connection is considered dead.
    WriteFailed,
    /// The container log stream broke.
    ReadFailed,
}

/// Streams container output to subscribers.
pub struct LogRelay {
    runtime: Arc<dyn ContainerRuntime>,
    config: RelayConfig,
}

impl LogRelay {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RelayConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run one relay session.
    ///
    /// The session is abandoned as soon as `disconnected` resolves, which
    /// bounds the waiting loop by the subscriber's lifetime.
    pub async fn run<S, D>(
        &self,
        target: RelayTarget,
        sink: &mut S,
        disconnected: D,
    ) -> RelayOutcome
    where
        S: RelaySink,
        D: Future<Output = ()> + Send,
    {
        let job_id = target.job_id().clone();
        let outcome = tokio::select! {
            outcome = self.relay(target, sink) => outcome,
            _ = disconnected => RelayOutcome::Disconnected,
        };
        tracing::debug!(job_id = %job_id, outcome = ?outcome, "Log relay ended");
        outcome
    }

    async fn relay<S: RelaySink>(&self, target: RelayTarget, sink: &mut S) -> RelayOutcome {
        let job = match target {
            RelayTarget::Untracked { status, .. } if status.is_terminal() => {
                return self.notice_and_close(sink, format!("Job already {}\n", status)).await;
            }
            RelayTarget::Untracked { status, .. } => {
                return self.notice_and_close(sink, format!("Job is {}\n", status)).await;
            }
            RelayTarget::Tracked(job) => job,
        };

        let mut status = job.status().await;
        if status.is_terminal() {
            return self.notice_and_close(sink, format!("Job already {}\n", status)).await;
        }

        if status == JobStatus::Prepared {
            if let Err(outcome) = send(sink, job.id(), "Job not yet started...\n").await {
                return outcome;
            }
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            while status == JobStatus::Prepared {
                ticker.tick().await;
                if let Err(outcome) = send(sink, job.id(), "warming-up...\n").await {
                    return outcome;
                }
                status = job.status().await;
            }
            if let Err(outcome) = send(sink, job.id(), &format!("Job is now {}\n", status)).await {
                return outcome;
            }
        }

        if status != JobStatus::Running {
            return close(sink, job.id()).await;
        }

        let Some(mut stream) = self.runtime.follow_logs(&job.container_name()).await else {
            return self
                .notice_and_close(sink, "Log stream unavailable\n".to_string())
                .await;
        };
        tracing::debug!(job_id = %job.id(), "Following container logs");

        let mut carry = Utf8Carry::default();
        while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(job_id = %job.id(), error = %e, "Could not read logs");
                    let _ = close(sink, job.id()).await;
                    return RelayOutcome::ReadFailed;
                }
            };
            let mut rest: &[u8] = &bytes;
            while !rest.is_empty() {
                // Leave room for bytes carried over from the previous frame.
                let room = self
                    .config
                    .chunk_size
                    .saturating_sub(carry.pending_len())
                    .max(1);
                let (head, tail) = rest.split_at(room.min(rest.len()));
                rest = tail;
                let text = carry.push(head);
                if text.is_empty() {
                    continue;
                }
                if let Err(outcome) = send(sink, job.id(), &text).await {
                    return outcome;
                }
            }
        }

        let tail = carry.finish();
        if !tail.is_empty()
            && let Err(outcome) = send(sink, job.id(), &tail).await
        {
            return outcome;
        }
        tracing::debug!(job_id = %job.id(), "End of log stream");
        close(sink, job.id()).await
    }

    async fn notice_and_close<S: RelaySink>(&self, sink: &mut S, message: String) -> RelayOutcome {
        if let Err(e) = sink.send(RelayFrame::Text(message)).await {
            tracing::warn!(error = %e, "Could not send notice to log subscriber");
            return RelayOutcome::WriteFailed;
        }
        match sink.send(RelayFrame::Close).await {
            Ok(()) => RelayOutcome::Completed,
            Err(_) => RelayOutcome::WriteFailed,
        }
    }
}

async fn send<S: RelaySink>(sink: &mut S, job_id: &JobId, text: &str) -> Result<(), RelayOutcome> {
    sink.send(RelayFrame::Text(text.to_string()))
        .await
        .map_err(|e| {
            tracing::warn!(job_id = %job_id, error = %e, "Could not write to log subscriber");
            RelayOutcome::WriteFailed
        })
}

async fn close<S: RelaySink>(sink: &mut S, job_id: &JobId) -> RelayOutcome {
    match sink.send(RelayFrame::Close).await {
        Ok(()) => RelayOutcome::Completed,
        Err(e) => {
            tracing::debug!(job_id = %job_id, error = %e, "Close frame not delivered");
            RelayOutcome::WriteFailed
        }
    }
}

/// Turns arbitrary byte chunks into text frames without splitting a UTF-8
/// sequence across two frames.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Longest possible incomplete UTF-8 suffix.
    const MAX_PARTIAL: usize = 3;

    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = match std::str::from_utf8(&self.pending) {
            Ok(_) => 0,
            Err(e) if e.error_len().is_none() => self.pending.len() - e.valid_up_to(),
            Err(_) => incomplete_suffix(&self.pending),
        };
        let split = self.pending.len() - keep.min(Self::MAX_PARTIAL);
        let rest = self.pending.split_off(split);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence (0 if none).
fn incomplete_suffix(bytes: &[u8]) -> usize {
    for back in 1..=Utf8Carry::MAX_PARTIAL.min(bytes.len()) {
        let b = bytes[bytes.len() - back];
        if b & 0b1100_0000 != 0b1000_0000 {
            let needed = match b {
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF7 => 4,
                _ => return 0,
            };
            return if needed > back { back } else { 0 };
        }
    }
    0
}
