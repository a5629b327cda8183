//! Docker implementation of [`ContainerRuntime`], via the local Engine API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{ConnectNetworkOptions, DisconnectNetworkOptions};
use futures::StreamExt;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::RuntimeError;
use crate::orchestrator::runtime::{ContainerExit, ContainerRuntime, ContainerSpec, LogStream};

/// Network every new container joins unless told otherwise.
const DEFAULT_NETWORK: &str = "bridge";

/// Buffered log chunks between the engine and a slow follower.
const LOG_BUFFER: usize = 64;

/// Tracing target for output captured from job containers.
const CONTAINER_LOG_TARGET: &str = "regpool::container";

/// Connect to the local Docker daemon (socket or named pipe, `DOCKER_HOST` aware).
pub async fn connect_docker() -> Result<Docker, RuntimeError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Connection {
        reason: e.to_string(),
    })?;
    docker.ping().await.map_err(|e| RuntimeError::Connection {
        reason: format!("daemon did not answer ping: {}", e),
    })?;
    Ok(docker)
}

/// Runs job containers on the local Docker daemon.
pub struct DockerRuntime {
    stop_timeout: Duration,
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            stop_timeout,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Reuse an existing connection.
    pub fn with_client(docker: Docker, stop_timeout: Duration) -> Self {
        Self {
            stop_timeout,
            docker: Arc::new(RwLock::new(Some(docker))),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<Docker, RuntimeError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = connect_docker().await?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    /// Create the container, move it onto the private network and attach to
    /// its output. Returns the container id.
    async fn provision(
        &self,
        docker: &Docker,
        spec: &ContainerSpec,
    ) -> Result<String, RuntimeError> {
        if let Err(e) = docker.inspect_image(&spec.image).await {
            // Creation below fails with the authoritative error; this only
            // makes a missing image obvious in the logs.
            tracing::warn!(image = %spec.image, error = %e, "Worker image not found locally");
        }

        let config = Config {
            image: Some(spec.image.clone()),
            tty: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(spec.working_dir.display().to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![spec.bind()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::CreationFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;
        let container_id = response.id;
        tracing::debug!(container = %spec.name, id = %container_id, "Container created");

        docker
            .disconnect_network(
                DEFAULT_NETWORK,
                DisconnectNetworkOptions {
                    container: container_id.clone(),
                    force: true,
                },
            )
            .await
            .map_err(|e| RuntimeError::Network {
                name: spec.name.clone(),
                network: DEFAULT_NETWORK.to_string(),
                reason: format!("detach failed: {}", e),
            })?;

        docker
            .connect_network(
                &spec.network,
                ConnectNetworkOptions {
                    container: container_id.clone(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
            .map_err(|e| RuntimeError::Network {
                name: spec.name.clone(),
                network: spec.network.clone(),
                reason: format!("attach failed: {}", e),
            })?;

        // Attach before start so the earliest output is not lost.
        let AttachContainerResults { output, .. } = docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::StartFailed {
                name: spec.name.clone(),
                reason: format!("attach failed: {}", e),
            })?;

        let name = spec.name.clone();
        tokio::spawn(async move {
            let mut output = output;
            while let Some(item) = output.next().await {
                match item {
                    Ok(chunk) => {
                        let text = String::from_utf8_lossy(&chunk.into_bytes()).into_owned();
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            tracing::debug!(target: CONTAINER_LOG_TARGET, container = %name, "{}", line);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(container = %name, error = %e, "Attach stream ended in error");
                        break;
                    }
                }
            }
            tracing::debug!(container = %name, "End of container output streams");
        });

        Ok(container_id)
    }

    /// Best-effort removal of a container that never made it to running.
    async fn discard(&self, docker: &Docker, name: &str) {
        if let Err(e) = docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::debug!(container = %name, error = %e, "Could not discard container");
        }
    }

    async fn await_exit(
        &self,
        docker: &Docker,
        spec: &ContainerSpec,
        id: &str,
    ) -> Result<ContainerExit, RuntimeError> {
        let mut wait = docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running".to_string(),
            }),
        );

        match wait.next().await {
            Some(Ok(response)) => Ok(ContainerExit {
                status_code: response.status_code,
            }),
            // The engine reports non-zero exits as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(ContainerExit { status_code: code })
            }
            Some(Err(e)) => Err(RuntimeError::Wait {
                name: spec.name.clone(),
                reason: e.to_string(),
            }),
            None => {
                let inspect = docker.inspect_container(id, None).await.map_err(|e| {
                    RuntimeError::Wait {
                        name: spec.name.clone(),
                        reason: format!("wait stream closed and inspect failed: {}", e),
                    }
                })?;
                let code = inspect
                    .state
                    .and_then(|s| s.exit_code)
                    .ok_or_else(|| RuntimeError::Wait {
                        name: spec.name.clone(),
                        reason: "wait stream closed without an exit code".to_string(),
                    })?;
                Ok(ContainerExit { status_code: code })
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(
        &self,
        spec: &ContainerSpec,
        started: oneshot::Sender<()>,
    ) -> Result<ContainerExit, RuntimeError> {
        let docker = self.docker().await?;

        let container_id = match self.provision(&docker, spec).await {
            Ok(id) => id,
            Err(e) => {
                if !matches!(e, RuntimeError::CreationFailed { .. }) {
                    self.discard(&docker, &spec.name).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = docker.start_container::<String>(&container_id, None).await {
            self.discard(&docker, &spec.name).await;
            return Err(RuntimeError::StartFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            });
        }

        tracing::info!(container = %spec.name, image = %spec.image, "Started worker container");
        let _ = started.send(());

        let exit = self.await_exit(&docker, spec, &container_id).await?;
        tracing::info!(
            container = %spec.name,
            status_code = exit.status_code,
            "Worker container exited"
        );
        Ok(exit)
    }

    async fn stop_and_remove(&self, name: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;

        if let Err(e) = docker.inspect_container(name, None).await {
            tracing::debug!(container = %name, error = %e, "Nothing to stop, container not found");
            return Ok(());
        }

        let grace = i64::try_from(self.stop_timeout.as_secs()).unwrap_or(i64::MAX);
        if let Err(e) = docker
            .stop_container(name, Some(StopContainerOptions { t: grace }))
            .await
        {
            tracing::warn!(container = %name, error = %e, "Failed to stop container (may already be stopped)");
        }

        if let Err(e) = docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::warn!(container = %name, error = %e, "Failed to remove container (may require manual cleanup)");
        }

        tracing::info!(container = %name, "Stopped and removed worker container");
        Ok(())
    }

    async fn follow_logs(&self, name: &str) -> Option<LogStream> {
        let docker = match self.docker().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "Cannot follow logs");
                return None;
            }
        };
        if let Err(e) = docker.inspect_container(name, None).await {
            tracing::warn!(container = %name, error = %e, "Couldn't obtain container logs");
            return None;
        }

        let mut logs = docker.logs(
            name,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        let container = name.to_string();
        tokio::spawn(async move {
            while let Some(item) = logs.next().await {
                let forwarded = match item {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => Ok(message),
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => Err(RuntimeError::Logs {
                        name: container.clone(),
                        reason: e.to_string(),
                    }),
                };
                let failed = forwarded.is_err();
                if tx.send(forwarded).await.is_err() || failed {
                    // Follower went away, or the engine stream broke.
                    break;
                }
            }
        });

        Some(ReceiverStream::new(rx).boxed())
    }
}
