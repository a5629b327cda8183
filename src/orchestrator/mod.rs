//! Orchestrator: runs queued jobs in worker containers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Orchestrator                        │
//! │                                                        │
//! │  Scheduler                                             │
//! │    submit() -> prepare, register, enqueue (FIFO)       │
//! │    cancel() -> stop container, mark canceled, evict    │
//! │    N executors, one container each                     │
//! │                                                        │
//! │  JobRegistry                                           │
//! │    live jobs, queued through terminal                  │
//! │                                                        │
//! │  ContainerRuntime (DockerRuntime in production)        │
//! │    run / stop_and_remove / follow_logs                 │
//! │                                                        │
//! │  LogRelay                                              │
//! │    container output -> subscriber frames               │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod docker;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod scheduler;

pub use docker::{DockerRuntime, connect_docker};
pub use registry::JobRegistry;
pub use relay::{LogRelay, RelayConfig, RelayFrame, RelayOutcome, RelaySink, RelayTarget};
pub use runtime::{ContainerExit, ContainerRuntime, ContainerSpec, ContainerTemplate, LogStream};
pub use scheduler::{Scheduler, SchedulerConfig, StatusReport};
