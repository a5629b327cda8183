//! regpool: a bounded container job scheduler.
//!
//! Jobs are submitted over HTTP, queued FIFO, and run one container each on
//! a fixed pool of executors. Clients can poll status, cancel, fetch
//! results, and follow container output live over a WebSocket.

pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod testing;
