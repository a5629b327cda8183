//! Configuration for regpool.
//!
//! Everything comes from env vars, optionally seeded from a `.env` file
//! (loaded via dotenvy, which never overwrites variables already set).
//! Each section resolves itself; a bad value fails startup.

pub(crate) mod helpers;
mod pool;
mod relay;
mod server;
mod worker;

use crate::error::ConfigError;

pub use self::pool::{DEFAULT_BASE_WORKDIR, PoolConfig};
pub use self::relay::StreamingConfig;
pub use self::server::ServerConfig;
pub use self::worker::WorkerConfig;

/// Main configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub streaming: StreamingConfig,
}

impl Config {
    /// Load configuration from `.env` and environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::build()
    }

    fn build() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::resolve()?,
            pool: PoolConfig::resolve()?,
            worker: WorkerConfig::resolve()?,
            streaming: StreamingConfig::resolve()?,
        })
    }
}
