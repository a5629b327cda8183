use crate::config::helpers::{parse_list_env, parse_optional_env};
use crate::error::ConfigError;

/// Origins allowed by default, the two local front-end dev servers.
const DEFAULT_ORIGINS: &[&str] = &["http://localhost:9000", "http://localhost:9090"];

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Origins accepted by the CORS layer and the log WebSocket handshake.
    pub allowed_origins: Vec<String>,
    /// Largest accepted request body, in megabytes.
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 10000,
            allowed_origins: DEFAULT_ORIGINS.iter().map(|s| s.to_string()).collect(),
            max_upload_mb: 1024,
        }
    }
}

impl ServerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            port: parse_optional_env("REGPOOL_LISTEN_PORT", defaults.port)?,
            allowed_origins: parse_list_env("REGPOOL_ALLOWED_ORIGINS", DEFAULT_ORIGINS)?,
            max_upload_mb: parse_optional_env("REGPOOL_MAX_UPLOAD_MB", defaults.max_upload_mb)?,
        })
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}
