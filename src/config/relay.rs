use std::time::Duration;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;
use crate::orchestrator::RelayConfig;

/// Log streaming configuration.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub heartbeat_secs: u64,
    pub chunk_size: usize,
    pub close_grace_secs: u64,
}

impl StreamingConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let chunk_size: usize = parse_optional_env("REGPOOL_LOG_CHUNK_SIZE", 1024)?;
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REGPOOL_LOG_CHUNK_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let heartbeat_secs: u64 = parse_optional_env("REGPOOL_HEARTBEAT_SECS", 2)?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REGPOOL_HEARTBEAT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            heartbeat_secs,
            chunk_size,
            close_grace_secs: parse_optional_env("REGPOOL_CLOSE_GRACE_SECS", 5)?,
        })
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            chunk_size: self.chunk_size,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            close_grace: Duration::from_secs(self.close_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    fn clear_streaming_env() {
        // SAFETY: Only called under ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("REGPOOL_LOG_CHUNK_SIZE");
            std::env::remove_var("REGPOOL_HEARTBEAT_SECS");
            std::env::remove_var("REGPOOL_CLOSE_GRACE_SECS");
        }
    }

    #[test]
    fn test_defaults_match_relay_defaults() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_streaming_env();

        let relay = StreamingConfig::resolve().unwrap().relay_config();
        let defaults = RelayConfig::default();
        assert_eq!(relay.chunk_size, defaults.chunk_size);
        assert_eq!(relay.heartbeat_interval, defaults.heartbeat_interval);
        assert_eq!(relay.close_grace, defaults.close_grace);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_streaming_env();
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("REGPOOL_LOG_CHUNK_SIZE", "0");
        }

        assert!(StreamingConfig::resolve().is_err());
        clear_streaming_env();
    }
}
