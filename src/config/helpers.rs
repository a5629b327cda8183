//! Env var parsing shared by the config sections.

use std::str::FromStr;

use crate::error::ConfigError;

/// Serializes tests that mutate the process environment.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid unicode".to_string(),
        }),
    }
}

/// Read an env var that has no default.
pub(crate) fn require_env(key: &str, hint: &str) -> Result<String, ConfigError> {
    optional_env(key)?.ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}

/// Parse an env var into `T`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(key: &str, default: &str) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.to_string()))
}

/// Comma-separated list, blanks dropped.
pub(crate) fn parse_list_env(key: &str, default: &[&str]) -> Result<Vec<String>, ConfigError> {
    Ok(match optional_env(key)? {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optional_env_reports_key() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("REGPOOL_TEST_NUMBER", "twelve");
        }

        let err = parse_optional_env::<u16>("REGPOOL_TEST_NUMBER", 1).unwrap_err();
        assert!(err.to_string().contains("REGPOOL_TEST_NUMBER"));

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("REGPOOL_TEST_NUMBER", " 12 ");
        }
        assert_eq!(parse_optional_env::<u16>("REGPOOL_TEST_NUMBER", 1).unwrap(), 12);

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("REGPOOL_TEST_NUMBER");
        }
        assert_eq!(parse_optional_env::<u16>("REGPOOL_TEST_NUMBER", 1).unwrap(), 1);
    }

    #[test]
    fn test_empty_value_counts_as_unset() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("REGPOOL_TEST_EMPTY", "   ");
        }

        assert_eq!(optional_env("REGPOOL_TEST_EMPTY").unwrap(), None);
        assert!(matches!(
            require_env("REGPOOL_TEST_EMPTY", "set it"),
            Err(ConfigError::MissingRequired { .. })
        ));

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("REGPOOL_TEST_EMPTY");
        }
    }

    #[test]
    fn test_list_parsing() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("REGPOOL_TEST_LIST", "a, b,,c ");
        }

        assert_eq!(
            parse_list_env("REGPOOL_TEST_LIST", &[]).unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            parse_list_env("REGPOOL_TEST_UNSET_LIST", &["x"]).unwrap(),
            vec!["x"]
        );

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::remove_var("REGPOOL_TEST_LIST");
        }
    }
}
