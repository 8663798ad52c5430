//! Ambient configuration for the coordination layer.
//!
//! Kept deliberately small: connection settings for the store backend and
//! the few knobs the registries expose. Loaded from TOML, every field has a
//! default so an empty file is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{TaskProcError, TaskProcResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskProcConfig {
    pub redis: RedisStoreConfig,
    pub processor: ProcessorConfig,
}

/// Connection settings for the Redis store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 5,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }
}

impl RedisStoreConfig {
    pub fn build_connection_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Settings for the task processor registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Liveness TTL in seconds for processor registrations and the master
    /// key. Must be positive.
    pub expiration_seconds: u64,
    pub type_resolution: TypeResolutionPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            expiration_seconds: 30,
            type_resolution: TypeResolutionPolicy::default(),
        }
    }
}

/// What to do when a stored payload carries a type tag with no registered
/// counterpart.
///
/// `Strict` fails loudly with [`TaskProcError::TypeNotFound`] and is the
/// default in debug builds; `Lenient` logs the tag and treats the payload as
/// absent and is the default in release builds. The switch is deliberate
/// configuration, never an implicit behavior change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeResolutionPolicy {
    Strict,
    Lenient,
}

impl Default for TypeResolutionPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            TypeResolutionPolicy::Strict
        } else {
            TypeResolutionPolicy::Lenient
        }
    }
}

impl TaskProcConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> TaskProcResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TaskProcError::Configuration(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| TaskProcError::Configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TaskProcResult<()> {
        if self.processor.expiration_seconds == 0 {
            return Err(TaskProcError::Configuration(
                "processor.expiration_seconds must be positive".to_string(),
            ));
        }
        if self.redis.host.is_empty() {
            return Err(TaskProcError::Configuration(
                "redis.host must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: TaskProcConfig = toml::from_str("").unwrap();
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.processor.expiration_seconds, 30);
        config.validate().unwrap();
    }

    #[test]
    fn loads_overrides_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[redis]\nhost = \"redis.internal\"\nport = 6380\n\n[processor]\nexpiration_seconds = 10"
        )
        .unwrap();

        let config = TaskProcConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.processor.expiration_seconds, 10);
    }

    #[test]
    fn rejects_zero_expiration() {
        let config: TaskProcConfig =
            toml::from_str("[processor]\nexpiration_seconds = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(TaskProcError::Configuration(_))
        ));
    }

    #[test]
    fn connection_url_includes_password_when_set() {
        let mut redis = RedisStoreConfig::default();
        assert_eq!(redis.build_connection_url(), "redis://127.0.0.1:6379/0");
        redis.password = Some("secret".to_string());
        assert_eq!(
            redis.build_connection_url(),
            "redis://:secret@127.0.0.1:6379/0"
        );
    }
}
