//! Service configuration.
//!
//! Loaded from a TOML file; every section is optional and falls back to its
//! defaults.
//!
//! ```toml
//! listen_addr = "0.0.0.0:50051"
//! data_dir = "/var/lib/identity"
//! request_timeout_ms = 2000
//!
//! [runtime]
//! workers = 8
//! queue_capacity = 4096
//!
//! [input]
//! lowercase_email = true
//!
//! [storage]
//! max_wal_size = 134217728
//! sync_on_write = true
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::InputPolicy;
use crate::runtime::RuntimeConfig;
#[cfg(feature = "persistent")]
use crate::storage::PersistentConfig;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the gRPC server binds to.
    pub listen_addr: SocketAddr,
    /// Database directory. `None` keeps contacts in memory only.
    pub data_dir: Option<PathBuf>,
    /// How long a request may wait for its resolution.
    pub request_timeout_ms: u64,
    /// Worker pool sizing.
    pub runtime: RuntimeConfig,
    /// Input normalization.
    pub input: InputPolicy,
    /// Persistent backend tuning.
    #[cfg(feature = "persistent")]
    pub storage: PersistentConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            data_dir: None,
            request_timeout_ms: 5_000,
            runtime: RuntimeConfig::default(),
            input: InputPolicy::default(),
            #[cfg(feature = "persistent")]
            storage: PersistentConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Read and validate a TOML config file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Parse` on bad TOML, `Invalid` on bad values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    ///
    /// # Errors
    /// `Parse` on bad TOML, `Invalid` on bad values.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()
    }

    /// Check limits, returning the config unchanged when valid.
    ///
    /// # Errors
    /// `Invalid` naming the first offending setting.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".to_string()));
        }
        if self.runtime.workers == 0 {
            return Err(ConfigError::Invalid("runtime.workers must be positive".to_string()));
        }
        if self.runtime.queue_capacity == 0 {
            return Err(ConfigError::Invalid("runtime.queue_capacity must be positive".to_string()));
        }
        if self.input.max_field_length == 0 {
            return Err(ConfigError::Invalid("input.max_field_length must be positive".to_string()));
        }
        #[cfg(feature = "persistent")]
        let config = {
            let mut config = self;
            config.storage = config
                .storage
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("storage: {e}")))?;
            config
        };
        #[cfg(not(feature = "persistent"))]
        let config = self;
        Ok(config)
    }

    /// Request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = ServiceConfig::from_toml_str(
            r#"
            listen_addr = "0.0.0.0:7000"
            data_dir = "/tmp/contacts"

            [runtime]
            workers = 2

            [input]
            lowercase_email = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.data_dir.as_deref(), Some(Path::new("/tmp/contacts")));
        assert_eq!(config.runtime.workers, 2);
        assert_eq!(config.runtime.queue_capacity, RuntimeConfig::default().queue_capacity);
        assert!(config.input.lowercase_email);
        assert!(config.input.trim_whitespace);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServiceConfig::from_toml_str("[runtime]\nworkers = 0").unwrap_err();
        assert!(err.to_string().contains("runtime.workers"));

        let err = ServiceConfig::from_toml_str("request_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = ServiceConfig::from_toml_str("listen_addr = \"nowhere\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[cfg(feature = "persistent")]
    #[test]
    fn test_storage_section_is_validated() {
        let err = ServiceConfig::from_toml_str("[storage]\nmax_wal_size = 1").unwrap_err();
        assert!(err.to_string().contains("max_wal_size"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServiceConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
