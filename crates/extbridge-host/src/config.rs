//! Runtime configuration.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use extbridge_core::forwarder::DEFAULT_REQUEST_TIMEOUT;
use extbridge_core::ipc::DEFAULT_MAX_FRAME_BYTES;
use serde::Deserialize;
use thiserror::Error;

use crate::worker_transport::WorkerTransportConfig;

/// Top-level bridge configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct BridgeConfig {
    /// HTTP listener.
    pub listen: ListenConfig,
    /// Bound on the wait for an extension reply.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Extension worker processes.
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
}

impl BridgeConfig {
    /// Loads configuration from TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&data)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let cfg = toml::from_str::<Self>(data).map_err(ConfigError::Toml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reply wait bound.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be positive".to_owned(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for ext in &self.extensions {
            if ext.unique_id.is_empty() || ext.unique_id.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "extension unique_id `{}` must be non-empty and contain no `/`",
                    ext.unique_id
                )));
            }
            if !seen.insert(ext.unique_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate extension unique_id `{}`",
                    ext.unique_id
                )));
            }
        }
        Ok(())
    }
}

/// Embedded example configuration template.
pub const EXAMPLE_CONFIG_TOML: &str = include_str!("../extbridge.example.toml");

/// Writes the embedded example config to `path`.
///
/// Without `overwrite` an existing file is left alone and the call fails
/// with [`std::io::ErrorKind::AlreadyExists`].
pub fn write_example_config(path: impl AsRef<Path>, overwrite: bool) -> Result<(), std::io::Error> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path)?.write_all(EXAMPLE_CONFIG_TOML.as_bytes())
}

/// HTTP listener configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ListenConfig {
    /// Bind socket address.
    pub bind: String,
}

/// One extension worker.
#[derive(Clone, Debug, Deserialize)]
pub struct ExtensionConfig {
    /// Stable id; routes live under `/_extensions/_<unique_id>`.
    pub unique_id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Binary path.
    pub command: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Max IPC frame bytes.
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
    /// `"<METHOD> <path>"` actions served by the extension.
    #[serde(default)]
    pub rest_actions: Vec<String>,
}

impl ExtensionConfig {
    /// Display name, falling back to the unique id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.unique_id)
    }

    /// Worker process settings.
    #[must_use]
    pub fn worker(&self) -> WorkerTransportConfig {
        WorkerTransportConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File read error.
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),
    /// TOML parse error.
    #[error("failed to parse config toml: {0}")]
    Toml(toml::de::Error),
    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_request_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_REQUEST_TIMEOUT.as_millis()).unwrap_or(5_000)
}

fn default_max_frame() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
