//! Generic TOML config loading, reused by `visifruit_runtime` to turn
//! on-disk files into the typed `Calibration`/machine values the core
//! is constructed from. The core library itself never touches a
//! filesystem path (§1, §6) — this lives in `visifruit_common` only so
//! the thin wrapper binary shares one loading idiom instead of
//! inventing its own.

use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("config file not found: {0}")]
    FileNotFound(std::path::PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    ParseError {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Blanket TOML loader for any `Deserialize` config type.
pub trait ConfigLoader: DeserializeOwned {
    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigLoadError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl<T: DeserializeOwned> ConfigLoader for T {}

/// Log verbosity, mirrored into a `tracing` env-filter directive by
/// the runtime binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
