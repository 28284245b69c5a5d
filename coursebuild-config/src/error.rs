//! Error types for coursebuild-config.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration errors. Every variant names the offending file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No index file in the course directory.
    #[error("no index.yaml, index.yml or index.json in {dir}")]
    IndexNotFound { dir: PathBuf },

    /// A referenced configuration file does not exist.
    #[error("configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Malformed YAML or JSON.
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Well-formed but invalid content.
    #[error("invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    /// A required field is absent from an exercise configuration.
    #[error("required field '{field}' missing from {path}")]
    MissingField { path: PathBuf, field: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.into(),
        message: message.into(),
    }
}
