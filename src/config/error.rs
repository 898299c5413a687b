//! Errors raised while loading, validating and saving configuration.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("Malformed configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Cannot encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value parsed but is out of range, e.g. 4 data bits or a zero tick.
    #[error("Invalid '{key}': {message}")]
    Invalid { key: String, message: String },

    /// A `SERIAL_TRANSPORT_*` override could not be parsed.
    #[error("Bad value in ${var}: {message}")]
    Env { var: String, message: String },

    /// `save` was called on a loader that was not loaded from a file.
    #[error("No configuration file to save to")]
    NoPath,
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn env(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Env {
            var: var.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
