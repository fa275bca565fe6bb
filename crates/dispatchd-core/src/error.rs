//! Core error types.

use std::path::PathBuf;

/// Unified error type for configuration and protocol handling.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The configuration file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or violates the schema.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A broker name appears in the config that no transport implements.
    #[error("unknown broker `{name}` in config")]
    UnknownBroker { name: String },

    /// A message could not be serialized for the wire.
    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;
