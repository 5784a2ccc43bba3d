//! Top-level error types for Gopherbot.
//!
//! Task and robot-method outcomes are not errors; they travel as
//! [`crate::TaskRetVal`] and [`crate::RetVal`]. The types here cover
//! infrastructure failures: configuration, brain storage, connectors and
//! the pipeline child protocol.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Brain(#[from] BrainError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Rpc(#[from] crate::rpc::PipelineRpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Brain storage and encryption errors.
#[derive(Debug, thiserror::Error)]
pub enum BrainError {
    #[error("invalid brain key '{0}'")]
    InvalidKey(String),

    #[error("brain backend '{0}' is not available")]
    UnknownBackend(String),

    #[error("encryption failure: {0}")]
    Crypt(String),

    #[error("brain storage failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Connector lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("no connector registered for protocol '{0}'")]
    UnknownProtocol(String),

    #[error("{0}")]
    Lifecycle(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
