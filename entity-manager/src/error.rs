//! Error types for the inventory daemon.

use thiserror::Error;

/// Result type alias using [`EmError`].
pub type Result<T> = std::result::Result<T, EmError>;

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum EmError {
    /// Configuration or template library error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schema machinery error. Fatal for the global schema.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Probe expression parse error.
    #[error("Invalid probe expression: {0}")]
    Probe(String),

    #[error(transparent)]
    Common(#[from] entity_manager_common::Error),

    #[error("Bus error: {0}")]
    Bus(#[from] entity_manager_bus::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a schema error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a probe parse error.
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }
}
