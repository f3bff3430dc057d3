//! Error types for the bus seam.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A fault reported back to a bus client.
///
/// These are the only error kinds that cross the bus boundary: bad client
/// input and internal inconsistencies. Everything else is logged and
/// handled locally.
#[derive(Debug, Error)]
pub enum BusFault {
    /// The caller supplied invalid data.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The server hit an inconsistency it cannot attribute to the caller.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusFault {
    /// Create an invalid-argument fault.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal fault.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Errors that can occur talking to the bus.
#[derive(Debug, Error)]
pub enum Error {
    /// A fault returned by the remote side.
    #[error(transparent)]
    Fault(#[from] BusFault),

    /// The transport dropped the request.
    #[error("Transport error: {0}")]
    Transport(String),
}
