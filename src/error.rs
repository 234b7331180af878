//! Error kinds shared by every layer of the dispatch library

use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the dispatch library
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad arguments: unsupported flag, empty/short/wrong-prefix service, duplicate
    /// or reserved handler type, a second call to [`crate::init`], etc.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The requested address does not fit the platform's local-socket address
    /// structure (e.g. `sun_path`).
    #[error("address does not fit: {0}")]
    Range(String),

    /// A syscall failed; wraps the platform error.
    #[error(transparent)]
    System(#[from] io::Error),

    /// The wire data violated the framing protocol: a malformed length prefix, a
    /// missing ancillary file descriptor, a short read mid-frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection cleanly at a frame boundary.
    #[error("end of file")]
    Eof,
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub(crate) fn range(msg: impl Into<String>) -> Self {
        Error::Range(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
