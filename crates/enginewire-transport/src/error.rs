use std::path::PathBuf;
use std::time::Duration;

use crate::endpoint::{Endpoint, TransportKind};

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a listener on the endpoint.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    /// The peer could not be reached before the connect deadline.
    #[error("connection to {endpoint} failed after {timeout:?}: {source}")]
    ConnectionFailed {
        endpoint: Endpoint,
        timeout: Duration,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The resolved socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// A location string could not be resolved for the configured transport.
    #[error("invalid {kind} location '{location}': {reason}")]
    InvalidLocation {
        kind: TransportKind,
        location: String,
        reason: &'static str,
    },

    /// The transport is not available on this platform.
    #[error("{0} transport is not supported on this platform")]
    Unsupported(TransportKind),
}

pub type Result<T> = std::result::Result<T, TransportError>;
