use std::time::Duration;

use enginewire_frame::FrameError;
use enginewire_protocol::CodecError;
use enginewire_transport::TransportError;

/// Errors surfaced by RPC sessions.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error, including `ConnectionFailed` at connect time.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A payload could not be decoded.
    #[error(transparent)]
    MalformedMessage(#[from] CodecError),

    /// JSON error while encoding or decoding the handshake.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer rejected the connection, or answered with something unexpected.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// No live connection. Calls are never queued while disconnected.
    #[error("not connected")]
    NotConnected,

    /// No reply arrived in time. The connection remains usable.
    #[error("{call} timed out after {timeout:?}")]
    CallTimedOut { call: &'static str, timeout: Duration },

    /// The peer's handler failed.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// The reply decoded fine but is the wrong kind for the call.
    #[error("unexpected {reply} reply to {call}")]
    UnexpectedReply {
        call: &'static str,
        reply: &'static str,
    },
}

impl RpcError {
    /// Whether the error means the connection is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RpcError::NotConnected | RpcError::Frame(FrameError::ConnectionClosed)
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
