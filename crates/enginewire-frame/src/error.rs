use enginewire_transport::TransportError;

/// Errors that can occur while encoding, decoding or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header does not start with `"EW"`; the stream is out of sync.
    #[error("invalid frame magic (expected 0x4557 \"EW\")")]
    InvalidMagic,

    /// The kind byte is not a known [`FrameKind`](crate::FrameKind).
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// The reserved header byte is non-zero.
    #[error("reserved header byte must be zero, got {0}")]
    ReservedByte(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream, possibly mid-frame.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// True for read timeouts surfaced by the transport.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

impl From<TransportError> for FrameError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
            TransportError::Bind { source, .. } | TransportError::ConnectionFailed { source, .. } => {
                FrameError::Io(source)
            }
            other => FrameError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
