use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use enginewire_transport::IpcStream;
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads whole frames from any `Read` stream.
///
/// Bytes past the end of a frame stay buffered for the next call, so a read
/// that returns early (timeout, interrupt) never loses data.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    chunk: Box<[u8]>,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            config,
        }
    }

    /// Read the next frame (blocking).
    ///
    /// Returns [`FrameError::ConnectionClosed`] at end-of-stream, whether or
    /// not a frame was partially received. A transport read timeout surfaces
    /// as [`FrameError::Io`]; see [`FrameError::is_timeout`].
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                trace!(kind = %frame.kind, len = frame.payload.len(), "frame received");
                return Ok(frame);
            }

            let read = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&self.chunk[..read]);
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Wrap an [`IpcStream`], applying the configured read timeout to it.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
