use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use enginewire_transport::IpcStream;
use tracing::trace;

use crate::codec::{encode_header, Frame, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

/// Payloads below this size are copied next to the header and sent in one write.
const COALESCE_LIMIT: usize = 16 * 1024;

/// Writes whole frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(HEADER_SIZE + COALESCE_LIMIT),
            config,
        }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.kind, frame.payload.as_ref())
    }

    /// Encode and send one frame, then flush.
    pub fn send(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        self.send_parts(kind, &[payload])
    }

    /// Send one frame whose payload is the concatenation of `parts`.
    ///
    /// Lets callers prepend a small prefix to a large body without copying it.
    pub fn send_parts(&mut self, kind: FrameKind, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|part| part.len()).sum();
        if len > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_header(kind, len, &mut self.buf)?;
        for part in parts {
            if self.buf.len() + part.len() <= HEADER_SIZE + COALESCE_LIMIT {
                self.buf.extend_from_slice(part);
                continue;
            }
            // Pixel buffers are large; skip the copy.
            if !self.buf.is_empty() {
                write_all(&mut self.inner, &self.buf)?;
                self.buf.clear();
            }
            write_all(&mut self.inner, part)?;
        }
        if !self.buf.is_empty() {
            write_all(&mut self.inner, &self.buf)?;
        }

        trace!(%kind, len, "frame sent");
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                    continue
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
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

fn write_all<W: Write>(inner: &mut W, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        match inner.write(bytes) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue
            }
            Err(err) if matches!(err.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                return Err(FrameError::ConnectionClosed)
            }
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

impl FrameWriter<IpcStream> {
    /// Wrap an [`IpcStream`], applying the configured write timeout to it.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::decode_frame;

    fn decode_all(bytes: Vec<u8>) -> Vec<Frame> {
        let mut wire = BytesMut::from(bytes.as_slice());
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut wire, usize::MAX).unwrap() {
            frames.push(frame);
        }
        assert!(wire.is_empty());
        frames
    }

    #[test]
    fn small_and_large_payloads_encode_identically() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        let big = vec![0xee; COALESCE_LIMIT * 2];
        writer.send(FrameKind::Call, b"tiny").unwrap();
        writer.send(FrameKind::Reply, &big).unwrap();
        writer
            .write_frame(&Frame::new(FrameKind::Fault, &b"boom"[..]))
            .unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.as_ref(), b"tiny");
        assert_eq!(frames[1].payload.len(), big.len());
        assert_eq!(frames[2].kind, FrameKind::Fault);
    }

    #[test]
    fn oversize_payload_rejected_before_writing() {
        let config = FrameConfig::default().with_max_payload_size(4);
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), config);
        assert!(matches!(
            writer.send(FrameKind::Call, b"too long"),
            Err(FrameError::PayloadTooLarge { .. })
        ));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn parts_are_concatenated_in_order() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        let big = vec![0x11; COALESCE_LIMIT + 1];
        writer
            .send_parts(FrameKind::Reply, &[&b"id:"[..], &big[..], &b"!"[..]])
            .unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        let payload = &frames[0].payload;
        assert_eq!(payload.len(), 3 + big.len() + 1);
        assert_eq!(&payload[..3], b"id:");
        assert_eq!(payload[payload.len() - 1], b'!');
    }

    struct Flaky {
        hiccups: Vec<ErrorKind>,
        data: Vec<u8>,
        flushed: bool,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.hiccups.pop() {
                return Err(std::io::Error::from(kind));
            }
            // Short writes exercise the resume path.
            let n = buf.len().min(3);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    #[test]
    fn retries_interrupts_and_short_writes() {
        let mut writer = FrameWriter::new(Flaky {
            hiccups: vec![ErrorKind::WouldBlock, ErrorKind::Interrupted],
            data: Vec::new(),
            flushed: false,
        });
        writer.send(FrameKind::Notify, b"retry me").unwrap();

        let inner = writer.into_inner();
        assert!(inner.flushed);
        let frames = decode_all(inner.data);
        assert_eq!(frames[0].payload.as_ref(), b"retry me");
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_length_write_is_connection_closed() {
        let mut writer = FrameWriter::new(Closed);
        assert!(matches!(
            writer.send(FrameKind::Call, b"x"),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn broken_pipe_is_connection_closed() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        drop(right);
        let mut writer = FrameWriter::new(IpcStream::from_unix(left));
        let payload = vec![0u8; 256 * 1024];
        let mut result = Ok(());
        for _ in 0..8 {
            result = writer.send(FrameKind::Reply, &payload);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
