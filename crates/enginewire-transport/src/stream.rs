use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// A connected byte stream between host and engine.
///
/// Socket and pipe transports look identical from here up: `Read + Write`,
/// cloneable into independent read and write halves, and shut down from any
/// half to unblock a reader parked on another.
pub struct IpcStream {
    inner: Inner,
}

enum Inner {
    Tcp(std::net::TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    #[cfg(windows)]
    Pipe(std::fs::File),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            Inner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Inner::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            Inner::Pipe(file) => match file.read(buf) {
                // ERROR_BROKEN_PIPE / ERROR_PIPE_NOT_CONNECTED: peer went away.
                Err(err) if matches!(err.raw_os_error(), Some(109) | Some(233)) => Ok(0),
                other => other,
            },
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            Inner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Inner::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            Inner::Pipe(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            Inner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Inner::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            Inner::Pipe(file) => file.flush(),
        }
    }
}

impl IpcStream {
    pub(crate) fn from_tcp(stream: std::net::TcpStream) -> std::io::Result<Self> {
        // Input events are tiny; Nagle would hold them back behind a pixel reply.
        stream.set_nodelay(true)?;
        Ok(Self {
            inner: Inner::Tcp(stream),
        })
    }

    /// Wrap a connected Unix domain socket.
    ///
    /// Public so tests and in-process peers can use `UnixStream::pair()`.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: Inner::Unix(stream),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_pipe(file: std::fs::File) -> Self {
        Self {
            inner: Inner::Pipe(file),
        }
    }

    /// Set the read timeout. Named pipes have no read timeout and ignore this.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            Inner::Tcp(stream) => stream.set_read_timeout(timeout)?,
            #[cfg(unix)]
            Inner::Unix(stream) => stream.set_read_timeout(timeout)?,
            #[cfg(windows)]
            Inner::Pipe(_) => {}
        }
        Ok(())
    }

    /// Set the write timeout. Named pipes have no write timeout and ignore this.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            Inner::Tcp(stream) => stream.set_write_timeout(timeout)?,
            #[cfg(unix)]
            Inner::Unix(stream) => stream.set_write_timeout(timeout)?,
            #[cfg(windows)]
            Inner::Pipe(_) => {}
        }
        Ok(())
    }

    /// Clone the underlying handle so reads and writes can live on different threads.
    pub fn try_clone(&self) -> Result<Self> {
        let inner = match &self.inner {
            Inner::Tcp(stream) => Inner::Tcp(stream.try_clone()?),
            #[cfg(unix)]
            Inner::Unix(stream) => Inner::Unix(stream.try_clone()?),
            #[cfg(windows)]
            Inner::Pipe(file) => Inner::Pipe(file.try_clone()?),
        };
        Ok(Self { inner })
    }

    /// Close both directions. A reader blocked on any clone of this stream
    /// observes end-of-stream.
    pub fn shutdown(&self) -> Result<()> {
        let result = match &self.inner {
            Inner::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            Inner::Unix(stream) => stream.shutdown(std::net::Shutdown::Both),
            #[cfg(windows)]
            Inner::Pipe(file) => {
                crate::pipe::disconnect(file);
                Ok(())
            }
        };
        match result {
            // Already closed by the peer.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Into::into),
        }
    }

    /// Short human-readable description of the peer for logs.
    pub fn peer(&self) -> String {
        match &self.inner {
            Inner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| format!("tcp://{addr}"))
                .unwrap_or_else(|_| "tcp://?".to_string()),
            #[cfg(unix)]
            Inner::Unix(stream) => stream
                .peer_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| format!("unix://{}", p.display())))
                .unwrap_or_else(|| "unix://(unnamed)".to_string()),
            #[cfg(windows)]
            Inner::Pipe(_) => "pipe://".to_string(),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            Inner::Tcp(_) => "tcp",
            #[cfg(unix)]
            Inner::Unix(_) => "unix",
            #[cfg(windows)]
            Inner::Pipe(_) => "pipe",
        };
        f.debug_struct("IpcStream").field("type", &kind).finish()
    }
}
