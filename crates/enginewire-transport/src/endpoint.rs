use std::fmt;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// Delay between connect attempts while the peer is not listening yet.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

const MAX_PIPE_NAME_LEN: usize = 64;

/// Which transport family a session uses.
///
/// Resolved once at session start; every connection of the session uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Loopback TCP socket.
    #[default]
    Tcp,
    /// Local pipe: a Unix domain socket on Unix, a named pipe on Windows.
    Pipe,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Pipe => "pipe",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "pipe" | "pipes" => Ok(TransportKind::Pipe),
            other => Err(format!("unknown transport '{other}' (expected tcp or pipe)")),
        }
    }
}

/// One side's address for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Loopback TCP port. Port 0 asks the OS for an ephemeral port when binding.
    Tcp { port: u16 },
    /// Local pipe name, without any platform prefix.
    Pipe { name: String },
}

impl Endpoint {
    /// Loopback TCP endpoint.
    pub fn tcp(port: u16) -> Self {
        Endpoint::Tcp { port }
    }

    /// Local pipe endpoint. The name is validated on use.
    pub fn pipe(name: impl Into<String>) -> Self {
        Endpoint::Pipe { name: name.into() }
    }

    /// Resolve a location string as written on the engine command line.
    ///
    /// TCP locations are port numbers, pipe locations are bare names.
    pub fn parse(kind: TransportKind, location: &str) -> Result<Self> {
        let location = location.trim();
        match kind {
            TransportKind::Tcp => {
                let port = location
                    .parse::<u16>()
                    .map_err(|_| TransportError::InvalidLocation {
                        kind,
                        location: location.to_string(),
                        reason: "expected a port number",
                    })?;
                Ok(Endpoint::Tcp { port })
            }
            TransportKind::Pipe => {
                validate_pipe_name(location)?;
                Ok(Endpoint::Pipe {
                    name: location.to_string(),
                })
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Tcp { .. } => TransportKind::Tcp,
            Endpoint::Pipe { .. } => TransportKind::Pipe,
        }
    }

    /// The location string accepted by [`Endpoint::parse`].
    pub fn location(&self) -> String {
        match self {
            Endpoint::Tcp { port } => port.to_string(),
            Endpoint::Pipe { name } => name.clone(),
        }
    }

    pub(crate) fn socket_addr(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { port } => write!(f, "tcp://127.0.0.1:{port}"),
            Endpoint::Pipe { name } => write!(f, "pipe://{name}"),
        }
    }
}

pub(crate) fn validate_pipe_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("pipe name must not be empty")
    } else if name.len() > MAX_PIPE_NAME_LEN {
        Some("pipe name too long")
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("pipe name may only contain [A-Za-z0-9._-]")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(TransportError::InvalidLocation {
            kind: TransportKind::Pipe,
            location: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Connect to a listening endpoint, retrying until `timeout` elapses.
///
/// The engine and host start listening at different times, so a refused or
/// missing endpoint is retried. Any other error, or the deadline passing,
/// yields [`TransportError::ConnectionFailed`].
pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<IpcStream> {
    if let Endpoint::Pipe { name } = endpoint {
        validate_pipe_name(name)?;
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = connect_once(endpoint, remaining.max(Duration::from_millis(1)));
        match attempt {
            Ok(stream) => {
                debug!(%endpoint, "connected");
                return Ok(stream);
            }
            Err(err) if is_retryable(&err) && Instant::now() < deadline => {
                trace!(%endpoint, error = %err, "peer not listening yet, retrying");
                std::thread::sleep(CONNECT_RETRY_INTERVAL.min(remaining));
            }
            Err(source) => {
                return Err(TransportError::ConnectionFailed {
                    endpoint: endpoint.clone(),
                    timeout,
                    source,
                });
            }
        }
    }
}

fn connect_once(endpoint: &Endpoint, timeout: Duration) -> std::io::Result<IpcStream> {
    match endpoint {
        Endpoint::Tcp { port } => crate::tcp::connect(*port, timeout),
        #[cfg(unix)]
        Endpoint::Pipe { name } => crate::uds::connect(name),
        #[cfg(windows)]
        Endpoint::Pipe { name } => crate::pipe::connect(name),
        #[cfg(not(any(unix, windows)))]
        Endpoint::Pipe { .. } => Err(std::io::Error::new(
            ErrorKind::Unsupported,
            "pipe transport unavailable",
        )),
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    // ERROR_PIPE_BUSY: every instance of the named pipe is taken right now.
    #[cfg(windows)]
    if err.raw_os_error() == Some(231) {
        return true;
    }
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::NotFound
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
    )
}

/// A bound listener for one endpoint.
pub struct Acceptor {
    inner: AcceptorInner,
    endpoint: Endpoint,
}

enum AcceptorInner {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(crate::uds::UdsListener),
    #[cfg(windows)]
    Pipe(crate::pipe::PipeListener),
}

/// Bind a listener on the endpoint.
///
/// For TCP port 0 the bound port is reported by [`Acceptor::endpoint`].
pub fn listen(endpoint: &Endpoint) -> Result<Acceptor> {
    match endpoint {
        Endpoint::Tcp { port } => {
            let listener = crate::tcp::bind(*port).map_err(|source| TransportError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
            let port = listener.local_addr().map_err(TransportError::Io)?.port();
            Ok(Acceptor {
                inner: AcceptorInner::Tcp(listener),
                endpoint: Endpoint::Tcp { port },
            })
        }
        #[cfg(unix)]
        Endpoint::Pipe { name } => {
            validate_pipe_name(name)?;
            let listener = crate::uds::UdsListener::bind(name)?;
            Ok(Acceptor {
                inner: AcceptorInner::Unix(listener),
                endpoint: endpoint.clone(),
            })
        }
        #[cfg(windows)]
        Endpoint::Pipe { name } => {
            validate_pipe_name(name)?;
            let listener =
                crate::pipe::PipeListener::bind(name).map_err(|source| TransportError::Bind {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            Ok(Acceptor {
                inner: AcceptorInner::Pipe(listener),
                endpoint: endpoint.clone(),
            })
        }
        #[cfg(not(any(unix, windows)))]
        Endpoint::Pipe { .. } => Err(TransportError::Unsupported(TransportKind::Pipe)),
    }
}

impl Acceptor {
    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        let stream = match &self.inner {
            AcceptorInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%addr, "accepted tcp connection");
                IpcStream::from_tcp(stream)?
            }
            #[cfg(unix)]
            AcceptorInner::Unix(listener) => listener.accept()?,
            #[cfg(windows)]
            AcceptorInner::Pipe(listener) => listener.accept().map_err(TransportError::Accept)?,
        };
        Ok(stream)
    }

    /// The endpoint this acceptor is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Unblock a thread parked in [`Acceptor::accept`] by connecting to ourselves.
    ///
    /// Used during shutdown; the resulting stream is dropped immediately.
    pub fn wake(&self) {
        let _ = connect_once(&self.endpoint, Duration::from_millis(200));
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
