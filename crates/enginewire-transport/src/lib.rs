//! Transports carrying host/engine traffic.
//!
//! Two families are supported and chosen once per session:
//! - loopback TCP, addressed by port
//! - local pipes, addressed by name: a Unix domain socket on Unix, a named
//!   pipe on Windows
//!
//! Everything above this crate sees only [`IpcStream`].

pub mod endpoint;
pub mod error;
pub mod stream;

mod tcp;

#[cfg(unix)]
pub mod uds;

#[cfg(windows)]
pub mod pipe;

pub use endpoint::{connect, listen, Acceptor, Endpoint, TransportKind};
pub use error::{Result, TransportError};
pub use stream::IpcStream;

#[cfg(unix)]
pub use uds::UdsListener;

#[cfg(windows)]
pub use pipe::PipeListener;
