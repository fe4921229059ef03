//! Loopback TCP. Both peers live on the same machine, so nothing here ever
//! binds or dials a non-loopback address.

use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use tracing::info;

use crate::endpoint::Endpoint;
use crate::stream::IpcStream;

pub(crate) fn bind(port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(Endpoint::socket_addr(port))?;
    info!(addr = %listener.local_addr()?, "listening on loopback tcp");
    Ok(listener)
}

pub(crate) fn connect(port: u16, timeout: Duration) -> std::io::Result<IpcStream> {
    let stream = TcpStream::connect_timeout(&Endpoint::socket_addr(port), timeout)?;
    IpcStream::from_tcp(stream)
}
