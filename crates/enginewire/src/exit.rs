use std::fmt;
use std::io;

use enginewire_process::ProcessError;
use enginewire_rpc::RpcError;
use enginewire_session::SessionError;
use enginewire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
/// The engine exited without being asked to.
pub const ENGINE_CRASHED: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const NOT_FOUND: i32 = 127;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound => NOT_FOUND,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidLocation { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Transport(err) => transport_error(context, err),
        RpcError::CallTimedOut { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        RpcError::MalformedMessage(_) | RpcError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        RpcError::NotConnected | RpcError::HandshakeFailed(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn process_error(context: &str, err: ProcessError) -> CliError {
    match err {
        ProcessError::ProcessSpawnFailed { source, .. } => io_error(context, source),
        ProcessError::InvalidSetting { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        ProcessError::Transport(err) => transport_error(context, err),
        ProcessError::Io(source) => io_error(context, source),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::ReadinessTimeout { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        SessionError::EngineExited { .. } => {
            CliError::new(ENGINE_CRASHED, format!("{context}: {err}"))
        }
        SessionError::InvalidResolution { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        SessionError::NotConnected => CliError::new(FAILURE, format!("{context}: {err}")),
        SessionError::Rpc(err) => rpc_error(context, err),
        SessionError::Process(err) => process_error(context, err),
        SessionError::Transport(err) => transport_error(context, err),
    }
}
