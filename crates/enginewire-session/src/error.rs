use std::time::Duration;

use enginewire_process::ProcessError;
use enginewire_protocol::Resolution;
use enginewire_rpc::RpcError;
use enginewire_transport::TransportError;

/// The one error type an embedding application has to handle.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The engine is not (or no longer) reachable. Nothing was sent.
    #[error("not connected to the engine")]
    NotConnected,

    /// The engine never sent `Ready`. The tree rooted at `pid` has been killed.
    #[error("engine {pid} did not become ready within {timeout:?}")]
    ReadinessTimeout { timeout: Duration, pid: u32 },

    /// The surface size cannot be used. Nothing was sent to the engine.
    #[error("invalid resolution {resolution}: {reason}")]
    InvalidResolution { resolution: Resolution, reason: String },

    /// The engine exited before it became ready.
    #[error("engine exited during startup ({status})")]
    EngineExited { status: String },

    #[error(transparent)]
    Rpc(RpcError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Errors after which the session cannot be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::ReadinessTimeout { .. }
                | SessionError::EngineExited { .. }
                | SessionError::Process(ProcessError::ProcessSpawnFailed { .. })
        )
    }
}

impl From<RpcError> for SessionError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::NotConnected => SessionError::NotConnected,
            other => SessionError::Rpc(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
