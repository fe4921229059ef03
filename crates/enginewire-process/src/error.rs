use std::io;
use std::path::PathBuf;

use crate::state::EngineState;

/// Errors raised while launching or supervising an engine process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The executable could not be started. Terminal for the session.
    #[error("failed to spawn engine '{}': {source}", executable.display())]
    ProcessSpawnFailed {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid engine state transition {from} -> {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("invalid engine setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] enginewire_transport::TransportError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
