//! Drive an out-of-process rendering engine.
//!
//! A host launches the engine, sends it input and navigation calls, streams
//! its rendered frames and reacts to the events it reports. The engine can
//! crash, hang or be killed at any time; the host notices and never leaves
//! an engine process (or anything the engine started) behind.
//!
//! # Crate Structure
//!
//! - [`transport`]: loopback TCP and local pipe connections
//! - [`frame`]: length-prefixed frames shared by every connection
//! - [`protocol`]: the fixed message set and its binary encoding
//! - [`rpc`]: handshake, blocking calls and notifications
//! - [`process`]: engine command line, spawning, log capture and kill-tree
//! - [`session`]: host and engine sessions, frame pipeline, input queue

/// Re-export transport types.
pub mod transport {
    pub use enginewire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use enginewire_frame::*;
}

/// Re-export message types.
pub mod protocol {
    pub use enginewire_protocol::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use enginewire_rpc::*;
}

/// Re-export process supervision types.
pub mod process {
    pub use enginewire_process::*;
}

/// Re-export session types.
pub mod session {
    pub use enginewire_session::*;
}

pub use enginewire_process::EngineSettings;
pub use enginewire_protocol::{Color, EngineCall, HostNotification, PopupId, Reply, Resolution};
pub use enginewire_rpc::{EngineControls, HostEvents};
pub use enginewire_session::{EngineSession, HostConfig, HostSession, SessionError};
