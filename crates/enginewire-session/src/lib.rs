//! Host and engine sessions.
//!
//! [`HostSession`] launches an engine process, waits for it to become ready
//! and keeps the newest rendered frame available through a background
//! [`FramePipeline`]. [`EngineSession`] is the other end: it serves host
//! calls and reports engine events back.

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod readiness;

pub use cancel::CancelToken;
pub use config::{
    HostConfig, AUTO_LOCATION, DEFAULT_READINESS_TIMEOUT, DEFAULT_SHUTDOWN_GRACE,
    DEFAULT_WATCHDOG_INTERVAL,
};
pub use dispatch::{DispatchQueue, OnReply};
pub use engine::EngineSession;
pub use error::{Result, SessionError};
pub use host::HostSession;
pub use pipeline::{Frame, FramePipeline, PipelineStats, PixelSource};
pub use readiness::Readiness;
