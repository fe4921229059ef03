//! Engine process supervision.
//!
//! Builds the engine command line from [`EngineSettings`], spawns the engine
//! with its output routed to a [`LogSink`], tracks its lifecycle and tears
//! down the whole process tree, so no engine or engine child outlives the
//! host.

pub mod args;
pub mod error;
#[cfg(windows)]
pub mod job;
pub mod logs;
pub mod process;
pub mod settings;
pub mod state;
#[cfg(unix)]
pub mod tree;

pub use args::ArgsBuilder;
pub use error::{ProcessError, Result};
pub use logs::{JsonLogLine, LogSeverity, LogSink, LogStream, NullLogSink, TracingLogSink};
pub use process::{is_alive, kill_tree, spawn, EngineProcess, DEFAULT_KILL_GRACE};
pub use settings::{EngineSettings, PopupAction, ProxySettings};
pub use state::{EngineState, StateMachine};
