use std::fmt;

use tracing::debug;

use crate::error::{ProcessError, Result};

/// Lifecycle of an engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Started, not yet signalled readiness.
    Spawned,
    /// Readiness received; the host is connecting.
    Ready,
    /// Fully connected and serving.
    Running,
    /// Graceful exit requested.
    ShuttingDown,
    /// Exited or killed. Terminal.
    Terminated,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Spawned => "spawned",
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::ShuttingDown => "shutting_down",
            EngineState::Terminated => "terminated",
        }
    }

    /// Forward-only: any live state may shut down or terminate directly
    /// (timeout, crash), but nothing leaves `Terminated`.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Spawned, Ready)
                | (Ready, Running)
                | (Spawned | Ready | Running, ShuttingDown)
                | (Spawned | Ready | Running | ShuttingDown, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == EngineState::Terminated
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checked holder of an [`EngineState`], with the states it passed through.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: EngineState,
    history: Vec<EngineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: EngineState::Spawned,
            history: vec![EngineState::Spawned],
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> EngineState {
        self.state
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[EngineState] {
        &self.history
    }

    pub fn transition(&mut self, next: EngineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ProcessError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = %self.state, to = %next, "engine state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Terminated` from wherever we are. No-op if already there.
    pub fn terminate(&mut self) {
        if !self.state.is_terminal() {
            debug!(from = %self.state, "engine terminated");
            self.state = EngineState::Terminated;
            self.history.push(EngineState::Terminated);
        }
    }
}
