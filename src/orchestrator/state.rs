//! Orchestrator lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "reason")]
pub enum OrchestratorState {
    #[default]
    Initializing,
    Ready,
    Running,
    Paused,
    ShutdownInProgress,
    Shutdown,
    Error(String),
}

impl OrchestratorState {
    /// Check if this state allows transitioning to `target`.
    pub fn can_transition_to(&self, target: &OrchestratorState) -> bool {
        use OrchestratorState::*;

        matches!(
            (self, target),
            // Startup
            (Initializing, Ready) | (Initializing, Error(_)) |
            (Error(_), Ready) | (Error(_), Error(_)) |
            // Running
            (Ready, Running) | (Paused, Running) |
            (Ready, Paused) | (Paused, Ready) |
            (Running, Paused) | (Running, Error(_)) | (Paused, Error(_)) |
            // Teardown
            (Initializing, ShutdownInProgress) | (Ready, ShutdownInProgress) |
            (Running, ShutdownInProgress) | (Paused, ShutdownInProgress) |
            (Error(_), ShutdownInProgress) |
            (ShutdownInProgress, Shutdown)
        )
    }

    /// `Shutdown` or on the way there.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShutdownInProgress | Self::Shutdown)
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => f.write_str("initializing"),
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::ShutdownInProgress => f.write_str("shutting down"),
            Self::Shutdown => f.write_str("shut down"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// A recorded lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: OrchestratorState,
    pub to: OrchestratorState,
    pub timestamp: DateTime<Utc>,
}
