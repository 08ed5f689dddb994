//! Session lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of one printer session.
///
/// `IDLE → DISCOVERING → CONNECTING → REGISTERING → READY`, with `DEGRADED`
/// when heartbeats go missing, `RECONNECTING` reachable from any non-terminal
/// state on transport failure, and `CLOSED` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Discovering,
    Connecting,
    Registering,
    Ready,
    /// Transport alive but recent heartbeats missing. Tolerated for the
    /// degraded-grace window, then forced into `Reconnecting`.
    Degraded,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether commands can be sent in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Discovering => "discovering",
            SessionState::Connecting => "connecting",
            SessionState::Registering => "registering",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(label)
    }
}
