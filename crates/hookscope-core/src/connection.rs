//! Externally observable connection state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of the broker subscription.
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──ok──▶ Connected
///      ▲                        │                  │
///      │                      fail           subscription fault
///  disconnect                   ▼                  ▼
///      └──────────────────── Error ◀───────────────┘
///                               │
///                           reconnect ──▶ Connecting
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Last connect attempt or the live subscription failed.
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns true if a connect or reconnect request is legal from here.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }

    /// Short lowercase label for logs and status lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error: {reason}"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Observational sub-state of the reconnection flow.
///
/// Purely informational: the supervisor drives it, nothing reads it to
/// make decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconnectState {
    #[default]
    Idle,
    Attempting { attempt: u32, max: u32 },
    Succeeded,
    /// Retries exhausted; only an explicit reconnect leaves this state.
    Failed,
}

impl ReconnectState {
    pub fn is_attempting(&self) -> bool {
        matches!(self, Self::Attempting { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for ReconnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Attempting { attempt, max } => write!(f, "attempting {attempt}/{max}"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_defaults_to_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_can_connect_only_from_rest_states() {
        assert!(ConnectionState::Disconnected.can_connect());
        assert!(ConnectionState::Error("refused".into()).can_connect());
        assert!(!ConnectionState::Connecting.can_connect());
        assert!(!ConnectionState::Connected.can_connect());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Error("timed out".into()).to_string(),
            "error: timed out"
        );
    }

    #[test]
    fn test_reconnect_state_display() {
        let state = ReconnectState::Attempting { attempt: 2, max: 5 };
        assert_eq!(state.to_string(), "attempting 2/5");
        assert!(state.is_attempting());
        assert!(ReconnectState::Failed.is_failed());
    }

    #[test]
    fn test_connection_state_serializes_reason() {
        let json = serde_json::to_string(&ConnectionState::Error("boom".into())).unwrap();
        assert!(json.contains("\"state\":\"error\""));
        assert!(json.contains("boom"));
    }
}
