//! Connection state machine.
//!
//! ```text
//!            opened              reconciled
//! Connecting ──────► Connected ────────────► Synced
//!     │                ▲   │                   │
//!     │ failed         │   │ closed/error      │ closed/error
//!     ▼                │   ▼                   │
//! Reconnecting ◄───────┼───┴───────────────────┘
//!     │    opened      │
//!     └────────────────┘
//!
//! any ──(caller close | revoked | retries exhausted)──► Disconnected (terminal)
//! ```
//!
//! After every reconnect the session must pass through `Connected` before
//! `Synced`: remote state may have diverged while offline.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Synced,
    Reconnecting,
    Disconnected,
}

impl ConnectionState {
    /// A live link exists (handshake may still be pending).
    pub fn is_online(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Synced)
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Disconnected
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Connecting, Connected)
            | (Connecting, Reconnecting)
            | (Connected, Synced)
            | (Connected, Reconnecting)
            | (Synced, Reconnecting)
            | (Reconnecting, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Synced => "synced",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Why a session ended up `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller closed the session.
    ClosedByCaller,
    /// The server rejected the session; carries the server's reason.
    Revoked(String),
    /// The reconnect policy ran out of attempts.
    RetriesExhausted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClosedByCaller => f.write_str("closed by caller"),
            DisconnectReason::Revoked(reason) => write!(f, "revoked by server: {reason}"),
            DisconnectReason::RetriesExhausted => f.write_str("reconnect attempts exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("illegal connection state transition {from} -> {to}")]
    Illegal {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Single authoritative connection state of one session.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    has_synced: bool,
    reason: Option<DisconnectReason>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            has_synced: false,
            reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether `Synced` was reached at least once.
    pub fn has_synced(&self) -> bool {
        self.has_synced
    }

    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.reason.as_ref()
    }

    /// Move to `to`. Returns `Ok(None)` when already there.
    pub fn transition(&mut self, to: ConnectionState) -> Result<Option<Transition>, StateError> {
        let from = self.state;
        if from == to {
            return Ok(None);
        }
        if !from.can_transition_to(to) {
            return Err(StateError::Illegal { from, to });
        }
        self.state = to;
        if to == ConnectionState::Synced {
            self.has_synced = true;
        }
        Ok(Some(Transition { from, to }))
    }

    /// Enter the terminal state, recording why.
    pub fn disconnect(&mut self, reason: DisconnectReason) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.reason = Some(reason);
        let from = self.state;
        self.state = ConnectionState::Disconnected;
        Some(Transition {
            from,
            to: ConnectionState::Disconnected,
        })
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
