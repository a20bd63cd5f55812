//! Stall watchdog.
//!
//! Armed when the session drops into `Reconnecting` or `Disconnected`,
//! disarmed as soon as it is `Connected` or `Synced` again. If it stays armed
//! for the full threshold it fires exactly once; the owner turns that into a
//! `Stalled` event. Firing never touches the state machine.

use std::time::Duration;
use tokio::time::Instant;

use crate::state::ConnectionState;

#[derive(Debug, Clone)]
pub struct TimeoutWatchdog {
    threshold: Duration,
    armed_at: Option<Instant>,
    fired: bool,
}

impl TimeoutWatchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            armed_at: None,
            fired: false,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Start the timer. Already armed (or already fired) is a no-op, so
    /// repeated failures do not push the deadline out.
    pub fn arm(&mut self, now: Instant) {
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
            self.fired = false;
        }
    }

    pub fn disarm(&mut self) {
        self.armed_at = None;
        self.fired = false;
    }

    /// Follow a state change.
    pub fn observe(&mut self, state: ConnectionState, now: Instant) {
        match state {
            ConnectionState::Reconnecting | ConnectionState::Disconnected => self.arm(now),
            ConnectionState::Connected | ConnectionState::Synced => self.disarm(),
            ConnectionState::Connecting => {}
        }
    }

    /// When the pending signal is due, if one is.
    pub fn deadline(&self) -> Option<Instant> {
        match self.armed_at {
            Some(at) if !self.fired => Some(at + self.threshold),
            _ => None,
        }
    }

    /// Returns true exactly once per arming, at or after the deadline.
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.fired = true;
                true
            }
            _ => false,
        }
    }
}
