//! Presence: who else has this document open.
//!
//! ## Architecture
//!
//! ```text
//! presence tick (every broadcast_interval)
//!       │
//!       ▼
//! PresenceTracker::broadcast_self() ──► SyncMessage::Presence ──► server
//!                                                                   │
//!       ┌───────────────────────────────────────────────────────────┘
//!       ▼
//! PresenceTracker::on_remote_presence()   (upsert, refresh last_seen_at)
//!       │
//!       ▼
//! PresenceTracker::sweep()   (drop peers silent for missed_intervals ticks)
//!       │
//!       ▼
//! others()  ── ordered by first-seen
//! ```
//!
//! Presence is ephemeral: nothing here is persisted or merged through the
//! CRDT. Liveness is purely time-based on the receiving side.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;


// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// RGBA color used to tint a participant's avatar and caret.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl UserColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// The hue is derived from the UUID hash; saturation and lightness are
    /// fixed so every participant gets an equally vivid color.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// `#rrggbb` form for UI layers that speak CSS.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for UserColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// The user operating this session. Immutable for the session lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: Uuid,
    pub display_name: String,
    pub color: UserColor,
    pub icon: Option<String>,
}

impl LocalUser {
    /// New user with a random id and a color derived from it.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), display_name)
    }

    /// Identity supplied by the auth collaborator.
    pub fn with_id(id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            color: UserColor::from_uuid(id),
            icon: None,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire payload
// ───────────────────────────────────────────────────────────────────

/// Periodic presence announcement, carried in `Join` and `Presence` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceBroadcast {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: UserColor,
    pub icon: Option<String>,
}

impl From<&LocalUser> for PresenceBroadcast {
    fn from(user: &LocalUser) -> Self {
        Self {
            user_id: user.id,
            display_name: user.display_name.clone(),
            color: user.color,
            icon: user.icon.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the local user is announced.
    pub broadcast_interval: Duration,
    /// Broadcasts a peer may miss before it is considered gone.
    pub missed_intervals: u32,
}

impl PresenceConfig {
    pub fn liveness_timeout(&self) -> Duration {
        self.broadcast_interval * self.missed_intervals
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_secs(5),
            missed_intervals: 3,
        }
    }
}

/// A remote participant as seen by this session.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub color: UserColor,
    pub icon: Option<String>,
    pub last_seen_at: Instant,
    /// Arrival counter; stable render order.
    first_seen: u64,
}

impl PresenceEntry {
    fn refresh(&mut self, msg: &PresenceBroadcast, now: Instant) -> bool {
        let changed = self.display_name != msg.display_name
            || self.color != msg.color
            || self.icon != msg.icon;
        self.display_name.clone_from(&msg.display_name);
        self.color = msg.color;
        self.icon.clone_from(&msg.icon);
        self.last_seen_at = now;
        changed
    }
}

/// Tracks remote participants of one document session.
pub struct PresenceTracker {
    local: LocalUser,
    config: PresenceConfig,
    peers: HashMap<Uuid, PresenceEntry>,
    arrivals: u64,
}

impl PresenceTracker {
    pub fn new(local: LocalUser, config: PresenceConfig) -> Self {
        Self {
            local,
            config,
            peers: HashMap::new(),
            arrivals: 0,
        }
    }

    pub fn local_user(&self) -> &LocalUser {
        &self.local
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Build the announcement for the local user.
    pub fn broadcast_self(&self) -> PresenceBroadcast {
        PresenceBroadcast::from(&self.local)
    }

    /// Upsert a remote participant. Returns true if `others()` changed.
    ///
    /// Announcements for the local user (another tab of the same account)
    /// are ignored.
    pub fn on_remote_presence(&mut self, msg: &PresenceBroadcast, now: Instant) -> bool {
        if msg.user_id == self.local.id {
            return false;
        }

        match self.peers.get_mut(&msg.user_id) {
            Some(entry) => entry.refresh(msg, now),
            None => {
                self.arrivals += 1;
                self.peers.insert(
                    msg.user_id,
                    PresenceEntry {
                        user_id: msg.user_id,
                        display_name: msg.display_name.clone(),
                        color: msg.color,
                        icon: msg.icon.clone(),
                        last_seen_at: now,
                        first_seen: self.arrivals,
                    },
                );
                log::debug!("Presence: {} ({}) appeared", msg.display_name, msg.user_id);
                true
            }
        }
    }

    /// Remove a participant immediately (server announced departure).
    pub fn remove(&mut self, user_id: &Uuid) -> bool {
        self.peers.remove(user_id).is_some()
    }

    /// Drop participants not heard from within the liveness timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.config.liveness_timeout();
        let stale: Vec<Uuid> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen_at) > timeout)
            .map(|p| p.user_id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
            log::debug!("Presence: {id} expired");
        }
        stale
    }

    /// Remote participants, ordered by first-seen.
    pub fn others(&self) -> Vec<PresenceEntry> {
        let mut others: Vec<PresenceEntry> = self.peers.values().cloned().collect();
        others.sort_by_key(|p| p.first_seen);
        others
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PresenceEntry> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
