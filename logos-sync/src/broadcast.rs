//! Room fan-out for the relay.
//!
//! Every frame is encoded once and shared as `Arc<Vec<u8>>` across all
//! connections in the room. Each peer gets an independent receiver that buffers up to `capacity` messages;
//! a peer that falls further behind loses the oldest frames and must resync.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::PresenceBroadcast;
use crate::protocol::{ProtocolError, SyncMessage};

/// Relay counters for one room.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Distinguishes successive connections that joined under the same peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken(u64);

/// Returned by [`BroadcastGroup::remove_peer`].
#[derive(Debug, Clone)]
pub struct Departure {
    pub presence: PresenceBroadcast,
    /// No connection left in the room belongs to the same user.
    pub last_for_user: bool,
}

struct PeerSlot {
    presence: PresenceBroadcast,
    token: ConnectionToken,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Connections attached to one document.
///
/// Peers are keyed by replica id and carry their latest presence, so a
/// joining peer can be told who is already there.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerSlot>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
    next_token: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
            next_token: AtomicU64::new(0),
        }
    }

    /// Add a peer. A rejoin under the same id takes over the slot.
    /// Returns the connection's token and its receiver.
    pub async fn add_peer(
        &self,
        peer_id: Uuid,
        presence: PresenceBroadcast,
    ) -> (ConnectionToken, broadcast::Receiver<Arc<Vec<u8>>>) {
        let token = ConnectionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, PeerSlot { presence, token });
        (token, self.sender.subscribe())
    }

    /// Refresh a connected peer's presence. Slots owned by another
    /// connection are left alone.
    pub async fn update_presence(
        &self,
        peer_id: &Uuid,
        token: ConnectionToken,
        presence: PresenceBroadcast,
    ) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(slot) if slot.token == token => {
                slot.presence = presence;
                true
            }
            _ => false,
        }
    }

    /// Release the slot if `token` still owns it.
    pub async fn remove_peer(&self, peer_id: &Uuid, token: ConnectionToken) -> Option<Departure> {
        let mut peers = self.peers.write().await;
        if peers.get(peer_id).map(|slot| slot.token) != Some(token) {
            return None;
        }
        let slot = peers.remove(peer_id)?;
        let user_id = slot.presence.user_id;
        Some(Departure {
            last_for_user: !peers.values().any(|other| other.presence.user_id == user_id),
            presence: slot.presence,
        })
    }

    /// Encode once and send to every receiver. Filtering the sender is the
    /// receiver's job. Returns the number of receivers.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Connected peers and their presence, in no particular order.
    pub async fn peers(&self) -> Vec<(Uuid, PresenceBroadcast)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.presence.clone()))
            .collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
