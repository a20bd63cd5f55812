//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!             ├── Room (doc_id) ── ReplicatedDocument ── BroadcastGroup
//! Session B ──┘                          │
//!                           ┌────────────┼────────────┐
//!                           ▼            ▼            ▼
//!                       Session A    Session B    Session C
//! ```
//!
//! Each document room holds:
//! - A `ReplicatedDocument` with every operation the room has seen, used to
//!   answer `SyncStep1` with exactly what a reconnecting session is missing
//! - A `BroadcastGroup` for fan-out to connected peers, with their presence
//!
//! Rooms stay in memory after the last peer leaves so later sessions can
//! resync against them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ConnectionToken};
use crate::crdt::{DocumentSnapshot, ReplicatedDocument};
use crate::protocol::{MessageType, SyncMessage, SyncReply};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room; further joins are revoked
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub relayed_operations: u64,
}

/// Document room: replicated document + broadcast group.
struct DocumentRoom {
    doc: ReplicatedDocument,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: ReplicatedDocument::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, DocumentRoom>>>;

/// The relay server. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

/// Per-connection state once the peer has joined.
struct Membership {
    peer_id: Uuid,
    token: ConnectionToken,
    doc_id: Uuid,
    broadcast: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Reject every session of a document. Sessions receive `Revoked` and
    /// their links are closed; they do not reconnect.
    pub async fn revoke(&self, doc_id: Uuid, reason: &str) -> Result<usize, BoxError> {
        let broadcast = {
            let rooms = self.rooms.read().await;
            rooms.get(&doc_id).map(|room| room.broadcast.clone())
        };
        let Some(broadcast) = broadcast else {
            return Ok(0);
        };
        let notified = broadcast.broadcast(&SyncMessage::revoked(doc_id, reason)?)?;
        log::info!("Revoked {notified} sessions of doc {doc_id}: {reason}");
        Ok(notified)
    }

    /// Visible text the room currently holds for `doc_id`.
    pub async fn document_snapshot(&self, doc_id: Uuid) -> Option<DocumentSnapshot> {
        let rooms = self.rooms.read().await;
        rooms.get(&doc_id).map(|room| room.doc.snapshot())
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Membership> = None;
        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match SyncMessage::decode(&bytes) {
                                Ok(sync_msg) => {
                                    {
                                        let mut s = self.stats.write().await;
                                        s.total_messages += 1;
                                        s.total_bytes += bytes.len() as u64;
                                    }
                                    match self.on_message(sync_msg, bytes, &mut member, &mut ws_sender).await {
                                        Ok(true) => {}
                                        Ok(false) => break Ok(()),
                                        Err(e) => break Err(e),
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                msg = recv_broadcast(&mut member) => {
                    match msg {
                        Ok(data) => match self.forward(&data, &member, &mut ws_sender).await {
                            Ok(true) => {}
                            Ok(false) => break Ok(()),
                            Err(e) => break Err(e),
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer at {addr} lagged by {n} messages");
                            if let Some(m) = &member {
                                m.broadcast.record_lag(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        if let Some(m) = member {
            match m.broadcast.remove_peer(&m.peer_id, m.token).await {
                Some(departure) if departure.last_for_user => {
                    let user_id = departure.presence.user_id;
                    match SyncMessage::peer_left(m.peer_id, m.doc_id, user_id) {
                        Ok(leave_msg) => {
                            let _ = m.broadcast.broadcast(&leave_msg);
                        }
                        Err(e) => log::error!("Cannot encode PeerLeft: {e}"),
                    }
                    log::info!("Peer {} left doc {}", m.peer_id, m.doc_id);
                }
                Some(_) => log::info!(
                    "Peer {} left doc {}; its user is still connected",
                    m.peer_id,
                    m.doc_id
                ),
                None => log::debug!("Stale connection for peer {} closed", m.peer_id),
            }
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Handle one frame from the connected peer. `Ok(false)` ends the connection.
    async fn on_message(
        &self,
        msg: SyncMessage,
        raw: Vec<u8>,
        member: &mut Option<Membership>,
        ws_sender: &mut WsSender,
    ) -> Result<bool, BoxError> {
        match msg.msg_type {
            MessageType::Join => {
                if member.is_some() {
                    log::debug!("Duplicate Join from {}", msg.peer_id);
                    return Ok(true);
                }
                let info = match msg.presence_info() {
                    Ok(info) => info,
                    Err(e) => {
                        log::warn!("Rejecting Join from {}: {e}", msg.peer_id);
                        return Ok(false);
                    }
                };

                let (broadcast, room_count) = {
                    let mut rooms = self.rooms.write().await;
                    let room = rooms
                        .entry(msg.doc_id)
                        .or_insert_with(|| DocumentRoom::new(self.config.broadcast_capacity));
                    (room.broadcast.clone(), rooms.len())
                };

                if broadcast.peer_count().await >= self.config.max_peers_per_room {
                    log::warn!("Room {} is full; revoking {}", msg.doc_id, msg.peer_id);
                    let revoked = SyncMessage::revoked(msg.doc_id, "room is full")?;
                    ws_sender.send(Message::Binary(revoked.encode()?.into())).await?;
                    return Ok(false);
                }

                // Tell the newcomer who is already here.
                for (peer_id, presence) in broadcast.peers().await {
                    let existing = SyncMessage::presence(peer_id, msg.doc_id, &presence)?;
                    ws_sender.send(Message::Binary(existing.encode()?.into())).await?;
                }

                let (token, rx) = broadcast.add_peer(msg.peer_id, info.clone()).await;
                broadcast.broadcast_raw(Arc::new(raw));
                self.stats.write().await.active_rooms = room_count;

                log::info!(
                    "Peer {} ({}) joined doc {}",
                    info.display_name,
                    msg.peer_id,
                    msg.doc_id
                );
                *member = Some(Membership {
                    peer_id: msg.peer_id,
                    token,
                    doc_id: msg.doc_id,
                    broadcast,
                    rx,
                });
            }

            MessageType::SyncStep1 => {
                let Some(m) = member.as_ref() else {
                    log::debug!("SyncStep1 before Join from {}", msg.peer_id);
                    return Ok(true);
                };
                let summary = match msg.summary() {
                    Ok(summary) => summary,
                    Err(e) => {
                        log::warn!("Bad SyncStep1 from {}: {e}", msg.peer_id);
                        return Ok(true);
                    }
                };
                let reply = {
                    let rooms = self.rooms.read().await;
                    rooms.get(&m.doc_id).map(|room| SyncReply {
                        operations: room.doc.ops_missing_from(&summary),
                        summary: room.doc.version_summary(),
                    })
                };
                if let Some(reply) = reply {
                    log::debug!(
                        "SyncStep2 to {}: {} operations",
                        msg.peer_id,
                        reply.operations.len()
                    );
                    let response = SyncMessage::sync_step2(Uuid::nil(), m.doc_id, &reply)?;
                    ws_sender.send(Message::Binary(response.encode()?.into())).await?;
                }
            }

            MessageType::Operations => {
                let Some(m) = member.as_ref() else {
                    return Ok(true);
                };
                let ops = match msg.operation_batch() {
                    Ok(ops) => ops,
                    Err(e) => {
                        log::warn!("Dropping operation batch from {}: {e}", msg.peer_id);
                        return Ok(true);
                    }
                };
                let accepted = {
                    let mut rooms = self.rooms.write().await;
                    rooms
                        .get_mut(&m.doc_id)
                        .map_or(0, |room| room.doc.apply_remote(ops))
                };
                if accepted > 0 {
                    self.stats.write().await.relayed_operations += accepted as u64;
                    m.broadcast.broadcast_raw(Arc::new(raw));
                }
            }

            MessageType::Presence => {
                let Some(m) = member.as_ref() else {
                    return Ok(true);
                };
                match msg.presence_info() {
                    Ok(info) => {
                        m.broadcast.update_presence(&m.peer_id, m.token, info).await;
                        m.broadcast.broadcast_raw(Arc::new(raw));
                    }
                    Err(e) => log::warn!("Dropping presence from {}: {e}", msg.peer_id),
                }
            }

            MessageType::Ping => {
                let pong = SyncMessage::pong(Uuid::nil());
                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
            }

            _ => {
                log::debug!("Unhandled message type: {:?}", msg.msg_type);
            }
        }
        Ok(true)
    }

    /// Relay a room frame to this peer. `Ok(false)` ends the connection.
    async fn forward(
        &self,
        data: &[u8],
        member: &Option<Membership>,
        ws_sender: &mut WsSender,
    ) -> Result<bool, BoxError> {
        let own_id = member.as_ref().map(|m| m.peer_id);
        let msg_type = match SyncMessage::decode(data) {
            Ok(msg) => {
                if Some(msg.peer_id) == own_id {
                    return Ok(true);
                }
                msg.msg_type
            }
            Err(_) => return Ok(true),
        };

        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
        if msg_type == MessageType::Revoked {
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn recv_broadcast(
    member: &mut Option<Membership>,
) -> Result<Arc<Vec<u8>>, broadcast::error::RecvError> {
    match member {
        Some(m) => m.rx.recv().await,
        None => std::future::pending().await,
    }
}
