//! Bidirectional message transport between a session and the relay.
//!
//! A [`Connector`] opens one [`TransportLink`] per connection attempt. The
//! link is a pair of channels: encoded frames out, [`TransportEvent`]s in.
//! Closure and failure are delivered as events, never as panics.
//!
//! [`WebSocketConnector`] is the production transport.
//! [`MemoryConnector`] wires a session to an in-process peer.

use std::sync::{Arc, Mutex};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Frames buffered per direction before senders wait.
const LINK_CAPACITY: usize = 256;

/// What a link delivers to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An encoded [`SyncMessage`].
    Message(Vec<u8>),
    /// The remote end closed the link.
    Closed(String),
    /// The link failed.
    Error(String),
}

/// One open connection. Dropping it tears the connection down.
pub struct TransportLink {
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl TransportLink {
    /// Build a link from raw channels.
    pub fn new(outgoing: mpsc::Sender<Vec<u8>>, incoming: mpsc::Receiver<TransportEvent>) -> Self {
        Self {
            outgoing,
            incoming,
            reader: None,
        }
    }

    fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Queue an encoded frame.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn send_message(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        self.send(msg.encode()?).await
    }

    /// Next event. A link whose remote half is gone reports `Closed`.
    pub async fn recv(&mut self) -> TransportEvent {
        match self.incoming.recv().await {
            Some(event) => event,
            None => TransportEvent::Closed("transport dropped".to_string()),
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        // The writer task exits on its own once `outgoing` is dropped.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("closed", &self.outgoing.is_closed())
            .finish()
    }
}

/// Opens transport links for a document.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        server_url: &str,
        document_id: Uuid,
    ) -> BoxFuture<'static, Result<TransportLink, ProtocolError>>;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

/// Binary-frame WebSocket transport. Connects to `{server_url}/{document_id}`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }

    async fn open(url: String) -> Result<TransportLink, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::debug!("WebSocket connected to {url}");

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(LINK_CAPACITY);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        });

        // Reader task: turn frames into transport events
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Binary(data)) => TransportEvent::Message(data.into()),
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                        let _ = in_tx.send(TransportEvent::Closed(reason)).await;
                        return;
                    }
                    Err(e) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                    _ => continue,
                };
                if in_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = in_tx
                .send(TransportEvent::Closed("stream ended".to_string()))
                .await;
        });

        Ok(TransportLink::new(out_tx, in_rx).with_reader(reader))
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        server_url: &str,
        document_id: Uuid,
    ) -> BoxFuture<'static, Result<TransportLink, ProtocolError>> {
        let url = format!("{}/{}", server_url.trim_end_matches('/'), document_id);
        Self::open(url).boxed()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process
// ───────────────────────────────────────────────────────────────────

/// The far end of a [`MemoryConnector`] link.
pub struct MemoryPeer {
    pub document_id: Uuid,
    from_session: mpsc::Receiver<Vec<u8>>,
    to_session: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Next message the session sent, or `None` once the session dropped the link.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            let frame = self.from_session.recv().await?;
            match SyncMessage::decode(&frame) {
                Ok(msg) => return Some(msg),
                Err(e) => log::warn!("MemoryPeer: undecodable frame: {e}"),
            }
        }
    }

    pub async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        self.send_event(TransportEvent::Message(msg.encode()?)).await
    }

    pub async fn send_event(&self, event: TransportEvent) -> Result<(), ProtocolError> {
        self.to_session
            .send(event)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the link from the remote side.
    pub async fn close(self, reason: &str) {
        let _ = self
            .to_session
            .send(TransportEvent::Closed(reason.to_string()))
            .await;
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    refusing: bool,
    refuse_next: u32,
    attempts: u32,
}

/// Connector that hands each accepted link's far end to a channel.
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
            peers,
        });
        (connector, accepted)
    }

    /// Refuse every attempt until switched back.
    pub fn set_refusing(&self, refusing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.refusing = refusing;
        }
    }

    /// Refuse the next `n` attempts.
    pub fn refuse_next(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.refuse_next = n;
        }
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.state.lock().map(|s| s.attempts).unwrap_or(0)
    }

    fn admit(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.attempts += 1;
        if state.refusing {
            return false;
        }
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return false;
        }
        true
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        _server_url: &str,
        document_id: Uuid,
    ) -> BoxFuture<'static, Result<TransportLink, ProtocolError>> {
        let result = if self.admit() {
            let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
            let peer = MemoryPeer {
                document_id,
                from_session: out_rx,
                to_session: in_tx,
            };
            match self.peers.send(peer) {
                Ok(()) => Ok(TransportLink::new(out_tx, in_rx)),
                Err(_) => Err(ProtocolError::Connect("no acceptor".to_string())),
            }
        } else {
            Err(ProtocolError::Connect("connection refused".to_string()))
        };
        futures_util::future::ready(result).boxed()
    }
}
