//! Document session: one serialized event loop per open document.
//!
//! ```text
//!  SessionHandle ──commands──► Session task ◄──events── TransportLink
//!        ▲                       │  │  │
//!        │ watch (state, doc,    │  │  └── timers: backoff, presence,
//!        │        others)        │  │            watchdog, handshake
//!        └───────────────────────┘  └── ReplicatedDocument, PresenceTracker,
//!                                       ConnectionStateMachine
//! ```
//!
//! The task owns every piece of mutable session state, so nothing in here
//! takes a lock. Callers observe it through `watch` channels and an event
//! stream, and mutate it through commands.

use std::sync::Arc;
use std::time::Duration;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::crdt::{
    DocumentSnapshot, DocumentUpdate, EditError, Operation, ReplicaId, ReplicatedDocument,
    TextEdit, VersionSummary,
};
use crate::presence::{LocalUser, PresenceConfig, PresenceEntry, PresenceTracker};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::reconnect::{Backoff, ReconnectPolicy};
use crate::state::{ConnectionState, ConnectionStateMachine, DisconnectReason, Transition};
use crate::transport::{Connector, TransportEvent, TransportLink, WebSocketConnector};
use crate::watchdog::TimeoutWatchdog;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub document_id: Uuid,
    /// Base relay URL; the document id is appended as a path segment.
    pub server_url: String,
    /// Fixed replica id. Random when `None`.
    pub replica_id: Option<ReplicaId>,
    pub reconnect: ReconnectPolicy,
    pub presence: PresenceConfig,
    /// Time spent offline before `Stalled` is raised.
    pub stall_timeout: Duration,
    /// An opened link must finish the resync handshake within this.
    pub handshake_timeout: Duration,
    /// Shown by `document()` until the first sync or local edit.
    pub initial_snapshot: Option<DocumentSnapshot>,
    /// Buffered [`SessionEvent`]s before new ones are dropped.
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(document_id: Uuid, server_url: impl Into<String>) -> Self {
        Self {
            document_id,
            server_url: server_url.into(),
            replica_id: None,
            reconnect: ReconnectPolicy::default(),
            presence: PresenceConfig::default(),
            stall_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            initial_snapshot: None,
            event_capacity: 256,
        }
    }
}

/// Notifications delivered through [`SessionHandle::take_event_rx`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    DocumentUpdated(DocumentUpdate),
    /// Current remote participants, ordered by first-seen.
    PresenceChanged(Vec<PresenceEntry>),
    /// Offline for longer than the stall timeout. Raised once per outage.
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Edit(#[from] EditError),
}

enum Command {
    ApplyLocal {
        edit: TextEdit,
        reply: oneshot::Sender<Result<Vec<Operation>, EditError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Caller side of an open session. Dropping it tears the session down.
pub struct SessionHandle {
    document_id: Uuid,
    replica_id: ReplicaId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    document: watch::Receiver<DocumentSnapshot>,
    others: watch::Receiver<Vec<PresenceEntry>>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolve once the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    /// Current document text.
    pub fn document(&self) -> DocumentSnapshot {
        self.document.borrow().clone()
    }

    pub fn subscribe_document(&self) -> watch::Receiver<DocumentSnapshot> {
        self.document.clone()
    }

    /// Remote participants, local user excluded, ordered by first-seen.
    pub fn others(&self) -> Vec<PresenceEntry> {
        self.others.borrow().clone()
    }

    /// The event stream. Only the first call returns it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// Apply a local edit. Returns the operations it produced.
    pub async fn apply_local(&self, edit: TextEdit) -> Result<Vec<Operation>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ApplyLocal { edit, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        let ops = rx.await.map_err(|_| SessionError::Closed)??;
        Ok(ops)
    }

    /// Close the session: cancel timers and reconnects, drop the link.
    /// Terminal. Closing twice is a no-op.
    pub async fn close(&mut self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type ConnectFuture = BoxFuture<'static, Result<TransportLink, ProtocolError>>;

/// The session event loop. Constructed only through [`Session::open`].
pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    document: ReplicatedDocument,
    updates: mpsc::UnboundedReceiver<DocumentUpdate>,
    fallback: Option<DocumentSnapshot>,
    document_dirty: bool,
    presence: PresenceTracker,
    machine: ConnectionStateMachine,
    watchdog: TimeoutWatchdog,
    backoff: Backoff,
    link: Option<TransportLink>,
    pending_connect: Option<ConnectFuture>,
    retry_at: Option<Instant>,
    handshake_deadline: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    document_tx: watch::Sender<DocumentSnapshot>,
    others_tx: watch::Sender<Vec<PresenceEntry>>,
    events: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// Open a session and start connecting. Must be called inside a tokio runtime.
    pub fn open(config: SessionConfig, user: LocalUser, connector: Arc<dyn Connector>) -> SessionHandle {
        let replica = config.replica_id.unwrap_or_else(Uuid::new_v4);
        let mut document = ReplicatedDocument::with_replica(replica);
        let (updates_tx, updates) = mpsc::unbounded_channel();
        document.on_update(move |update| {
            let _ = updates_tx.send(update.clone());
        });

        let initial = config.initial_snapshot.clone().unwrap_or_default();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (document_tx, document_rx) = watch::channel(initial);
        let (others_tx, others_rx) = watch::channel(Vec::new());
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(64);

        let document_id = config.document_id;
        let session = Session {
            presence: PresenceTracker::new(user, config.presence.clone()),
            watchdog: TimeoutWatchdog::new(config.stall_timeout),
            backoff: Backoff::new(config.reconnect.clone()),
            fallback: config.initial_snapshot.clone(),
            config,
            connector,
            document,
            updates,
            document_dirty: false,
            machine: ConnectionStateMachine::new(),
            link: None,
            pending_connect: None,
            retry_at: None,
            handshake_deadline: None,
            state_tx,
            document_tx,
            others_tx,
            events: events_tx,
        };
        let task = tokio::spawn(session.run(commands_rx));

        SessionHandle {
            document_id,
            replica_id: replica,
            commands: commands_tx,
            state: state_rx,
            document: document_rx,
            others: others_rx,
            events: Some(events_rx),
            task: Some(task),
        }
    }

    /// Open a session over WebSocket.
    pub fn open_websocket(config: SessionConfig, user: LocalUser) -> SessionHandle {
        Self::open(config, user, Arc::new(WebSocketConnector::new()))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        log::info!(
            "Session {} opening (replica {})",
            self.config.document_id,
            self.document.replica_id()
        );
        self.start_connect();

        let mut presence_tick = tokio::time::interval(self.config.presence.broadcast_interval);
        presence_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            let stall_at = self.watchdog.deadline();
            let handshake_at = self.handshake_deadline;

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::ApplyLocal { edit, reply }) => {
                        let result = self.apply_local(&edit).await;
                        self.flush_updates();
                        let _ = reply.send(result);
                    }
                    Some(Command::Close { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                result = poll_connect(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    self.on_connect_result(result).await;
                }

                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.start_connect();
                }

                event = next_link_event(&mut self.link) => {
                    self.on_link_event(event).await;
                }

                _ = presence_tick.tick() => {
                    self.on_presence_tick().await;
                }

                _ = sleep_until_opt(stall_at) => {
                    if self.watchdog.poll_expired(Instant::now()) {
                        log::warn!(
                            "Session {} stalled: offline for {:?}",
                            self.config.document_id,
                            self.watchdog.threshold()
                        );
                        self.emit(SessionEvent::Stalled);
                    }
                }

                _ = sleep_until_opt(handshake_at) => {
                    self.handshake_deadline = None;
                    let err = ProtocolError::Timeout("resync handshake");
                    log::warn!("Session {}: {err}", self.config.document_id);
                    self.on_transport_lost(&err.to_string());
                }
            }

            self.flush_updates();
        }

        log::info!("Session {} closed", self.config.document_id);
    }

    // ── Connection lifecycle ────────────────────────────────────────

    fn start_connect(&mut self) {
        log::debug!(
            "Session {}: connect attempt {}",
            self.config.document_id,
            self.backoff.attempts() + 1
        );
        self.pending_connect = Some(
            self.connector
                .connect(&self.config.server_url, self.config.document_id),
        );
    }

    async fn on_connect_result(&mut self, result: Result<TransportLink, ProtocolError>) {
        let link = match result {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Session {}: connect failed: {e}", self.config.document_id);
                self.on_transport_lost(&e.to_string());
                return;
            }
        };
        if self.machine.state().is_terminal() {
            return;
        }

        self.link = Some(link);
        self.set_state(ConnectionState::Connected);

        let replica = self.document.replica_id();
        let doc_id = self.config.document_id;
        let presence = self.presence.broadcast_self();
        let summary = self.document.version_summary();

        let handshake = SyncMessage::join(replica, doc_id, &presence)
            .and_then(|join| Ok((join, SyncMessage::sync_step1(replica, doc_id, &summary)?)));
        match handshake {
            Ok((join, step1)) => {
                if self.send(&join).await && self.send(&step1).await {
                    self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
                    log::debug!(
                        "Session {doc_id}: sent SyncStep1 covering {} replicas",
                        summary.len()
                    );
                }
            }
            Err(e) => {
                log::error!("Session {doc_id}: cannot encode handshake: {e}");
                self.on_transport_lost("handshake encoding failed");
            }
        }
    }

    /// Drop the link and schedule a retry, or give up per policy.
    fn on_transport_lost(&mut self, reason: &str) {
        self.link = None;
        self.handshake_deadline = None;
        if self.machine.state().is_terminal() {
            return;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                log::info!(
                    "Session {}: transport lost ({reason}), retry {} in {delay:?}",
                    self.config.document_id,
                    self.backoff.attempts()
                );
                self.set_state(ConnectionState::Reconnecting);
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                log::error!(
                    "Session {}: giving up after {} attempts",
                    self.config.document_id,
                    self.backoff.attempts()
                );
                self.disconnect(DisconnectReason::RetriesExhausted);
            }
        }
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        self.link = None;
        self.pending_connect = None;
        self.retry_at = None;
        self.handshake_deadline = None;
        if let Some(transition) = self.machine.disconnect(reason) {
            if let Some(reason) = self.machine.disconnect_reason() {
                log::info!("Session {} disconnected: {reason}", self.config.document_id);
            }
            self.after_transition(transition);
        }
    }

    fn shutdown(&mut self) {
        self.disconnect(DisconnectReason::ClosedByCaller);
        self.flush_updates();
    }

    fn set_state(&mut self, to: ConnectionState) {
        match self.machine.transition(to) {
            Ok(Some(transition)) => {
                log::info!(
                    "Session {}: {} -> {}",
                    self.config.document_id,
                    transition.from,
                    transition.to
                );
                self.after_transition(transition);
            }
            Ok(None) => {}
            Err(e) => log::error!("Session {}: {e}", self.config.document_id),
        }
    }

    fn after_transition(&mut self, transition: Transition) {
        self.watchdog.observe(transition.to, Instant::now());
        self.state_tx.send_replace(transition.to);
        self.emit(SessionEvent::StateChanged {
            from: transition.from,
            to: transition.to,
        });
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn on_link_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(bytes) => match SyncMessage::decode(&bytes) {
                Ok(msg) => self.on_message(msg).await,
                Err(e) => log::warn!(
                    "Session {}: dropping undecodable frame ({} bytes): {e}",
                    self.config.document_id,
                    bytes.len()
                ),
            },
            TransportEvent::Closed(reason) => self.on_transport_lost(&reason),
            TransportEvent::Error(cause) => self.on_transport_lost(&cause),
        }
    }

    async fn on_message(&mut self, msg: SyncMessage) {
        let doc_id = self.config.document_id;
        if !msg.doc_id.is_nil() && msg.doc_id != doc_id {
            log::warn!("Session {doc_id}: dropping message for document {}", msg.doc_id);
            return;
        }

        match msg.msg_type {
            MessageType::SyncStep2 => match msg.sync_reply() {
                Ok(reply) => self.on_sync_reply(reply.operations, &reply.summary).await,
                Err(e) => {
                    log::warn!("Session {doc_id}: bad SyncStep2: {e}");
                    self.on_transport_lost("resync failed");
                }
            },

            MessageType::Operations => match msg.operation_batch() {
                Ok(ops) => {
                    let accepted = self.document.apply_remote(ops);
                    log::trace!("Session {doc_id}: accepted {accepted} remote operations");
                }
                Err(e) => log::warn!("Session {doc_id}: dropping operation batch: {e}"),
            },

            MessageType::Join | MessageType::Presence => match msg.presence_info() {
                Ok(info) => {
                    if self.presence.on_remote_presence(&info, Instant::now()) {
                        self.publish_others();
                    }
                }
                Err(e) => log::warn!("Session {doc_id}: dropping presence: {e}"),
            },

            MessageType::PeerLeft => match msg.departed_user() {
                Ok(user_id) => {
                    if self.presence.remove(&user_id) {
                        log::debug!("Session {doc_id}: {user_id} left");
                        self.publish_others();
                    }
                }
                Err(e) => log::warn!("Session {doc_id}: dropping PeerLeft: {e}"),
            },

            MessageType::Revoked => {
                let reason = msg
                    .revoke_reason()
                    .unwrap_or_else(|_| "unspecified".to_string());
                self.disconnect(DisconnectReason::Revoked(reason));
            }

            MessageType::Ping => {
                let pong = SyncMessage::pong(self.document.replica_id());
                self.send(&pong).await;
            }

            MessageType::Pong => log::trace!("Session {doc_id}: pong"),

            MessageType::SyncStep1 => {
                log::debug!("Session {doc_id}: ignoring SyncStep1 from {}", msg.peer_id);
            }
        }
    }

    /// Second half of the resync handshake.
    async fn on_sync_reply(&mut self, operations: Vec<Operation>, server_summary: &VersionSummary) {
        let doc_id = self.config.document_id;
        let received = operations.len();
        self.document.apply_remote(operations);

        // Push whatever the server lacks: offline edits, or ops it lost.
        let missing = self.document.ops_missing_from(server_summary);
        if !missing.is_empty() {
            log::info!("Session {doc_id}: pushing {} operations to server", missing.len());
            match SyncMessage::operations(self.document.replica_id(), doc_id, &missing) {
                Ok(batch) => {
                    if !self.send(&batch).await {
                        return;
                    }
                }
                Err(e) => {
                    log::error!("Session {doc_id}: cannot encode resync batch: {e}");
                    self.on_transport_lost("resync failed");
                    return;
                }
            }
        }
        self.document.clear_outbox();
        self.handshake_deadline = None;

        if self.machine.state() == ConnectionState::Connected {
            log::info!("Session {doc_id}: resync complete ({received} operations received)");
            if self.fallback.take().is_some() {
                self.document_dirty = true;
            }
            self.flush_updates();
            self.backoff.reset();
            self.set_state(ConnectionState::Synced);
        }
    }

    // ── Local ───────────────────────────────────────────────────────

    async fn apply_local(&mut self, edit: &TextEdit) -> Result<Vec<Operation>, EditError> {
        let ops = self.document.apply_local(edit)?;
        if self.fallback.take().is_some() {
            self.document_dirty = true;
        }

        if self.machine.state() == ConnectionState::Synced {
            let batch = self.document.take_outbox();
            if !batch.is_empty() {
                match SyncMessage::operations(self.document.replica_id(), self.config.document_id, &batch) {
                    Ok(msg) => {
                        self.send(&msg).await;
                    }
                    Err(e) => log::error!("Session {}: cannot encode edit: {e}", self.config.document_id),
                }
            }
        } else {
            log::debug!(
                "Session {}: {} operations held until resync",
                self.config.document_id,
                self.document.outbox_len()
            );
        }
        Ok(ops)
    }

    async fn on_presence_tick(&mut self) {
        let now = Instant::now();
        if self.machine.state().is_online() {
            let info = self.presence.broadcast_self();
            match SyncMessage::presence(self.document.replica_id(), self.config.document_id, &info) {
                Ok(msg) => {
                    self.send(&msg).await;
                }
                Err(e) => log::error!("Session {}: cannot encode presence: {e}", self.config.document_id),
            }
        }
        if !self.presence.sweep(now).is_empty() {
            self.publish_others();
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Send on the current link. A failed send counts as a lost transport.
    async fn send(&mut self, msg: &SyncMessage) -> bool {
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        match link.send_message(msg).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "Session {}: send {:?} failed: {e}",
                    self.config.document_id,
                    msg.msg_type
                );
                self.on_transport_lost(&e.to_string());
                false
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("Session {}: event buffer full, dropping {event:?}", self.config.document_id);
        }
    }

    fn publish_others(&mut self) {
        let others = self.presence.others();
        self.others_tx.send_replace(others.clone());
        self.emit(SessionEvent::PresenceChanged(others));
    }

    fn flush_updates(&mut self) {
        while let Ok(update) = self.updates.try_recv() {
            self.document_dirty = true;
            self.emit(SessionEvent::DocumentUpdated(update));
        }
        if self.document_dirty {
            self.document_dirty = false;
            let visible = self
                .fallback
                .clone()
                .unwrap_or_else(|| self.document.snapshot());
            self.document_tx.send_replace(visible);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_link_event(link: &mut Option<TransportLink>) -> TransportEvent {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_connect(pending: &mut Option<ConnectFuture>) -> Result<TransportLink, ProtocolError> {
    match pending {
        Some(connect) => connect.await,
        None => std::future::pending().await,
    }
}
