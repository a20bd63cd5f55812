//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real relay and open real sessions against it,
//! verifying the full sync pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use logos_sync::crdt::Field;
use logos_sync::protocol::{MessageType, ProtocolError, SyncMessage};
use logos_sync::transport::{Connector, TransportLink, WebSocketConnector};
use logos_sync::{
    ConnectionState, DocumentSnapshot, LocalUser, PresenceBroadcast, ReconnectPolicy, Session,
    SessionConfig, SessionHandle, ServerConfig, SyncServer, TextEdit, VersionSummary,
};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on a free port. Returns the server and its ws:// URL.
async fn start_test_server() -> (SyncServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    });
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        ..Default::default()
    }
}

fn session_config(doc_id: Uuid, url: &str, replica: u128) -> SessionConfig {
    let mut config = SessionConfig::new(doc_id, url);
    config.replica_id = Some(Uuid::from_u128(replica));
    config.reconnect = fast_reconnect();
    config
}

async fn wait_state(session: &SessionHandle, state: ConnectionState) {
    timeout(WAIT, session.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

async fn wait_content(session: &SessionHandle, expected: &str) {
    let mut rx = session.subscribe_document();
    let waited = timeout(WAIT, rx.wait_for(|doc| doc.content == expected)).await;
    assert!(
        matches!(waited, Ok(Ok(_))),
        "expected {expected:?}, have {:?}",
        session.document().content
    );
}

/// WebSocket connector with an offline switch.
struct Switchable {
    inner: WebSocketConnector,
    online: AtomicBool,
}

impl Switchable {
    fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: WebSocketConnector::new(),
            online: AtomicBool::new(online),
        })
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Connector for Switchable {
    fn connect(
        &self,
        server_url: &str,
        document_id: Uuid,
    ) -> BoxFuture<'static, Result<TransportLink, ProtocolError>> {
        if self.online.load(Ordering::SeqCst) {
            self.inner.connect(server_url, document_id)
        } else {
            futures_util::future::ready(Err(ProtocolError::Connect("offline".into()))).boxed()
        }
    }
}

#[tokio::test]
async fn test_session_reaches_synced() {
    let (_server, url) = start_test_server().await;
    let session = Session::open_websocket(
        session_config(Uuid::new_v4(), &url, 1),
        LocalUser::new("Alice"),
    );

    wait_state(&session, ConnectionState::Synced).await;
    assert_eq!(session.document(), DocumentSnapshot::default());
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let a = Session::open_websocket(session_config(doc_id, &url, 1), LocalUser::new("Alice"));
    let b = Session::open_websocket(session_config(doc_id, &url, 2), LocalUser::new("Bob"));
    wait_state(&a, ConnectionState::Synced).await;
    wait_state(&b, ConnectionState::Synced).await;

    a.apply_local(TextEdit::insert(Field::Title, 0, "Plan")).await.unwrap();
    a.apply_local(TextEdit::insert(Field::Content, 0, "abc")).await.unwrap();
    wait_content(&b, "abc").await;
    assert_eq!(b.document().title, "Plan");

    b.apply_local(TextEdit::replace(Field::Content, 1, 1, "XY")).await.unwrap();
    wait_content(&a, "aXYc").await;
    assert_eq!(a.document(), b.document());

    let on_server = server.document_snapshot(doc_id).await.unwrap();
    assert_eq!(on_server, a.document());
}

#[tokio::test]
async fn test_offline_edit_converges_by_replica_id() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    // A has the larger replica id, so its concurrent insert sorts first.
    let switch = Switchable::new(false);
    let a = Session::open(
        session_config(doc_id, &url, 0xA),
        LocalUser::new("Alice"),
        switch.clone(),
    );
    let b = Session::open_websocket(session_config(doc_id, &url, 0x1), LocalUser::new("Bob"));

    wait_state(&a, ConnectionState::Reconnecting).await;
    wait_state(&b, ConnectionState::Synced).await;

    a.apply_local(TextEdit::insert(Field::Content, 0, "Hello")).await.unwrap();
    b.apply_local(TextEdit::insert(Field::Content, 0, "Hi ")).await.unwrap();
    assert_eq!(a.document().content, "Hello");
    assert_eq!(b.document().content, "Hi ");

    switch.set_online(true);
    wait_state(&a, ConnectionState::Synced).await;

    wait_content(&a, "HelloHi ").await;
    wait_content(&b, "HelloHi ").await;
}

#[tokio::test]
async fn test_late_joiner_resyncs_history() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let mut a = Session::open_websocket(session_config(doc_id, &url, 1), LocalUser::new("Alice"));
    wait_state(&a, ConnectionState::Synced).await;
    a.apply_local(TextEdit::insert(Field::Content, 0, "kept")).await.unwrap();
    timeout(WAIT, async {
        while server.document_snapshot(doc_id).await.map(|d| d.content) != Some("kept".into()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    a.close().await;
    assert_eq!(a.state(), ConnectionState::Disconnected);

    let c = Session::open_websocket(session_config(doc_id, &url, 3), LocalUser::new("Carol"));
    wait_state(&c, ConnectionState::Synced).await;
    wait_content(&c, "kept").await;
}

#[tokio::test]
async fn test_revoke_disconnects_session() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let session = Session::open_websocket(session_config(doc_id, &url, 1), LocalUser::new("Alice"));
    wait_state(&session, ConnectionState::Synced).await;

    assert_eq!(server.revoke(doc_id, "access removed").await.unwrap(), 1);
    wait_state(&session, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_raw_handshake() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/{doc_id}"))
        .await
        .unwrap();
    let presence = PresenceBroadcast::from(&LocalUser::new("Raw"));
    for msg in [
        SyncMessage::join(peer, doc_id, &presence).unwrap(),
        SyncMessage::sync_step1(peer, doc_id, &VersionSummary::new()).unwrap(),
    ] {
        ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
    }

    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(bytes) = reply else {
        panic!("expected binary frame");
    };
    let msg = SyncMessage::decode(&bytes).unwrap();
    assert_eq!(msg.msg_type, MessageType::SyncStep2);
    let reply = msg.sync_reply().unwrap();
    assert!(reply.operations.is_empty());
    assert!(reply.summary.is_empty());
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, url) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let ping = SyncMessage::ping(Uuid::new_v4());
    ws.send(Message::Binary(ping.encode().unwrap().into())).await.unwrap();

    let reply = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(bytes) = reply else {
        panic!("expected binary frame");
    };
    assert_eq!(SyncMessage::decode(&bytes).unwrap().msg_type, MessageType::Pong);
}

#[tokio::test]
async fn test_room_full_is_revoked() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = SyncServer::new(ServerConfig {
        max_peers_per_room: 1,
        ..ServerConfig::default()
    });
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    let doc_id = Uuid::new_v4();

    let first = Session::open_websocket(session_config(doc_id, &url, 1), LocalUser::new("Alice"));
    wait_state(&first, ConnectionState::Synced).await;

    let second = Session::open_websocket(session_config(doc_id, &url, 2), LocalUser::new("Bob"));
    wait_state(&second, ConnectionState::Disconnected).await;
    assert_eq!(first.state(), ConnectionState::Synced);
}
