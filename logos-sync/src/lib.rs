//! # logos-sync: Real-time collaborative document sessions
//!
//! Keeps a locally replicated document (title + content) converged with a
//! relay server and every other participant, survives network loss, and
//! shows who else is in the document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ Session      │ ◄────────────────► │ SyncServer   │
//! │ (per doc)    │    Binary Proto    │ (relay)      │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Replicated   │                    │ Replicated   │
//! │ Document     │                    │ Document     │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] - Replicated text (RGA), operations, version summaries
//! - [`session`] - Per-document event loop and caller handle
//! - [`state`] - Connection state machine
//! - [`reconnect`] - Capped exponential backoff
//! - [`watchdog`] - One-shot stall signal
//! - [`presence`] - Remote participant tracking
//! - [`transport`] - Connector trait, WebSocket and in-memory links
//! - [`protocol`] - Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`] - Room fan-out with backpressure
//! - [`server`] - WebSocket relay

pub mod broadcast;
pub mod crdt;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;
pub mod watchdog;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionToken, Departure};
pub use crdt::{
    DocumentSnapshot, DocumentUpdate, EditError, Field, Operation, ReplicaId, ReplicatedDocument,
    TextEdit, UpdateOrigin, VersionSummary,
};
pub use presence::{LocalUser, PresenceBroadcast, PresenceConfig, PresenceEntry, PresenceTracker, UserColor};
pub use protocol::{MessageType, ProtocolError, SyncMessage, SyncReply};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionConfig, SessionError, SessionEvent, SessionHandle};
pub use state::{ConnectionState, ConnectionStateMachine, DisconnectReason, StateError};
pub use transport::{Connector, MemoryConnector, MemoryPeer, TransportEvent, TransportLink, WebSocketConnector};
pub use watchdog::TimeoutWatchdog;
