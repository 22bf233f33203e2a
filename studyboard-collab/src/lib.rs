//! # studyboard-collab — real-time sync for Studyboard canvases
//!
//! Connects a board's [`ReplicatedDoc`](studyboard_core::ReplicatedDoc) to a
//! relay over WebSocket and tracks who else is on the board.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncSession  │ ◄────────────────► │ SyncRelay    │
//! │ (per board)  │    Binary Proto    │ (per room)   │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ ChangeBridge │                    │ ReplicatedDoc│
//! │ LocalStore ⇄ │                    │ (room copy)  │
//! │ ReplicatedDoc│                    └──────┬───────┘
//! └──────────────┘                           │
//!                                    ┌───────┴────────┐
//!                                    │ BroadcastGroup │
//!                                    │ (fan-out)      │
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`] — Client connection with handshake, backoff and heartbeat
//! - [`presence`] — Awareness messages and the participant list
//! - [`session`] — Per-board lifecycle: idle, connecting, synced, torn down
//! - [`relay`] — WebSocket relay holding one replica per room
//! - [`broadcast`] — Room fan-out with lag detection

pub mod broadcast;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transport;

pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use error::{CollabError, RelayError, TransportError};
pub use presence::{
    AwarenessMessage, CursorColor, Identity, Participant, ParticipantsListener, PresenceChannel,
    Vec2, CURSOR_BROADCAST_INTERVAL,
};
pub use protocol::{MessageType, ProtocolError, SyncMessage, RELAY_PEER_ID};
pub use relay::{RelayConfig, RelayHandle, RelayStats, SyncRelay};
pub use session::{SessionConfig, SessionState, SyncSession, PRESENCE_TIMEOUT};
pub use transport::{
    build_url, AwarenessPublisher, Backoff, ConnectionStatus, TransportConfig, TransportEvent,
    TransportProvider,
};
