//! One collaborative board: store, replica, bridges, transport and presence.
//!
//! ```text
//! Idle ──open──▶ Connecting ──status=connected──▶ Connected ──synced──▶ Synced
//!                    ▲                                │                  │
//!                    └────────status=disconnected─────┴──────────────────┘
//!
//! any state ──teardown / drop──▶ TornDown
//! ```
//!
//! A session with no store, room id or auth token stays `Idle` and never
//! touches the network.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use studyboard_core::{
    BootstrapReport, BridgeSubscriptions, ChangeBridge, ListenerHandle, LocalStore,
    ReplicatedDoc, SyncStatsSnapshot,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::CollabError;
use crate::presence::{
    Identity, Participant, ParticipantsListener, PresenceChannel, Vec2, CURSOR_BROADCAST_INTERVAL,
};
use crate::transport::{
    AwarenessPublisher, ConnectionStatus, TransportConfig, TransportEvent, TransportProvider,
};

/// Default silence after which a remote participant is dropped.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    /// Connected, handshake not complete
    Connected,
    Synced,
    TornDown,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint, `ws://` or `wss://`
    pub endpoint: String,
    pub room_id: Option<String>,
    pub auth_token: Option<String>,
    /// Display identity; a guest identity is derived from the client id when absent
    pub identity: Option<Identity>,
    /// Fixed client id; random when absent
    pub client_id: Option<Uuid>,
    pub cursor_interval: Duration,
    /// Peers silent this long are dropped; the local slot is re-announced
    /// every half period. `None` disables both.
    pub presence_timeout: Option<Duration>,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9090".to_string(),
            room_id: None,
            auth_token: None,
            identity: None,
            client_id: None,
            cursor_interval: CURSOR_BROADCAST_INTERVAL,
            presence_timeout: Some(PRESENCE_TIMEOUT),
            transport: TransportConfig::default(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

struct SessionShared {
    client_id: Uuid,
    state: watch::Sender<SessionState>,
    presence: PresenceChannel,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Transport-driven transition. Never leaves `Idle` or `TornDown`.
    fn advance(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            let allowed = !matches!(*current, SessionState::Idle | SessionState::TornDown)
                && *current != next;
            if allowed {
                *current = next;
            }
            allowed
        });
        if changed {
            log::debug!("session {}: {next:?}", self.client_id);
        }
        changed
    }

    /// Caller-driven transition. Only `TornDown` is final.
    fn enter(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = *current != SessionState::TornDown && *current != next;
            if allowed {
                *current = next;
            }
            allowed
        })
    }
}

/// Applies transport events to the session until the transport goes away.
fn handle_event(shared: &SessionShared, bridge: &ChangeBridge, event: TransportEvent) {
    match event {
        TransportEvent::Status(ConnectionStatus::Connecting) => {
            shared.advance(SessionState::Connecting);
        }
        TransportEvent::Status(ConnectionStatus::Connected) => {
            shared.advance(SessionState::Connected);
        }
        TransportEvent::Status(ConnectionStatus::Disconnected) => {
            if shared.advance(SessionState::Connecting) {
                // The relay resends current presence after reconnect.
                shared.presence.clear();
            }
        }
        TransportEvent::Synced(true) => {
            if matches!(shared.state(), SessionState::Idle | SessionState::TornDown) {
                return;
            }
            let report = bridge.bootstrap();
            log::debug!("session {}: bootstrap {report:?}", shared.client_id);
            shared.advance(SessionState::Synced);
        }
        TransportEvent::Synced(false) => {}
        TransportEvent::Awareness(msg) => {
            shared.presence.handle_message(&msg);
        }
        TransportEvent::PeerLeft(client_id) => {
            shared.presence.remove_peer(&client_id);
        }
        TransportEvent::Rejected(reason) => {
            log::warn!("session {}: relay refused: {reason}", shared.client_id);
            shared.enter(SessionState::Idle);
            shared.presence.clear();
        }
    }
}

/// Re-announce the local slot and drop peers that went silent.
fn renew_presence(shared: &SessionShared, publisher: &AwarenessPublisher, timeout: Duration) {
    if matches!(shared.state(), SessionState::Connected | SessionState::Synced) {
        if let Some(msg) = shared.presence.local_message() {
            publisher.publish(msg);
        }
    }
    let evicted = shared.presence.evict_idle(timeout);
    if !evicted.is_empty() {
        log::debug!("session {}: evicted silent peers {evicted:?}", shared.client_id);
    }
}

async fn pump_events(
    shared: Arc<SessionShared>,
    bridge: Arc<ChangeBridge>,
    mut events: mpsc::Receiver<TransportEvent>,
    publisher: AwarenessPublisher,
    presence_timeout: Option<Duration>,
) {
    let presence_timeout = presence_timeout.filter(|timeout| !timeout.is_zero());
    let mut renewal = presence_timeout.map(|timeout| {
        let mut renewal = tokio::time::interval((timeout / 2).max(Duration::from_millis(1)));
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renewal
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(&shared, &bridge, event),
                None => break,
            },
            _ = async {
                match renewal.as_mut() {
                    Some(renewal) => {
                        renewal.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(timeout) = presence_timeout {
                    renew_presence(&shared, &publisher, timeout);
                }
            }
        }
    }
}

/// Everything a connected session owns.
struct Active {
    bridge: Arc<ChangeBridge>,
    subscriptions: BridgeSubscriptions,
    transport: TransportProvider,
    pump: Option<JoinHandle<()>>,
}

/// A collaborative board session.
///
/// Owns the replica, both bridges and the transport for one room. Dropping
/// the session tears it down.
pub struct SyncSession {
    shared: Arc<SessionShared>,
    identity: Mutex<Identity>,
    replica: Mutex<Option<Arc<ReplicatedDoc>>>,
    active: Mutex<Option<Active>>,
}

impl SyncSession {
    /// Open a session.
    ///
    /// Missing prerequisites leave the session `Idle` without error. With
    /// all of them present this must run inside a tokio runtime.
    pub fn open(
        store: Option<Arc<dyn LocalStore>>,
        config: SessionConfig,
    ) -> Result<Self, CollabError> {
        let client_id = config.client_id.unwrap_or_else(Uuid::new_v4);
        let identity = config
            .identity
            .clone()
            .unwrap_or_else(|| Identity::for_client("Guest", client_id));
        let (state, _) = watch::channel(SessionState::Idle);
        let replica = Arc::new(ReplicatedDoc::new());
        let session = Self {
            shared: Arc::new(SessionShared {
                client_id,
                state,
                presence: PresenceChannel::with_interval(client_id, config.cursor_interval),
            }),
            identity: Mutex::new(identity.clone()),
            replica: Mutex::new(Some(Arc::clone(&replica))),
            active: Mutex::new(None),
        };

        let room_id = non_empty(config.room_id);
        let auth_token = non_empty(config.auth_token);
        let (Some(store), Some(room_id), Some(auth_token)) = (store, room_id, auth_token) else {
            log::info!("session {client_id}: missing store, room or token, staying idle");
            return Ok(session);
        };
        let handle = Handle::try_current().map_err(|_| CollabError::NoRuntime)?;

        let bridge = ChangeBridge::new(store, Arc::clone(&replica));
        let subscriptions = bridge.attach();
        let mut transport = TransportProvider::new(replica, client_id, config.transport)?;
        let pump = transport.take_event_rx().map(|events| {
            handle.spawn(pump_events(
                Arc::clone(&session.shared),
                Arc::clone(&bridge),
                events,
                transport.awareness_publisher(),
                config.presence_timeout,
            ))
        });

        session.shared.enter(SessionState::Connecting);
        let hello = session.shared.presence.publish_local(identity, None);
        transport.publish_awareness(hello);
        if let Err(e) = transport.connect(&config.endpoint, &room_id, &auth_token) {
            if let Some(pump) = pump {
                pump.abort();
            }
            return Err(e.into());
        }
        log::info!("session {client_id}: joining room {room_id}");

        *lock(&session.active) = Some(Active {
            bridge,
            subscriptions,
            transport,
            pump,
        });
        Ok(session)
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected | SessionState::Synced)
    }

    pub fn is_synced(&self) -> bool {
        self.state() == SessionState::Synced
    }

    /// Remote participants ordered by display name, own client excluded.
    pub fn participants(&self) -> Vec<Participant> {
        self.shared.presence.participants()
    }

    pub fn on_participants_change(&self, listener: ParticipantsListener) -> ListenerHandle {
        self.shared.presence.on_change(listener)
    }

    /// Replace the local identity and cursor and broadcast them.
    pub fn publish_presence(&self, identity: Identity, cursor: Option<Vec2>) {
        *lock(&self.identity) = identity.clone();
        let msg = self.shared.presence.publish_local(identity, cursor);
        if let Some(active) = lock(&self.active).as_ref() {
            active.transport.publish_awareness(msg);
        }
    }

    /// Move the local cursor, in document coordinates. Throttled.
    pub fn update_cursor(&self, cursor: Option<Vec2>) {
        let Some(msg) = self.shared.presence.update_cursor(cursor) else {
            return;
        };
        if let Some(active) = lock(&self.active).as_ref() {
            active.transport.publish_awareness(msg);
        }
    }

    pub fn identity(&self) -> Identity {
        lock(&self.identity).clone()
    }

    /// Drop the connection and stop retrying. The session goes `Idle`.
    pub fn disconnect(&self) {
        if let Some(active) = lock(&self.active).as_mut() {
            active.transport.disconnect();
            self.shared.enter(SessionState::Idle);
            self.shared.presence.clear();
            log::info!("session {}: disconnected", self.shared.client_id);
        }
    }

    /// Resume after `disconnect` or a relay rejection.
    pub fn reconnect(&self) -> Result<(), CollabError> {
        let mut active = lock(&self.active);
        let Some(active) = active.as_mut() else {
            return match self.state() {
                SessionState::TornDown => Err(CollabError::TornDown),
                _ => Ok(()),
            };
        };
        self.shared.enter(SessionState::Connecting);
        if let Some(msg) = self.shared.presence.local_message() {
            active.transport.publish_awareness(msg);
        }
        active.transport.reconnect()?;
        Ok(())
    }

    /// Adopt replica records missing from the local store.
    pub fn bootstrap(&self) -> Option<BootstrapReport> {
        lock(&self.active)
            .as_ref()
            .map(|active| active.bridge.bootstrap())
    }

    /// The replica, until teardown.
    pub fn replicated(&self) -> Option<Arc<ReplicatedDoc>> {
        lock(&self.replica).clone()
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        lock(&self.active)
            .as_ref()
            .map(|active| active.bridge.stats())
            .unwrap_or_default()
    }

    pub fn is_torn_down(&self) -> bool {
        self.state() == SessionState::TornDown
    }

    /// Release every listener, the transport and the replica. Idempotent.
    pub fn teardown(&self) {
        let first = self.shared.enter(SessionState::TornDown);
        if let Some(mut active) = lock(&self.active).take() {
            if let Some(pump) = active.pump.take() {
                pump.abort();
            }
            active.subscriptions.detach();
            active.transport.destroy();
        }
        lock(&self.replica).take();
        self.shared.presence.clear();
        if first {
            log::info!("session {}: torn down", self.shared.client_id);
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("client_id", &self.shared.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyboard_core::MemoryStore;

    fn store() -> Arc<dyn LocalStore> {
        Arc::new(MemoryStore::new())
    }

    fn full_config() -> SessionConfig {
        SessionConfig {
            endpoint: "ws://127.0.0.1:9".to_string(),
            room_id: Some("board".to_string()),
            auth_token: Some("token".to_string()),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_missing_prerequisites_stay_idle() {
        let no_store = SyncSession::open(None, full_config()).unwrap();
        assert_eq!(no_store.state(), SessionState::Idle);

        let no_room = SyncSession::open(
            Some(store()),
            SessionConfig {
                room_id: None,
                ..full_config()
            },
        )
        .unwrap();
        assert_eq!(no_room.state(), SessionState::Idle);

        let blank_token = SyncSession::open(
            Some(store()),
            SessionConfig {
                auth_token: Some("  ".to_string()),
                ..full_config()
            },
        )
        .unwrap();
        assert_eq!(blank_token.state(), SessionState::Idle);
        assert!(!blank_token.is_connected());
        assert!(blank_token.bootstrap().is_none());
    }

    #[test]
    fn test_open_outside_runtime_fails() {
        assert!(matches!(
            SyncSession::open(Some(store()), full_config()),
            Err(CollabError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_open_starts_connecting() {
        let session = SyncSession::open(Some(store()), full_config()).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_synced());
        assert!(session.replicated().is_some());
    }

    #[tokio::test]
    async fn test_bad_endpoint_is_an_error() {
        let result = SyncSession::open(
            Some(store()),
            SessionConfig {
                endpoint: "http://example.com".to_string(),
                ..full_config()
            },
        );
        assert!(matches!(result, Err(CollabError::Transport(_))));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let local = Arc::new(MemoryStore::new());
        let session = SyncSession::open(Some(local.clone()), full_config()).unwrap();
        assert_eq!(local.listener_count(), 1);

        session.teardown();
        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(local.listener_count(), 0);
        assert!(session.replicated().is_none());

        session.teardown();
        assert_eq!(session.state(), SessionState::TornDown);
        assert!(matches!(session.reconnect(), Err(CollabError::TornDown)));
    }

    #[tokio::test]
    async fn test_drop_releases_store_listener() {
        let local = Arc::new(MemoryStore::new());
        let session = SyncSession::open(Some(local.clone()), full_config()).unwrap();
        drop(session);
        assert_eq!(local.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_goes_idle() {
        let session = SyncSession::open(Some(store()), full_config()).unwrap();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Idle);
        session.reconnect().unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_transport_events_never_leave_idle() {
        let (state, _) = watch::channel(SessionState::Idle);
        let shared = SessionShared {
            client_id: Uuid::new_v4(),
            state,
            presence: PresenceChannel::new(Uuid::new_v4()),
        };
        assert!(!shared.advance(SessionState::Connected));
        assert!(shared.enter(SessionState::Connecting));
        assert!(shared.advance(SessionState::Connected));
        assert!(shared.advance(SessionState::Synced));
        assert!(shared.enter(SessionState::TornDown));
        assert!(!shared.enter(SessionState::Connecting));
        assert!(!shared.advance(SessionState::Connecting));
    }
}
