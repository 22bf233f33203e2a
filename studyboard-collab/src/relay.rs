//! WebSocket relay that keeps one replica per board room.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──▶ Client A
//!             ├── Room (room id) ── ReplicatedDoc
//! Client B ──┘         │               └──▶ Client B
//!                      └── BroadcastGroup + awareness cache
//! ```
//!
//! The connection URL is `ws://<addr>/<room_id>?token=<token>`. Rooms live
//! in memory for the lifetime of the relay; a client that reconnects after a
//! relay restart re-uploads its state during the handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use studyboard_core::{ReplicatedDoc, SyncOrigin};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::error::RelayError;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, SyncMessage, RELAY_PEER_ID};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

pub const ENV_ADDR: &str = "STUDYBOARD_RELAY_ADDR";
pub const ENV_TOKEN: &str = "STUDYBOARD_RELAY_TOKEN";
pub const ENV_MAX_PEERS: &str = "STUDYBOARD_RELAY_MAX_PEERS";

const REJECT_LINGER: Duration = Duration::from_secs(1);
/// How long a departure is replayed to connections that fell behind
const DEPARTED_RETENTION: Duration = Duration::from_secs(60);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Token every client must present; `None` admits any token
    pub auth_token: Option<String>,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Frames a connection may fall behind before it is resynchronized
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_token: None,
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `STUDYBOARD_RELAY_*` variables.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_ADDR) {
            config.bind_addr = addr;
        }
        config.auth_token = lookup(ENV_TOKEN).filter(|t| !t.is_empty());
        if let Some(max) = lookup(ENV_MAX_PEERS) {
            config.max_peers_per_room = max
                .parse()
                .map_err(|_| RelayError::Config(format!("{ENV_MAX_PEERS}={max:?} is not a count")))?;
        }
        if config.max_peers_per_room == 0 {
            return Err(RelayError::Config(format!("{ENV_MAX_PEERS} must be positive")));
        }
        Ok(config)
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub resyncs: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    resyncs: AtomicU64,
}

/// One board room: authoritative replica, fan-out and presence cache.
struct RelayRoom {
    id: String,
    doc: ReplicatedDoc,
    broadcast: BroadcastGroup,
    /// Last encoded awareness frame per client id
    awareness: Mutex<HashMap<Uuid, Vec<u8>>>,
    clients: Mutex<ClientRegistry>,
}

/// Which client each connection speaks for, plus recent departures.
#[derive(Default)]
struct ClientRegistry {
    /// Connection id to client id
    live: HashMap<Uuid, Uuid>,
    departed: HashMap<Uuid, Instant>,
}

impl RelayRoom {
    fn new(id: String, broadcast_capacity: usize) -> Self {
        Self {
            id,
            doc: ReplicatedDoc::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            awareness: Mutex::new(HashMap::new()),
            clients: Mutex::new(ClientRegistry::default()),
        }
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, ClientRegistry> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind_client(&self, conn_id: Uuid, client_id: Uuid) {
        let mut clients = self.clients();
        clients.departed.remove(&client_id);
        clients.live.insert(conn_id, client_id);
    }

    /// Forget `conn_id`. Returns its client id when no other connection in
    /// the room still carries it.
    fn release_client(&self, conn_id: &Uuid) -> Option<Uuid> {
        let mut clients = self.clients();
        let client_id = clients.live.remove(conn_id)?;
        if clients.live.values().any(|other| *other == client_id) {
            return None;
        }
        clients
            .departed
            .retain(|_, left| left.elapsed() < DEPARTED_RETENTION);
        clients.departed.insert(client_id, Instant::now());
        Some(client_id)
    }

    /// Frames that bring a connection which missed broadcasts back in
    /// step: the full document, recent departures, then current presence.
    fn recovery_frames(&self) -> Result<Vec<Vec<u8>>, RelayError> {
        let state = SyncMessage::delta(RELAY_PEER_ID, 0, self.doc.encode_state());
        let mut frames = vec![state.encode()?];
        let departed: Vec<Uuid> = self.clients().departed.keys().copied().collect();
        for client_id in departed {
            frames.push(SyncMessage::peer_left(client_id).encode()?);
        }
        frames.extend(self.cached_awareness());
        Ok(frames)
    }

    fn awareness(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<u8>>> {
        self.awareness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_awareness(&self) -> Vec<Vec<u8>> {
        self.awareness().values().cloned().collect()
    }
}

struct RelayShared {
    config: RelayConfig,
    rooms: RwLock<HashMap<String, Arc<RelayRoom>>>,
    stats: AtomicRelayStats,
    shutdown: watch::Sender<bool>,
}

impl RelayShared {
    /// Get or create a room.
    async fn room(&self, room_id: &str) -> Arc<RelayRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Arc::clone(room);
            }
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::info!("relay: opened room {room_id}");
            Arc::new(RelayRoom::new(
                room_id.to_string(),
                self.config.broadcast_capacity,
            ))
        }))
    }

    /// Check room id and token; `Err` carries the rejection reason.
    fn admit<'a>(
        &self,
        room_id: Option<&'a str>,
        token: Option<&str>,
    ) -> Result<&'a str, &'static str> {
        let room_id = room_id.ok_or("missing room id")?;
        if let Some(expected) = &self.config.auth_token {
            if token != Some(expected.as_str()) {
                return Err("invalid token");
            }
        }
        Ok(room_id)
    }

    async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            resyncs: self.stats.resyncs.load(Ordering::Relaxed),
            active_rooms: self.rooms.read().await.len(),
        }
    }
}

/// Split a request target `/<room>?token=<token>` into its parts.
fn parse_target(target: &str) -> (Option<String>, Option<String>) {
    let Ok(url) = Url::parse("ws://relay.invalid").and_then(|base| base.join(target)) else {
        return (None, None);
    };
    let room = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string);
    let token = url
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned());
    (room, token)
}

async fn send_frame(sink: &mut WsSink, bytes: Vec<u8>) -> Result<(), RelayError> {
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

async fn send_message(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), RelayError> {
    send_frame(sink, msg.encode()?).await
}

async fn reject(
    shared: &RelayShared,
    mut sink: WsSink,
    mut stream: WsStream,
    addr: SocketAddr,
    reason: &str,
) {
    shared
        .stats
        .rejected_connections
        .fetch_add(1, Ordering::Relaxed);
    log::warn!("relay: rejecting {addr}: {reason}");
    if let Err(e) = send_message(&mut sink, &SyncMessage::rejected(reason)).await {
        log::debug!("relay: could not deliver rejection to {addr}: {e}");
    }
    let _ = sink.close().await;
    // Let the client read the reason before the socket goes away.
    let drain = async { while let Some(Ok(_)) = stream.next().await {} };
    let _ = tokio::time::timeout(REJECT_LINGER, drain).await;
}

/// A peer's connection inside a room.
struct PeerConnection<'a> {
    shared: &'a RelayShared,
    room: &'a RelayRoom,
    conn_id: Uuid,
    /// Client id, learned from the first frame
    peer_id: Option<Uuid>,
}

impl PeerConnection<'_> {
    async fn serve(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        rx: &mut broadcast::Receiver<Arc<Frame>>,
    ) -> Result<(), RelayError> {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        send_message(
            sink,
            &SyncMessage::sync_step1(RELAY_PEER_ID, self.room.doc.state_vector()),
        )
        .await?;
        for frame in self.room.cached_awareness() {
            send_frame(sink, frame).await?;
        }

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        if let Some(reply) = self.handle_frame(bytes)? {
                            send_message(sink, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                frame = rx.recv() => match frame {
                    Ok(frame) => {
                        if frame.sender != self.conn_id {
                            send_frame(sink, frame.bytes.clone()).await?;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        self.room.broadcast.record_dropped(n);
                        self.shared.stats.resyncs.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "relay: peer {:?} in room {} lagged by {n} frames, resending state",
                            self.peer_id,
                            self.room.id
                        );
                        for frame in self.room.recovery_frames()? {
                            send_frame(sink, frame).await?;
                        }
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn handle_frame(&mut self, bytes: Vec<u8>) -> Result<Option<SyncMessage>, RelayError> {
        self.shared
            .stats
            .total_messages
            .fetch_add(1, Ordering::Relaxed);
        let msg = match SyncMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("relay: undecodable frame in room {}: {e}", self.room.id);
                return Ok(None);
            }
        };
        if self.peer_id.is_none() && msg.peer_id != RELAY_PEER_ID {
            self.peer_id = Some(msg.peer_id);
            self.room.bind_client(self.conn_id, msg.peer_id);
            log::info!("relay: peer {} joined room {}", msg.peer_id, self.room.id);
        }

        match msg.msg_type {
            MessageType::SyncStep1 => match self.room.doc.encode_diff(&msg.payload) {
                Ok(diff) => return Ok(Some(SyncMessage::sync_step2(RELAY_PEER_ID, diff))),
                Err(e) => log::warn!("relay: bad state vector in room {}: {e}", self.room.id),
            },
            MessageType::SyncStep2 | MessageType::Delta => {
                match self.room.doc.apply_update(&msg.payload, SyncOrigin::Remote) {
                    Ok(()) => {
                        let delta = SyncMessage::delta(msg.peer_id, msg.clock, msg.payload);
                        self.room.broadcast.broadcast(self.conn_id, &delta)?;
                    }
                    Err(e) => log::warn!("relay: dropping update in room {}: {e}", self.room.id),
                }
            }
            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => {
                    match &awareness {
                        AwarenessMessage::Update { client_id, .. } => {
                            self.room.awareness().insert(*client_id, bytes.clone());
                        }
                        AwarenessMessage::Leave { client_id } => {
                            self.room.awareness().remove(client_id);
                        }
                    }
                    self.room.broadcast.broadcast_raw(Arc::new(Frame {
                        sender: self.conn_id,
                        bytes,
                    }));
                }
                Err(e) => log::warn!("relay: bad awareness in room {}: {e}", self.room.id),
            },
            MessageType::Ping => return Ok(Some(SyncMessage::pong(RELAY_PEER_ID))),
            other => log::debug!("relay: ignoring {other:?} in room {}", self.room.id),
        }
        Ok(None)
    }

    /// Drop the peer's presence and tell the room it left, unless the same
    /// client is still connected through another socket.
    async fn leave(&self) {
        self.room.broadcast.remove_peer(&self.conn_id).await;
        let Some(peer_id) = self.room.release_client(&self.conn_id) else {
            if let Some(peer_id) = self.peer_id {
                log::debug!(
                    "relay: stale connection of {peer_id} closed in room {}",
                    self.room.id
                );
            }
            return;
        };
        self.room.awareness().remove(&peer_id);
        if let Err(e) = self
            .room
            .broadcast
            .broadcast(self.conn_id, &SyncMessage::peer_left(peer_id))
        {
            log::warn!("relay: could not announce departure of {peer_id}: {e}");
        }
        log::info!("relay: peer {peer_id} left room {}", self.room.id);
    }
}

async fn handle_connection(
    shared: Arc<RelayShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), RelayError> {
    let mut target: Option<String> = None;
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            target = Some(req.uri().to_string());
            Ok(resp)
        },
    )
    .await?;
    let (mut sink, mut stream) = ws.split();
    shared
        .stats
        .total_connections
        .fetch_add(1, Ordering::Relaxed);

    let (room_id, token) = parse_target(target.as_deref().unwrap_or("/"));
    let room_id = match shared.admit(room_id.as_deref(), token.as_deref()) {
        Ok(room_id) => room_id,
        Err(reason) => {
            reject(&shared, sink, stream, addr, reason).await;
            return Ok(());
        }
    };

    let room = shared.room(room_id).await;
    let conn_id = Uuid::new_v4();
    let Some(mut rx) = room
        .broadcast
        .try_add_peer(conn_id, shared.config.max_peers_per_room)
        .await
    else {
        reject(&shared, sink, stream, addr, "room is full").await;
        return Ok(());
    };

    shared
        .stats
        .active_connections
        .fetch_add(1, Ordering::Relaxed);
    let mut peer = PeerConnection {
        shared: &shared,
        room: &room,
        conn_id,
        peer_id: None,
    };
    let result = peer.serve(&mut sink, &mut stream, &mut rx).await;
    peer.leave().await;
    shared
        .stats
        .active_connections
        .fetch_sub(1, Ordering::Relaxed);
    let _ = sink.close().await;
    result
}

async fn accept_loop(listener: TcpListener, shared: Arc<RelayShared>) -> Result<(), RelayError> {
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("relay: tcp connection from {addr}");
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(shared, stream, addr).await {
                log::debug!("relay: connection {addr} ended with error: {e}");
            }
        });
    }
}

/// The relay server.
pub struct SyncRelay {
    listener: TcpListener,
    shared: Arc<RelayShared>,
}

impl SyncRelay {
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            shared: Arc::new(RelayShared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: AtomicRelayStats::default(),
                shutdown,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), RelayError> {
        log::info!("relay listening on {}", self.local_addr()?);
        accept_loop(self.listener, self.shared).await
    }

    /// Run on the current runtime in the background.
    pub fn spawn(self) -> Result<RelayHandle, RelayError> {
        let addr = self.local_addr()?;
        log::info!("relay listening on {addr}");
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            if let Err(e) = accept_loop(self.listener, self.shared).await {
                log::error!("relay: accept loop failed: {e}");
            }
        });
        Ok(RelayHandle { addr, shared, task })
    }
}

/// Handle to a spawned relay.
pub struct RelayHandle {
    addr: SocketAddr,
    shared: Arc<RelayShared>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint clients pass to `connect`.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats().await
    }

    /// Peers currently connected to `room_id`.
    pub async fn peer_count(&self, room_id: &str) -> usize {
        let room = self.shared.rooms.read().await.get(room_id).cloned();
        match room {
            Some(room) => room.broadcast.peer_count().await,
            None => 0,
        }
    }

    /// Record ids held by the relay's replica of `room_id`.
    pub async fn room_len(&self, room_id: &str) -> Option<usize> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(room_id).map(|room| room.doc.len())
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.send_replace(true);
        self.task.abort();
        let _ = (&mut self.task).await;
        log::info!("relay on {} shut down", self.addr);
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        self.task.abort();
    }
}
