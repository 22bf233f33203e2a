//! Presence: who else is on the board and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer move (document coordinates)
//!       │
//!       ▼
//! PresenceChannel::update_cursor()
//!       │  (throttled: 33ms)
//!       ▼
//! AwarenessMessage::Update { … }
//!       │
//!       ▼   (relay fan-out)
//! Remote PresenceChannel::handle_message()
//!       │  (stale clocks rejected)
//!       ▼
//! on_change listeners ← ordered participants, self excluded
//! ```
//!
//! Awareness is never persisted. A peer disappears when it sends `Leave`,
//! when the relay reports its connection closed, or when it goes silent
//! longer than the idle timeout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use studyboard_core::ListenerHandle;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Minimum interval between two cursor broadcasts.
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Position in document coordinates, independent of any viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Vec2) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGBA color for a participant's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a client id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, alpha dropped.
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

impl Default for CursorColor {
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
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
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

/// Display identity supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub color: CursorColor,
}

impl Identity {
    pub fn new(name: impl Into<String>, color: CursorColor) -> Self {
        Self {
            name: name.into(),
            color,
        }
    }

    /// Identity whose color is derived from the client id.
    pub fn for_client(name: impl Into<String>, client_id: Uuid) -> Self {
        Self::new(name, CursorColor::from_uuid(client_id))
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Carried inside `SyncMessage` awareness payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full presence slot of one client.
    Update {
        client_id: Uuid,
        identity: Identity,
        /// `None` while the pointer is off the canvas.
        cursor: Option<Vec2>,
        /// Sender-local counter; lower or equal values are stale.
        clock: u64,
    },
    /// Clean departure.
    Leave { client_id: Uuid },
}

impl AwarenessMessage {
    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Update { client_id, .. } => *client_id,
            AwarenessMessage::Leave { client_id } => *client_id,
        }
    }

    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence channel
// ───────────────────────────────────────────────────────────────────

/// A remote collaborator as shown in the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub client_id: Uuid,
    pub identity: Identity,
    pub cursor: Option<Vec2>,
}

pub type ParticipantsListener = Arc<dyn Fn(&[Participant]) + Send + Sync>;

#[derive(Debug, Clone)]
struct PeerState {
    identity: Identity,
    cursor: Option<Vec2>,
    clock: u64,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct LocalSlot {
    identity: Identity,
    cursor: Option<Vec2>,
}

struct PresenceState {
    local: Option<LocalSlot>,
    clock: u64,
    peers: HashMap<Uuid, PeerState>,
    last_cursor_broadcast: Option<Instant>,
    cursor_interval: Duration,
}

impl PresenceState {
    fn next_update(&mut self, client_id: Uuid) -> Option<AwarenessMessage> {
        let local = self.local.as_ref()?;
        self.clock += 1;
        Some(AwarenessMessage::Update {
            client_id,
            identity: local.identity.clone(),
            cursor: local.cursor,
            clock: self.clock,
        })
    }

    fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self
            .peers
            .iter()
            .map(|(id, peer)| Participant {
                client_id: *id,
                identity: peer.identity.clone(),
                cursor: peer.cursor,
            })
            .collect();
        list.sort_by(|a, b| {
            a.identity
                .name
                .cmp(&b.identity.name)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        list
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local presence slot plus the tracked state of every remote peer.
pub struct PresenceChannel {
    local_id: Uuid,
    state: Mutex<PresenceState>,
    listeners: Arc<Mutex<Vec<(u64, ParticipantsListener)>>>,
    next_listener: AtomicU64,
}

impl PresenceChannel {
    pub fn new(local_id: Uuid) -> Self {
        Self::with_interval(local_id, CURSOR_BROADCAST_INTERVAL)
    }

    /// Custom cursor throttle interval (tests use zero or very long ones).
    pub fn with_interval(local_id: Uuid, cursor_interval: Duration) -> Self {
        Self {
            local_id,
            state: Mutex::new(PresenceState {
                local: None,
                clock: 0,
                peers: HashMap::new(),
                last_cursor_broadcast: None,
                cursor_interval,
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Set this client's slot and return the message to broadcast.
    pub fn publish_local(&self, identity: Identity, cursor: Option<Vec2>) -> AwarenessMessage {
        let mut state = lock(&self.state);
        state.local = Some(LocalSlot { identity: identity.clone(), cursor });
        state.clock += 1;
        state.last_cursor_broadcast = Some(Instant::now());
        AwarenessMessage::Update {
            client_id: self.local_id,
            identity,
            cursor,
            clock: state.clock,
        }
    }

    /// Move the local cursor. Returns a message only when one should go out:
    /// never before `publish_local`, at most once per throttle interval, and
    /// always when the cursor is hidden.
    pub fn update_cursor(&self, cursor: Option<Vec2>) -> Option<AwarenessMessage> {
        let mut state = lock(&self.state);
        let local = state.local.as_mut()?;
        local.cursor = cursor;

        let throttled = match state.last_cursor_broadcast {
            Some(last) => last.elapsed() < state.cursor_interval,
            None => false,
        };
        if throttled && cursor.is_some() {
            return None;
        }

        state.last_cursor_broadcast = Some(Instant::now());
        state.next_update(self.local_id)
    }

    /// Current local slot with a fresh clock, bypassing the throttle.
    pub fn local_message(&self) -> Option<AwarenessMessage> {
        lock(&self.state).next_update(self.local_id)
    }

    /// Clear the local slot and return the departure message.
    pub fn leave_message(&self) -> AwarenessMessage {
        lock(&self.state).local = None;
        AwarenessMessage::Leave {
            client_id: self.local_id,
        }
    }

    /// Apply a message from the network. Returns whether the participant
    /// list changed.
    pub fn handle_message(&self, msg: &AwarenessMessage) -> bool {
        if msg.client_id() == self.local_id {
            return false;
        }

        let changed = {
            let mut state = lock(&self.state);
            match msg {
                AwarenessMessage::Update {
                    client_id,
                    identity,
                    cursor,
                    clock,
                } => match state.peers.get_mut(client_id) {
                    Some(peer) if *clock <= peer.clock => {
                        log::trace!("presence: stale update from {client_id} ({clock} <= {})", peer.clock);
                        false
                    }
                    Some(peer) => {
                        peer.identity = identity.clone();
                        peer.cursor = *cursor;
                        peer.clock = *clock;
                        peer.last_seen = Instant::now();
                        true
                    }
                    None => {
                        log::debug!("presence: {} ({client_id}) joined", identity.name);
                        state.peers.insert(
                            *client_id,
                            PeerState {
                                identity: identity.clone(),
                                cursor: *cursor,
                                clock: *clock,
                                last_seen: Instant::now(),
                            },
                        );
                        true
                    }
                },
                AwarenessMessage::Leave { client_id } => {
                    let removed = state.peers.remove(client_id).is_some();
                    if removed {
                        log::debug!("presence: {client_id} left");
                    }
                    removed
                }
            }
        };

        if changed {
            self.notify();
        }
        changed
    }

    /// Drop a peer whose connection closed.
    pub fn remove_peer(&self, client_id: &Uuid) -> bool {
        let removed = lock(&self.state).peers.remove(client_id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Remove peers silent for longer than `timeout`.
    pub fn evict_idle(&self, timeout: Duration) -> Vec<Uuid> {
        let stale: Vec<Uuid> = {
            let mut state = lock(&self.state);
            let stale: Vec<Uuid> = state
                .peers
                .iter()
                .filter(|(_, peer)| peer.last_seen.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                state.peers.remove(id);
            }
            stale
        };

        if !stale.is_empty() {
            log::debug!("presence: evicted {} idle peers", stale.len());
            self.notify();
        }
        stale
    }

    /// Forget every remote peer.
    pub fn clear(&self) {
        let had_peers = {
            let mut state = lock(&self.state);
            let had_peers = !state.peers.is_empty();
            state.peers.clear();
            had_peers
        };
        if had_peers {
            self.notify();
        }
    }

    /// Remote participants ordered by display name, then client id.
    pub fn participants(&self) -> Vec<Participant> {
        lock(&self.state).participants()
    }

    pub fn participant(&self, client_id: &Uuid) -> Option<Participant> {
        let state = lock(&self.state);
        state.peers.get(client_id).map(|peer| Participant {
            client_id: *client_id,
            identity: peer.identity.clone(),
            cursor: peer.cursor,
        })
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.state).peers.len()
    }

    /// Called with the full participant list after every change.
    pub fn on_change(&self, listener: ParticipantsListener) -> ListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, listener));

        let registry = Arc::downgrade(&self.listeners);
        ListenerHandle::new(move || {
            if let Some(registry) = registry.upgrade() {
                lock(&registry).retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    // Listeners run with no presence lock held.
    fn notify(&self) {
        let participants = self.participants();
        let listeners: Vec<ParticipantsListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&participants);
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
