//! Fan-out of relay frames to every connection in a room.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! frames; a receiver that falls further behind observes `Lagged` and must
//! be resynchronized by the caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Pre-encoded frame tagged with the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: Uuid,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated without taking the peer lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: RwLock<HashSet<Uuid>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames each receiver may buffer before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Frame>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer_id);
        self.sender.subscribe()
    }

    /// Register a peer unless the group already holds `max_peers`.
    pub async fn try_add_peer(
        &self,
        peer_id: Uuid,
        max_peers: usize,
    ) -> Option<broadcast::Receiver<Arc<Frame>>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= max_peers && !peers.contains(&peer_id) {
            return None;
        }
        peers.insert(peer_id);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode `msg` once and send it to every receiver, the sender's own
    /// included; receivers skip frames whose `sender` is themselves.
    pub fn broadcast(&self, from: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Frame {
            sender: from,
            bytes: msg.encode()?,
        };
        Ok(self.broadcast_raw(Arc::new(frame)))
    }

    /// Send an already-encoded frame. Lock-free.
    pub fn broadcast_raw(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }
}
