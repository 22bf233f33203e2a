//! WebSocket transport between a replicated board and the relay.
//!
//! One provider owns one connection target `<endpoint>/<room>?token=..`.
//! A supervisor task keeps the connection alive with exponential backoff,
//! runs the state-vector handshake on every (re)connect, ships local replica
//! updates as deltas and applies remote ones with the `remote` origin.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use studyboard_core::{ReplicatedDoc, SyncOrigin};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use crate::error::TransportError;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, SyncMessage};

/// Reconnect delay schedule.
///
/// Attempt `n` waits `initial * multiplier^n`, capped at `max`, then
/// stretched by a random factor in `[0, jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 2.0,
            max: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before retry `attempt` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = (self.initial.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.min(1.0);
        if jitter.is_nan() || jitter <= 0.0 {
            return base;
        }
        let stretch = rand::rng().random_range(0.0..=jitter);
        base.mul_f64(1.0 + stretch)
    }
}

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub backoff: Backoff,
    /// Consecutive failed attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: None,
            heartbeat_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    /// `true` once the handshake of a connection completed, `false` when
    /// that connection is lost
    Synced(bool),
    Awareness(AwarenessMessage),
    PeerLeft(Uuid),
    /// Relay refused the connection; retrying stops
    Rejected(String),
}

/// Build `<endpoint>/<room_id>?token=<auth_token>`.
pub fn build_url(endpoint: &str, room_id: &str, auth_token: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(endpoint)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::Scheme(endpoint.to_string()));
    }
    url.path_segments_mut()
        .map_err(|_| TransportError::CannotBeBase(endpoint.to_string()))?
        .pop_if_empty()
        .push(room_id);
    url.query_pairs_mut().append_pair("token", auth_token);
    Ok(url)
}

/// Cloneable awareness sender detached from the provider's lifetime.
#[derive(Clone)]
pub struct AwarenessPublisher {
    shared: Weak<Shared>,
}

impl AwarenessPublisher {
    /// Returns `false` when the provider is gone.
    pub fn publish(&self, msg: AwarenessMessage) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.publish_awareness(msg);
                true
            }
            None => false,
        }
    }
}

enum Outbound {
    Update(Vec<u8>),
    Awareness(AwarenessMessage),
}

struct Shared {
    client_id: Uuid,
    replica: Arc<ReplicatedDoc>,
    config: TransportConfig,
    status: watch::Sender<ConnectionStatus>,
    synced: AtomicBool,
    clock: AtomicU64,
    /// Last local awareness, re-sent after every reconnect
    awareness: Mutex<Option<AwarenessMessage>>,
    events: mpsc::Sender<TransportEvent>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Outbound>>,
}

impl Shared {
    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn cached_awareness(&self) -> Option<AwarenessMessage> {
        self.awareness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_awareness(&self, msg: AwarenessMessage) {
        {
            let mut cached = self.awareness.lock().unwrap_or_else(PoisonError::into_inner);
            *cached = match &msg {
                AwarenessMessage::Update { .. } => Some(msg.clone()),
                AwarenessMessage::Leave { .. } => None,
            };
        }
        if self.status() == ConnectionStatus::Connected {
            let _ = self.outbound_tx.send(Outbound::Awareness(msg));
        }
    }

    fn swap_status(&self, status: ConnectionStatus) -> bool {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }

    async fn emit(&self, event: TransportEvent) {
        // A dropped receiver only means nobody listens anymore.
        let _ = self.events.send(event).await;
    }

    async fn set_status(&self, status: ConnectionStatus) {
        if self.swap_status(status) {
            log::debug!("transport {}: {:?}", self.client_id, status);
            self.emit(TransportEvent::Status(status)).await;
        }
    }

    async fn connection_lost(&self) {
        self.set_status(ConnectionStatus::Disconnected).await;
        if self.synced.swap(false, Ordering::AcqRel) {
            self.emit(TransportEvent::Synced(false)).await;
        }
    }

    fn outbound_message(&self, item: Outbound) -> Result<SyncMessage, TransportError> {
        let clock = self.next_clock();
        Ok(match item {
            Outbound::Update(update) => SyncMessage::delta(self.client_id, clock, update),
            Outbound::Awareness(msg) => SyncMessage::awareness(self.client_id, clock, &msg)?,
        })
    }

    fn apply_remote(&self, update: &[u8], what: &str) -> bool {
        match self.replica.apply_update(update, SyncOrigin::Remote) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("transport {}: dropping {what}: {e}", self.client_id);
                false
            }
        }
    }

    /// Handle one relay frame, returning the reply to send, if any.
    async fn handle_frame(&self, bytes: &[u8]) -> Result<Option<SyncMessage>, TransportError> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("transport {}: undecodable frame: {e}", self.client_id);
                return Ok(None);
            }
        };

        match msg.msg_type {
            MessageType::SyncStep1 => match self.replica.encode_diff(&msg.payload) {
                Ok(diff) => return Ok(Some(SyncMessage::sync_step2(self.client_id, diff))),
                Err(e) => log::warn!("transport {}: bad state vector: {e}", self.client_id),
            },
            MessageType::SyncStep2 => {
                if self.apply_remote(&msg.payload, "sync step 2")
                    && !self.synced.swap(true, Ordering::AcqRel)
                {
                    log::info!("transport {}: synced", self.client_id);
                    self.emit(TransportEvent::Synced(true)).await;
                }
            }
            MessageType::Delta => {
                self.apply_remote(&msg.payload, "delta");
            }
            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => self.emit(TransportEvent::Awareness(awareness)).await,
                Err(e) => log::warn!("transport {}: bad awareness: {e}", self.client_id),
            },
            MessageType::PeerLeft => self.emit(TransportEvent::PeerLeft(msg.peer_id)).await,
            MessageType::Rejected => {
                return Err(TransportError::Rejected(msg.rejection_reason()?));
            }
            MessageType::Ping => return Ok(Some(SyncMessage::pong(self.client_id))),
            MessageType::Pong => log::trace!("transport {}: pong", self.client_id),
        }
        Ok(None)
    }
}

async fn send_message<S>(sink: &mut S, msg: &SyncMessage) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

/// One connection, from dial to close. Sets `established` once the
/// WebSocket is open.
async fn run_connection(
    shared: &Shared,
    url: &Url,
    established: &mut bool,
) -> Result<(), TransportError> {
    let (ws, _) = tokio::time::timeout(
        shared.config.connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    .map_err(|_| TransportError::Timeout)??;
    *established = true;

    let (mut sink, mut stream) = ws.split();
    let mut outbound = shared.outbound_rx.lock().await;
    // The handshake diff carries whatever was queued while offline.
    let mut stale = 0usize;
    while outbound.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        log::debug!("transport {}: dropped {stale} queued items", shared.client_id);
    }

    shared.set_status(ConnectionStatus::Connected).await;
    send_message(
        &mut sink,
        &SyncMessage::sync_step1(shared.client_id, shared.replica.state_vector()),
    )
    .await?;
    if let Some(awareness) = shared.cached_awareness() {
        let msg = shared.outbound_message(Outbound::Awareness(awareness))?;
        send_message(&mut sink, &msg).await?;
    }

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    if let Some(reply) = shared.handle_frame(&bytes).await? {
                        send_message(&mut sink, &reply).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            item = outbound.recv() => match item {
                Some(item) => {
                    let msg = shared.outbound_message(item)?;
                    send_message(&mut sink, &msg).await?;
                }
                None => return Ok(()),
            },
            _ = heartbeat.tick() => {
                send_message(&mut sink, &SyncMessage::ping(shared.client_id)).await?;
            }
        }
    }
}

/// Keep `url` connected until rejected, aborted or out of attempts.
async fn supervise(shared: Arc<Shared>, url: Url) {
    let mut attempt: u32 = 0;
    loop {
        shared.set_status(ConnectionStatus::Connecting).await;
        let mut established = false;
        let result = run_connection(&shared, &url, &mut established).await;
        shared.connection_lost().await;

        match result {
            Ok(()) => log::info!("transport {}: connection closed", shared.client_id),
            Err(TransportError::Rejected(reason)) => {
                log::warn!("transport {}: rejected by relay: {reason}", shared.client_id);
                shared.emit(TransportEvent::Rejected(reason)).await;
                return;
            }
            Err(e) => log::warn!("transport {}: connection failed: {e}", shared.client_id),
        }

        if established {
            attempt = 0;
        }
        if let Some(max) = shared.config.max_attempts {
            if attempt >= max {
                log::warn!(
                    "transport {}: giving up after {attempt} attempts",
                    shared.client_id
                );
                return;
            }
        }
        let delay = shared.config.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        log::debug!(
            "transport {}: retry {attempt} in {delay:?}",
            shared.client_id
        );
        tokio::time::sleep(delay).await;
    }
}

/// Connects one replica to one relay room.
pub struct TransportProvider {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    target: Option<Url>,
    task: Option<JoinHandle<()>>,
    subscription: Option<yrs::Subscription>,
}

impl TransportProvider {
    pub fn new(
        replica: Arc<ReplicatedDoc>,
        client_id: Uuid,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            client_id,
            replica: Arc::clone(&replica),
            config,
            status,
            synced: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            awareness: Mutex::new(None),
            events,
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let subscription = replica.observe_updates(move |origin, update| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if origin != Some(SyncOrigin::Local)
                || shared.status() == ConnectionStatus::Disconnected
            {
                return;
            }
            let _ = shared.outbound_tx.send(Outbound::Update(update.to_vec()));
        })?;

        Ok(Self {
            shared,
            event_rx: Some(event_rx),
            target: None,
            task: None,
            subscription: Some(subscription),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Start (or restart) the connection to `<endpoint>/<room_id>`.
    pub fn connect(
        &mut self,
        endpoint: &str,
        room_id: &str,
        auth_token: &str,
    ) -> Result<(), TransportError> {
        let url = build_url(endpoint, room_id, auth_token)?;
        self.start(url)
    }

    /// Resume with the last target after `disconnect`.
    pub fn reconnect(&mut self) -> Result<(), TransportError> {
        let url = self.target.clone().ok_or(TransportError::NoTarget)?;
        self.start(url)
    }

    fn start(&mut self, url: Url) -> Result<(), TransportError> {
        let handle = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        self.stop();
        log::info!(
            "transport {}: connecting to {}{}",
            self.shared.client_id,
            url.host_str().unwrap_or_default(),
            url.path()
        );
        self.target = Some(url.clone());
        self.task = Some(handle.spawn(supervise(Arc::clone(&self.shared), url)));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.shared.swap_status(ConnectionStatus::Disconnected) {
            let _ = self
                .shared
                .events
                .try_send(TransportEvent::Status(ConnectionStatus::Disconnected));
        }
        if self.shared.synced.swap(false, Ordering::AcqRel) {
            let _ = self.shared.events.try_send(TransportEvent::Synced(false));
        }
    }

    /// Close the connection and stop retrying. The target is kept.
    pub fn disconnect(&mut self) {
        self.stop();
    }

    /// Release the connection and the replica subscription.
    pub fn destroy(&mut self) {
        self.stop();
        self.target = None;
        self.subscription = None;
        *self
            .shared
            .awareness
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Cache `msg` as the local awareness and send it when connected.
    pub fn publish_awareness(&self, msg: AwarenessMessage) {
        self.shared.publish_awareness(msg);
    }

    /// Handle for publishing awareness from another task. It stops working
    /// once the provider is dropped.
    pub fn awareness_publisher(&self) -> AwarenessPublisher {
        AwarenessPublisher {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Acquire)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    pub fn target(&self) -> Option<&Url> {
        self.target.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.subscription.is_none()
    }
}

impl Drop for TransportProvider {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
