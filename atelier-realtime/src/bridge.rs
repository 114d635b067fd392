//! Cross-process event propagation over a shared pub/sub bus.
//!
//! Every gateway process publishes its workspace events to a channel
//! derived from the workspace id and holds one wildcard subscription
//! covering all such channels. Events received from the bus are handed
//! back to the local fan-out path, never re-published — the
//! `origin_node` stamp on each envelope lets a process discard its own
//! publications, which is what breaks the feedback loop across the
//! fleet.
//!
//! This is a volatile signaling layer: per-channel FIFO only as far as
//! the transport provides it, at-most-once delivery, no replay.
//!
//! Reference: Kleppmann, Chapter 11 — Messaging Systems

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{WorkspaceEvent, WorkspaceId};

/// Channel prefix shared by the whole fleet.
pub const CHANNEL_PREFIX: &str = "workspace:";
/// Wildcard pattern matching every workspace channel.
pub const CHANNEL_PATTERN: &str = "workspace:*";

/// Bus channel name for a workspace.
pub fn channel_for(workspace: WorkspaceId) -> String {
    format!("{CHANNEL_PREFIX}{workspace}")
}

/// Glob-lite matching: a literal channel name, or a prefix followed by
/// a single trailing `*`. That is all the fleet's patterns use.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// What the bridge puts on the wire.
///
/// `origin_node` identifies the publishing gateway process so that
/// subscribers can drop envelopes they published themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin_node: Uuid,
    pub event: WorkspaceEvent,
}

impl BusEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BridgeError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BridgeError::Encoding(e.to_string()))?;
        Ok(envelope)
    }
}

/// A raw message delivered by a bus subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Bridge errors. All of them are reported and survived — a bus outage
/// degrades cross-process visibility, it never takes the gateway down.
#[derive(Debug)]
pub enum BridgeError {
    Connection(String),
    Publish(String),
    Subscribe(String),
    Encoding(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "bus connection error: {e}"),
            Self::Publish(e) => write!(f, "bus publish error: {e}"),
            Self::Subscribe(e) => write!(f, "bus subscribe error: {e}"),
            Self::Encoding(e) => write!(f, "bus envelope error: {e}"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// The shared pub/sub transport the fleet synchronizes through.
///
/// Implementations keep the publish path and the subscription on
/// separate connections — a connection blocked in subscribe mode cannot
/// issue publish commands on most pub/sub transports.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Fire-and-forget publish to one channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BridgeError>;

    /// Long-lived pattern subscription. The returned stream ends when
    /// the transport shuts down.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BusMessage>, BridgeError>;
}

// ───────────────────────────────────────────────────────────────────
// Redis transport
// ───────────────────────────────────────────────────────────────────

/// Redis-backed bus: one multiplexed connection for PUBLISH, one
/// dedicated pub/sub connection per subscription (PSUBSCRIBE).
pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

impl RedisBus {
    /// Connect both halves up front so a bad URL fails at startup, not
    /// on the first publish.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client =
            redis::Client::open(url).map_err(|e| BridgeError::Connection(e.to_string()))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl BusTransport for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let mut conn = self.publisher.clone();
        let _: () = conn
            .publish(channel, payload)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BusMessage>, BridgeError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BridgeError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("dropping unreadable bus message on {channel}: {e}");
                        continue;
                    }
                };
                if tx.send(BusMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            log::info!("redis subscription stream closed");
        });
        Ok(rx)
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process transport
// ───────────────────────────────────────────────────────────────────

/// A process-wide bus over a broadcast channel.
///
/// Cloning the bus yields another handle to the *same* bus, so several
/// gateway instances inside one test binary behave like independent
/// processes sharing one transport.
#[derive(Clone)]
pub struct InProcessBus {
    sender: broadcast::Sender<BusMessage>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for InProcessBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        // No subscribers is not an error, same as a pub/sub bus.
        let _ = self.sender.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<BusMessage>, BridgeError> {
        let mut bus_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(msg) => {
                        if channel_matches(&pattern, &msg.channel)
                            && tx.send(msg).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("in-process bus subscriber lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

// ───────────────────────────────────────────────────────────────────
// Bridge
// ───────────────────────────────────────────────────────────────────

/// Callback invoked for each foreign event arriving from the bus.
pub type BridgeHandler = Arc<dyn Fn(WorkspaceEvent) + Send + Sync>;

/// Bridge counters, read via [`CrossProcessBridge::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub received: u64,
    pub skipped_own: u64,
    pub decode_failures: u64,
}

#[derive(Default)]
struct AtomicBridgeStats {
    published: AtomicU64,
    received: AtomicU64,
    skipped_own: AtomicU64,
    decode_failures: AtomicU64,
}

/// Publishes local workspace events to the shared bus and re-injects
/// foreign ones into this process.
///
/// Handlers are kept in an explicit channel→handler table owned by the
/// bridge; registration and deregistration are the caller's lifecycle
/// to manage, so nothing leaks when a workspace goes quiet. The
/// receiving path only ever dispatches — it never publishes.
pub struct CrossProcessBridge {
    node_id: Uuid,
    bus: Arc<dyn BusTransport>,
    handlers: Arc<RwLock<Vec<(String, BridgeHandler)>>>,
    stats: Arc<AtomicBridgeStats>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CrossProcessBridge {
    pub fn new(bus: Arc<dyn BusTransport>) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            bus,
            handlers: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(AtomicBridgeStats::default()),
            pump: Mutex::new(None),
        }
    }

    /// Identity of this gateway process on the bus.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Register a handler for a channel name or pattern.
    pub fn register(&self, channel: impl Into<String>, handler: BridgeHandler) {
        self.handlers.write().push((channel.into(), handler));
    }

    /// Drop every handler registered under `channel`.
    pub fn deregister(&self, channel: &str) {
        self.handlers.write().retain(|(name, _)| name != channel);
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Establish the wildcard subscription and start the receive pump.
    ///
    /// Envelopes stamped with our own node id are discarded — they are
    /// our publications echoed back by the bus.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut rx = self.bus.subscribe(CHANNEL_PATTERN).await?;
        let handlers = self.handlers.clone();
        let stats = self.stats.clone();
        let node_id = self.node_id;

        let pump = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let envelope = match BusEnvelope::decode(&msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("undecodable envelope on {}: {e}", msg.channel);
                        continue;
                    }
                };

                if envelope.origin_node == node_id {
                    stats.skipped_own.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                stats.received.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "bridge received {} for workspace {} from node {}",
                    envelope.event.name(),
                    envelope.event.workspace_id(),
                    envelope.origin_node
                );

                let matching: Vec<BridgeHandler> = handlers
                    .read()
                    .iter()
                    .filter(|(pattern, _)| channel_matches(pattern, &msg.channel))
                    .map(|(_, handler)| handler.clone())
                    .collect();
                for handler in matching {
                    handler(envelope.event.clone());
                }
            }
            log::info!("bridge receive pump stopped");
        });

        *self.pump.lock() = Some(pump);
        Ok(())
    }

    /// Publish one event to its workspace channel.
    ///
    /// Fire-and-forget: the caller logs failures and moves on, the
    /// local broadcast that already happened stands.
    pub async fn publish(&self, event: &WorkspaceEvent) -> Result<(), BridgeError> {
        let envelope = BusEnvelope {
            origin_node: self.node_id,
            event: event.clone(),
        };
        let payload = envelope.encode()?;
        self.bus.publish(&channel_for(event.workspace_id()), payload).await?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.stats.published.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            skipped_own: self.stats.skipped_own.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CrossProcessBridge {
    fn drop(&mut self) {
        // Teardown: in-flight messages are not guaranteed delivered.
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
