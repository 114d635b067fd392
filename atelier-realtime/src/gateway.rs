//! WebSocket gateway: connection acceptor and message dispatcher.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── Presence Registry (local)
//!             ├── Gateway (this proc) ┤
//! Client B ──┘         │              └── Local Broadcaster ── rooms
//!                      │
//!               Cross-Process Bridge
//!                      │
//!              shared pub/sub bus ──── other gateway processes
//! ```
//!
//! Each connection is authenticated during the WebSocket handshake
//! (`Authorization: Bearer` header or `token` query parameter) and then
//! runs its own task: inbound frames are dispatched to handlers one at
//! a time, outbound room frames arrive over a per-connection channel.
//! Handlers mutate the presence registry, fan out locally, and hand the
//! same event to the bridge for the rest of the fleet. One bad frame or
//! one dying socket never affects another session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{bearer_from_header, token_from_query, Principal, TokenVerifier};
use crate::bridge::{BridgeError, BusTransport, CrossProcessBridge, CHANNEL_PATTERN};
use crate::broadcast::{frame_is_for, LocalBroadcaster, RoomFrame};
use crate::presence::PresenceRegistry;
use crate::protocol::{
    ChangeType, ClientRequest, CursorPosition, ServerMessage, SessionId, WorkspaceEvent,
    WorkspaceId,
};
use crate::session::Session;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per workspace room.
    pub broadcast_capacity: usize,
    /// Local session cap per workspace; further joins are refused.
    pub max_sessions_per_workspace: usize,
    /// HS256 secret bearer tokens are verified against.
    pub jwt_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9500".to_string(),
            broadcast_capacity: 256,
            max_sessions_per_workspace: 100,
            jwt_secret: "change-me".to_string(),
        }
    }
}

/// Gateway counters, read via [`Gateway::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub messages_in: u64,
}

#[derive(Default)]
struct AtomicGatewayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    messages_in: AtomicU64,
}

/// Gateway errors. Only startup failures reach the caller of
/// [`Gateway::run`]; per-connection errors stay in their task.
#[derive(Debug)]
pub enum GatewayError {
    Io(std::io::Error),
    Bridge(BridgeError),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Bridge(e) => write!(f, "bridge error: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The connection acceptor and per-session protocol state machine.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<PresenceRegistry>,
    broadcaster: Arc<LocalBroadcaster>,
    bridge: Arc<CrossProcessBridge>,
    verifier: Arc<TokenVerifier>,
    stats: AtomicGatewayStats,
}

impl Gateway {
    /// Build a gateway around an injected registry and bus transport.
    pub fn new(
        config: GatewayConfig,
        registry: Arc<PresenceRegistry>,
        bus: Arc<dyn BusTransport>,
    ) -> Self {
        let broadcaster = Arc::new(LocalBroadcaster::new(config.broadcast_capacity));
        let bridge = Arc::new(CrossProcessBridge::new(bus));
        let verifier = Arc::new(TokenVerifier::new(&config.jwt_secret));
        Self {
            config,
            registry,
            broadcaster,
            bridge,
            verifier,
            stats: AtomicGatewayStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<LocalBroadcaster> {
        &self.broadcaster
    }

    pub fn bridge(&self) -> &Arc<CrossProcessBridge> {
        &self.bridge
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            messages_in: self.stats.messages_in.load(Ordering::Relaxed),
        }
    }

    /// Start the bridge pump and accept connections until the listener
    /// fails. Call from an async runtime.
    pub async fn run(self: Arc<Self>) -> Result<(), GatewayError> {
        // Foreign events re-enter through the local fan-out path only;
        // the bridge's receiving side never publishes.
        let broadcaster = self.broadcaster.clone();
        self.bridge.register(
            CHANNEL_PATTERN,
            Arc::new(move |event: WorkspaceEvent| {
                if let Err(e) = broadcaster.broadcast(&event, false) {
                    log::error!("rebroadcast of bridged {} failed: {e}", event.name());
                }
            }),
        );
        self.bridge.start().await.map_err(GatewayError::Bridge)?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("gateway listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, addr).await {
                    log::debug!("connection from {addr} ended: {e}");
                }
            });
        }
    }

    /// Handle one client connection from handshake to cleanup.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        let verifier = self.verifier.clone();
        let mut principal: Option<Principal> = None;

        let authenticate = |request: &Request, response: Response| {
            let token = request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(bearer_from_header)
                .map(str::to_string)
                .or_else(|| {
                    request
                        .uri()
                        .query()
                        .and_then(token_from_query)
                        .map(str::to_string)
                });
            let Some(token) = token else {
                return Err(unauthorized());
            };
            match verifier.verify(&token) {
                Ok(verified) => {
                    principal = Some(verified);
                    Ok(response)
                }
                Err(_) => Err(unauthorized()),
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, authenticate).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::info!("handshake refused from {addr}: {e}");
                return Ok(());
            }
        };
        let Some(principal) = principal else {
            // The callback ran and succeeded, so this cannot happen;
            // refuse rather than serve an unauthenticated socket.
            return Ok(());
        };

        let mut session = Session::new(principal);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "client connected: {} (user {})",
            session.session_id,
            session.principal.user_id
        );

        let (mut sink, mut inbound) = ws_stream.split();
        // Room forwarders push pre-encoded frames here; this task owns
        // the only writer to the socket.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<String>>();
        let mut forwarders: HashMap<WorkspaceId, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                frame = inbound.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.messages_in.fetch_add(1, Ordering::Relaxed);
                            let reply = self
                                .dispatch(&mut session, text.as_str(), &out_tx, &mut forwarders)
                                .await;
                            if let Some(reply) = reply {
                                if sink.send(Message::text(reply)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("socket error from {}: {e}", session.session_id);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(payload) => {
                            // Best-effort: a failing write ends this
                            // session only.
                            if sink.send(Message::text(payload.as_str())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Disconnect cleanup runs whatever handler was last active.
        for (_, forwarder) in forwarders.drain() {
            forwarder.abort();
        }
        let affected = self.registry.remove_everywhere(session.session_id);
        for workspace in affected {
            let event = WorkspaceEvent::user_left(
                session.session_id,
                session.broadcast_name(),
                workspace,
            );
            // Implicit disconnects propagate across the fleet as well;
            // remote replicas would otherwise keep this session in
            // their presence view forever.
            self.broadcast_and_publish(&event).await;
            self.broadcaster.remove_if_idle(workspace);
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("client disconnected: {}", session.session_id);

        Ok(())
    }

    /// Decode, validate, and route one inbound frame. Returns the reply
    /// frame to send back, if any.
    async fn dispatch(
        &self,
        session: &mut Session,
        text: &str,
        out_tx: &mpsc::UnboundedSender<Arc<String>>,
        forwarders: &mut HashMap<WorkspaceId, JoinHandle<()>>,
    ) -> Option<String> {
        let request = match ClientRequest::decode(text) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("malformed frame from {}: {e}", session.session_id);
                return reply(ServerMessage::error("Invalid message"));
            }
        };
        if let Err(e) = request.validate() {
            return reply(ServerMessage::error(e.to_string()));
        }

        match request {
            ClientRequest::Ping => reply(ServerMessage::Pong {
                timestamp: Utc::now(),
            }),
            ClientRequest::JoinWorkspace {
                workspace_id,
                user_name,
            } => {
                self.handle_join(session, workspace_id, user_name, out_tx, forwarders)
                    .await
            }
            ClientRequest::LeaveWorkspace { workspace_id } => {
                self.handle_leave(session, workspace_id, forwarders).await
            }
            ClientRequest::FileChange {
                workspace_id,
                file_name,
                change_type,
                content,
            } => {
                self.handle_file_change(session, workspace_id, file_name, change_type, content)
                    .await
            }
            ClientRequest::CursorUpdate {
                workspace_id,
                file_name,
                line,
                column,
            } => self.handle_cursor_update(session, workspace_id, file_name, line, column),
        }
    }

    async fn handle_join(
        &self,
        session: &mut Session,
        workspace: WorkspaceId,
        user_name: String,
        out_tx: &mpsc::UnboundedSender<Arc<String>>,
        forwarders: &mut HashMap<WorkspaceId, JoinHandle<()>>,
    ) -> Option<String> {
        let already_member = self.registry.contains(workspace, session.session_id);
        if !already_member
            && self.registry.count(workspace) >= self.config.max_sessions_per_workspace
        {
            return reply(ServerMessage::nack("Workspace is full"));
        }

        // Subscribe before broadcasting so the joiner observes its own
        // user:joined — it has no prior room state to exclude.
        forwarders.entry(workspace).or_insert_with(|| {
            spawn_forwarder(
                self.broadcaster.subscribe(workspace),
                session.session_id,
                out_tx.clone(),
            )
        });
        self.registry.join(workspace, session.session_id);
        session.joined(workspace, user_name.clone());

        let event = WorkspaceEvent::user_joined(session.session_id, user_name.clone(), workspace);
        if let Err(e) = self.broadcaster.broadcast(&event, false) {
            log::error!("local broadcast of user:joined failed: {e}");
        }
        if let Err(e) = self.bridge.publish(&event).await {
            log::warn!("bridge publish of user:joined failed: {e}");
        }

        log::info!("user {user_name} joined workspace {workspace}");
        reply(ServerMessage::ack_with_count(
            "Joined workspace successfully",
            self.registry.count(workspace),
        ))
    }

    async fn handle_leave(
        &self,
        session: &mut Session,
        workspace: WorkspaceId,
        forwarders: &mut HashMap<WorkspaceId, JoinHandle<()>>,
    ) -> Option<String> {
        // Unsubscribe first so the leaver does not see its own
        // user:left.
        if let Some(forwarder) = forwarders.remove(&workspace) {
            forwarder.abort();
        }
        self.registry.leave(workspace, session.session_id);

        let event = WorkspaceEvent::user_left(
            session.session_id,
            session.broadcast_name(),
            workspace,
        );
        self.broadcast_and_publish(&event).await;
        self.broadcaster.remove_if_idle(workspace);
        session.left(workspace);

        log::info!(
            "user {} left workspace {workspace}",
            session.broadcast_name().unwrap_or_else(|| session.session_id.to_string())
        );
        reply(ServerMessage::ack("Left workspace successfully"))
    }

    async fn handle_file_change(
        &self,
        session: &Session,
        workspace: WorkspaceId,
        file_name: String,
        change_type: ChangeType,
        content: Option<String>,
    ) -> Option<String> {
        let event = WorkspaceEvent::file_changed(
            session.session_id,
            session.broadcast_name(),
            workspace,
            file_name.clone(),
            change_type,
            content,
        );
        // The originator never receives its own echo.
        if let Err(e) = self.broadcaster.broadcast(&event, true) {
            log::error!("local broadcast of file:changed failed: {e}");
        }
        if let Err(e) = self.bridge.publish(&event).await {
            log::warn!("bridge publish of file:changed failed: {e}");
        }

        log::info!("file {file_name} {change_type:?} in workspace {workspace}");
        reply(ServerMessage::ack("File change broadcasted"))
    }

    fn handle_cursor_update(
        &self,
        session: &Session,
        workspace: WorkspaceId,
        file_name: String,
        line: u32,
        column: u32,
    ) -> Option<String> {
        let event = WorkspaceEvent::cursor_updated(
            session.session_id,
            session.broadcast_name(),
            workspace,
            file_name,
            CursorPosition { line, column },
        );
        // Cursor traffic stays process-local: highest frequency, lowest
        // value, so it is never handed to the bridge.
        if let Err(e) = self.broadcaster.broadcast(&event, true) {
            log::error!("local broadcast of cursor:updated failed: {e}");
        }

        reply(ServerMessage::Ack {
            success: true,
            message: None,
            active_users: None,
        })
    }

    /// Local fan-out plus fleet publish. A bus failure loses this one
    /// event for other processes; the local broadcast stands.
    async fn broadcast_and_publish(&self, event: &WorkspaceEvent) {
        if let Err(e) = self.broadcaster.broadcast(event, false) {
            log::error!("local broadcast of {} failed: {e}", event.name());
        }
        if let Err(e) = self.bridge.publish(event).await {
            log::warn!("bridge publish of {} failed: {e}", event.name());
        }
    }
}

fn reply(message: ServerMessage) -> Option<String> {
    match message.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("failed to encode reply: {e}");
            None
        }
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Forward room frames to one connection, applying origin exclusion.
fn spawn_forwarder(
    mut room_rx: broadcast::Receiver<RoomFrame>,
    session: SessionId,
    out_tx: mpsc::UnboundedSender<Arc<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match room_rx.recv().await {
                Ok(frame) => {
                    if !frame_is_for(&frame, session) {
                        continue;
                    }
                    if out_tx.send(frame.payload).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("session {session} lagged by {n} room frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
