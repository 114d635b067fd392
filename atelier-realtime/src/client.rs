//! WebSocket client for the realtime gateway.
//!
//! Used by desktop/editor frontends and by the integration tests.
//! Wraps the connection lifecycle, sends typed protocol requests, and
//! surfaces everything the gateway pushes back (acks, pongs, workspace
//! events) on a single event channel.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    ChangeType, ClientRequest, ProtocolError, ServerFrame, ServerMessage, WorkspaceEvent,
    WorkspaceId,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established.
    Connected,
    /// Connection lost.
    Disconnected,
    /// A direct reply from the gateway (ack, pong, error).
    Reply(ServerMessage),
    /// A workspace broadcast.
    Event(WorkspaceEvent),
}

/// A connection to one gateway process.
pub struct WorkspaceClient {
    server_url: String,
    token: String,
    state: Arc<RwLock<ClientState>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl WorkspaceClient {
    /// Create a client that will authenticate with `token`.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and authenticate.
    ///
    /// The bearer token travels in the handshake's Authorization
    /// header; a gateway that rejects the credential fails the
    /// connection attempt here.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ClientState::Connecting;

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let header: HeaderValue = format!("Bearer {}", self.token)
            .parse()
            .map_err(|_| ProtocolError::InvalidPayload("token is not a valid header value"))?;
        request.headers_mut().insert("Authorization", header);

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                log::debug!("connect to {} failed: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut writer, mut reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            // Channel closed (disconnect or client dropped): send the
            // close frame so the gateway runs its cleanup immediately
            // instead of waiting for TCP teardown.
            let _ = writer.close().await;
        });

        *self.state.write().await = ClientState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode incoming frames into client events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Event(event)) => {
                            let _ = event_tx.send(ClientEvent::Event(event)).await;
                        }
                        Ok(ServerFrame::Reply(reply)) => {
                            let _ = event_tx.send(ClientEvent::Reply(reply)).await;
                        }
                        Err(e) => {
                            log::warn!("undecodable frame from gateway: {e}");
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            *state.write().await = ClientState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join a workspace under a display name.
    pub async fn join_workspace(
        &self,
        workspace_id: WorkspaceId,
        user_name: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientRequest::JoinWorkspace {
            workspace_id,
            user_name: user_name.into(),
        })
        .await
    }

    /// Leave a workspace.
    pub async fn leave_workspace(&self, workspace_id: WorkspaceId) -> Result<(), ProtocolError> {
        self.send(ClientRequest::LeaveWorkspace { workspace_id }).await
    }

    /// Report a file mutation.
    pub async fn file_change(
        &self,
        workspace_id: WorkspaceId,
        file_name: impl Into<String>,
        change_type: ChangeType,
        content: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientRequest::FileChange {
            workspace_id,
            file_name: file_name.into(),
            change_type,
            content,
        })
        .await
    }

    /// Report a cursor move.
    pub async fn cursor_update(
        &self,
        workspace_id: WorkspaceId,
        file_name: impl Into<String>,
        line: u32,
        column: u32,
    ) -> Result<(), ProtocolError> {
        self.send(ClientRequest::CursorUpdate {
            workspace_id,
            file_name: file_name.into(),
            line,
            column,
        })
        .await
    }

    /// Liveness probe; the gateway answers with a pong.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientRequest::Ping).await
    }

    async fn send(&self, request: ClientRequest) -> Result<(), ProtocolError> {
        if *self.state.read().await != ClientState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let text = request.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(text)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. The gateway treats this like any other
    /// disconnect and cleans up presence for this session.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ClientState::Disconnected;
    }

    /// Current connection state.
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
