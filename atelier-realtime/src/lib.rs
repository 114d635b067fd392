//! # atelier-realtime — presence & event fan-out for shared workspaces
//!
//! Lets many clients edit inside a shared workspace while the serving
//! fleet runs as independent, horizontally-scaled gateway processes.
//! Each process keeps its own connection and room bookkeeping; a shared
//! pub/sub bus makes the fleet behave as one broadcast domain.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   WebSocket    ┌───────────────────────────────┐
//! │ Client   │ ◄────────────► │ Gateway (process A)           │
//! └──────────┘   JSON frames  │  ├── PresenceRegistry (local) │
//!                             │  ├── LocalBroadcaster (rooms) │
//!                             │  └── CrossProcessBridge       │
//!                             └──────────────┬────────────────┘
//!                                            │ publish / psubscribe
//!                                   ┌────────┴────────┐
//!                                   │  shared bus     │
//!                                   │  workspace:*    │
//!                                   └────────┬────────┘
//!                             ┌──────────────┴────────────────┐
//!                             │ Gateway (process B)           │
//!                             └───────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and the typed event envelope
//! - [`presence`] — per-process workspace membership registry
//! - [`broadcast`] — room-based local fan-out
//! - [`bridge`] — cross-process pub/sub bridge (Redis or in-process)
//! - [`auth`] — bearer-token verification at the handshake
//! - [`session`] — per-connection session records
//! - [`gateway`] — connection acceptor and message dispatcher
//! - [`client`] — WebSocket client for frontends and tests
//!
//! Presence is a volatile, per-process view synchronized by events:
//! there is no shared registry state, no durable replay, and no merge
//! of concurrent edits — change events are rebroadcast exactly as
//! submitted.

pub mod auth;
pub mod bridge;
pub mod broadcast;
pub mod client;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use auth::{AuthError, Claims, Principal, TokenVerifier};
pub use bridge::{
    channel_for, BridgeError, BridgeStats, BusEnvelope, BusTransport, CrossProcessBridge,
    InProcessBus, RedisBus, CHANNEL_PATTERN, CHANNEL_PREFIX,
};
pub use broadcast::{BroadcastStats, LocalBroadcaster, RoomFrame};
pub use client::{ClientEvent, ClientState, WorkspaceClient};
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayStats};
pub use presence::PresenceRegistry;
pub use protocol::{
    ChangeType, ClientRequest, CursorPosition, ProtocolError, ServerFrame, ServerMessage,
    SessionId, WorkspaceEvent, WorkspaceId,
};
pub use session::{Session, SessionState};
