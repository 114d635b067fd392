//! Wire protocol for the realtime gateway.
//!
//! Client-facing frames are JSON text messages with an `{event, data}`
//! envelope:
//!
//! ```text
//! {"event": "file:change", "data": {"workspaceId": "…", "fileName": "a.txt",
//!  "changeType": "update", "content": "hi"}}
//! ```
//!
//! Inbound messages are [`ClientRequest`]; replies (acks, pong, errors)
//! are [`ServerMessage`]; room broadcasts are the closed set of
//! [`WorkspaceEvent`] variants. Every event carries the originating
//! session, the workspace it belongs to, and a UTC timestamp, so the
//! cross-process bridge can route it without per-event knowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one workspace broadcast domain.
pub type WorkspaceId = Uuid;
/// Identifies one authenticated client connection.
pub type SessionId = Uuid;

/// Kind of file mutation reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Cursor location inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// Messages a client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientRequest {
    #[serde(rename = "join:workspace", rename_all = "camelCase")]
    JoinWorkspace {
        workspace_id: WorkspaceId,
        user_name: String,
    },

    #[serde(rename = "leave:workspace", rename_all = "camelCase")]
    LeaveWorkspace { workspace_id: WorkspaceId },

    #[serde(rename = "file:change", rename_all = "camelCase")]
    FileChange {
        workspace_id: WorkspaceId,
        file_name: String,
        change_type: ChangeType,
        #[serde(default)]
        content: Option<String>,
    },

    #[serde(rename = "cursor:update", rename_all = "camelCase")]
    CursorUpdate {
        workspace_id: WorkspaceId,
        file_name: String,
        line: u32,
        column: u32,
    },

    #[serde(rename = "ping")]
    Ping,
}

impl ClientRequest {
    /// Shape checks beyond what deserialization already enforces.
    ///
    /// Rejected requests must not mutate any gateway state, so this is
    /// called before a handler runs.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientRequest::JoinWorkspace { user_name, .. } => {
                if user_name.trim().is_empty() {
                    return Err(ProtocolError::InvalidPayload("userName must not be empty"));
                }
            }
            ClientRequest::FileChange { file_name, .. }
            | ClientRequest::CursorUpdate { file_name, .. } => {
                if file_name.trim().is_empty() {
                    return Err(ProtocolError::InvalidPayload("fileName must not be empty"));
                }
            }
            ClientRequest::LeaveWorkspace { .. } | ClientRequest::Ping => {}
        }
        Ok(())
    }

    /// Decode a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Broadcast events fanned out to workspace rooms.
///
/// One variant per event name — the bridge discriminates on the tag
/// when it deserializes an incoming bus message, so no untyped payloads
/// cross a process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WorkspaceEvent {
    #[serde(rename = "user:joined", rename_all = "camelCase")]
    UserJoined {
        session_id: SessionId,
        user_name: String,
        workspace_id: WorkspaceId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "user:left", rename_all = "camelCase")]
    UserLeft {
        session_id: SessionId,
        user_name: Option<String>,
        workspace_id: WorkspaceId,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "file:changed", rename_all = "camelCase")]
    FileChanged {
        session_id: SessionId,
        user_name: Option<String>,
        workspace_id: WorkspaceId,
        file_name: String,
        change_type: ChangeType,
        content: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "cursor:updated", rename_all = "camelCase")]
    CursorUpdated {
        session_id: SessionId,
        user_name: Option<String>,
        workspace_id: WorkspaceId,
        file_name: String,
        position: CursorPosition,
        timestamp: DateTime<Utc>,
    },
}

impl WorkspaceEvent {
    pub fn user_joined(
        session_id: SessionId,
        user_name: impl Into<String>,
        workspace_id: WorkspaceId,
    ) -> Self {
        Self::UserJoined {
            session_id,
            user_name: user_name.into(),
            workspace_id,
            timestamp: Utc::now(),
        }
    }

    pub fn user_left(
        session_id: SessionId,
        user_name: Option<String>,
        workspace_id: WorkspaceId,
    ) -> Self {
        Self::UserLeft {
            session_id,
            user_name,
            workspace_id,
            timestamp: Utc::now(),
        }
    }

    pub fn file_changed(
        session_id: SessionId,
        user_name: Option<String>,
        workspace_id: WorkspaceId,
        file_name: impl Into<String>,
        change_type: ChangeType,
        content: Option<String>,
    ) -> Self {
        Self::FileChanged {
            session_id,
            user_name,
            workspace_id,
            file_name: file_name.into(),
            change_type,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn cursor_updated(
        session_id: SessionId,
        user_name: Option<String>,
        workspace_id: WorkspaceId,
        file_name: impl Into<String>,
        position: CursorPosition,
    ) -> Self {
        Self::CursorUpdated {
            session_id,
            user_name,
            workspace_id,
            file_name: file_name.into(),
            position,
            timestamp: Utc::now(),
        }
    }

    /// The workspace this event is scoped to.
    pub fn workspace_id(&self) -> WorkspaceId {
        match self {
            Self::UserJoined { workspace_id, .. }
            | Self::UserLeft { workspace_id, .. }
            | Self::FileChanged { workspace_id, .. }
            | Self::CursorUpdated { workspace_id, .. } => *workspace_id,
        }
    }

    /// The session that originated this event.
    pub fn origin(&self) -> SessionId {
        match self {
            Self::UserJoined { session_id, .. }
            | Self::UserLeft { session_id, .. }
            | Self::FileChanged { session_id, .. }
            | Self::CursorUpdated { session_id, .. } => *session_id,
        }
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user:joined",
            Self::UserLeft { .. } => "user:left",
            Self::FileChanged { .. } => "file:changed",
            Self::CursorUpdated { .. } => "cursor:updated",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Direct replies from the gateway to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "ack", rename_all = "camelCase")]
    Ack {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_users: Option<usize>,
    },

    #[serde(rename = "pong", rename_all = "camelCase")]
    Pong { timestamp: DateTime<Utc> },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error { message: String },
}

impl ServerMessage {
    pub fn ack(message: impl Into<String>) -> Self {
        Self::Ack {
            success: true,
            message: Some(message.into()),
            active_users: None,
        }
    }

    pub fn ack_with_count(message: impl Into<String>, active_users: usize) -> Self {
        Self::Ack {
            success: true,
            message: Some(message.into()),
            active_users: Some(active_users),
        }
    }

    pub fn nack(message: impl Into<String>) -> Self {
        Self::Ack {
            success: false,
            message: Some(message.into()),
            active_users: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Any frame the gateway can send to a client.
///
/// Event names are disjoint between the two inner enums, so untagged
/// deserialization is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Event(WorkspaceEvent),
    Reply(ServerMessage),
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidPayload(&'static str),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidPayload(reason) => write!(f, "invalid payload: {reason}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_request_wire_shape() {
        let ws = Uuid::new_v4();
        let req = ClientRequest::JoinWorkspace {
            workspace_id: ws,
            user_name: "alice".into(),
        };
        let json = req.encode().unwrap();
        assert!(json.contains(r#""event":"join:workspace""#));
        assert!(json.contains(r#""workspaceId""#));
        assert!(json.contains(r#""userName":"alice""#));

        let decoded = ClientRequest::decode(&json).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_file_change_roundtrip() {
        let req = ClientRequest::FileChange {
            workspace_id: Uuid::new_v4(),
            file_name: "src/main.rs".into(),
            change_type: ChangeType::Update,
            content: Some("fn main() {}".into()),
        };
        let decoded = ClientRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_change_type_lowercase_on_wire() {
        let req = ClientRequest::FileChange {
            workspace_id: Uuid::new_v4(),
            file_name: "a.txt".into(),
            change_type: ChangeType::Delete,
            content: None,
        };
        assert!(req.encode().unwrap().contains(r#""changeType":"delete""#));
    }

    #[test]
    fn test_file_change_content_optional() {
        let ws = Uuid::new_v4();
        let json = format!(
            r#"{{"event":"file:change","data":{{"workspaceId":"{ws}","fileName":"a.txt","changeType":"create"}}}}"#
        );
        let decoded = ClientRequest::decode(&json).unwrap();
        match decoded {
            ClientRequest::FileChange { content, .. } => assert!(content.is_none()),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_ping_has_no_data() {
        let json = r#"{"event":"ping"}"#;
        assert_eq!(ClientRequest::decode(json).unwrap(), ClientRequest::Ping);
        assert_eq!(ClientRequest::Ping.encode().unwrap(), r#"{"event":"ping"}"#);
    }

    #[test]
    fn test_malformed_workspace_id_rejected() {
        let json = r#"{"event":"leave:workspace","data":{"workspaceId":"not-a-uuid"}}"#;
        assert!(ClientRequest::decode(json).is_err());
    }

    #[test]
    fn test_unknown_event_rejected() {
        let json = r#"{"event":"shell:exec","data":{"cmd":"rm -rf /"}}"#;
        assert!(ClientRequest::decode(json).is_err());
    }

    #[test]
    fn test_validate_empty_user_name() {
        let req = ClientRequest::JoinWorkspace {
            workspace_id: Uuid::new_v4(),
            user_name: "  ".into(),
        };
        assert!(matches!(
            req.validate(),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_validate_empty_file_name() {
        let req = ClientRequest::CursorUpdate {
            workspace_id: Uuid::new_v4(),
            file_name: String::new(),
            line: 1,
            column: 1,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_event_wire_names() {
        let ws = Uuid::new_v4();
        let sid = Uuid::new_v4();

        let joined = WorkspaceEvent::user_joined(sid, "alice", ws);
        assert!(joined.encode().unwrap().contains(r#""event":"user:joined""#));
        assert_eq!(joined.name(), "user:joined");

        let left = WorkspaceEvent::user_left(sid, Some("alice".into()), ws);
        assert!(left.encode().unwrap().contains(r#""event":"user:left""#));

        let changed = WorkspaceEvent::file_changed(
            sid,
            Some("alice".into()),
            ws,
            "a.txt",
            ChangeType::Create,
            None,
        );
        assert!(changed
            .encode()
            .unwrap()
            .contains(r#""event":"file:changed""#));

        let cursor = WorkspaceEvent::cursor_updated(
            sid,
            Some("alice".into()),
            ws,
            "a.txt",
            CursorPosition { line: 3, column: 7 },
        );
        let json = cursor.encode().unwrap();
        assert!(json.contains(r#""event":"cursor:updated""#));
        assert!(json.contains(r#""position":{"line":3,"column":7}"#));
    }

    #[test]
    fn test_event_accessors() {
        let ws = Uuid::new_v4();
        let sid = Uuid::new_v4();
        let event = WorkspaceEvent::file_changed(
            sid,
            None,
            ws,
            "a.txt",
            ChangeType::Update,
            Some("hi".into()),
        );
        assert_eq!(event.workspace_id(), ws);
        assert_eq!(event.origin(), sid);
    }

    #[test]
    fn test_absent_content_serializes_as_null() {
        let event = WorkspaceEvent::file_changed(
            Uuid::new_v4(),
            Some("bob".into()),
            Uuid::new_v4(),
            "a.txt",
            ChangeType::Delete,
            None,
        );
        assert!(event.encode().unwrap().contains(r#""content":null"#));
    }

    #[test]
    fn test_event_roundtrip() {
        let event = WorkspaceEvent::user_joined(Uuid::new_v4(), "carol", Uuid::new_v4());
        let decoded = WorkspaceEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_ack_skips_absent_fields() {
        let ack = ServerMessage::Ack {
            success: true,
            message: None,
            active_users: None,
        };
        assert_eq!(ack.encode().unwrap(), r#"{"event":"ack","data":{"success":true}}"#);

        let full = ServerMessage::ack_with_count("Joined workspace successfully", 2);
        let json = full.encode().unwrap();
        assert!(json.contains(r#""activeUsers":2"#));
        assert!(json.contains(r#""message":"Joined workspace successfully""#));
    }

    #[test]
    fn test_server_frame_disambiguates() {
        let ack = ServerMessage::ack("ok").encode().unwrap();
        match ServerFrame::decode(&ack).unwrap() {
            ServerFrame::Reply(ServerMessage::Ack { success, .. }) => assert!(success),
            other => panic!("expected ack, got {other:?}"),
        }

        let event = WorkspaceEvent::user_joined(Uuid::new_v4(), "dave", Uuid::new_v4())
            .encode()
            .unwrap();
        match ServerFrame::decode(&event).unwrap() {
            ServerFrame::Event(WorkspaceEvent::UserJoined { user_name, .. }) => {
                assert_eq!(user_name, "dave");
            }
            other => panic!("expected user:joined, got {other:?}"),
        }
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let event = WorkspaceEvent::user_joined(Uuid::new_v4(), "erin", Uuid::new_v4());
        let value: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        let ts = value["data"]["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
