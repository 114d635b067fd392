//! Per-connection session records.
//!
//! A session is the authenticated identity of one connection, separate
//! from the transport that carries it: the gateway owns the session
//! record for the connection's lifetime, while writes go through a
//! plain channel handle. Keeping the two apart means no handler ever
//! pokes arbitrary state onto a socket object.

use uuid::Uuid;

use crate::auth::Principal;
use crate::protocol::{SessionId, WorkspaceId};

/// Protocol state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Authenticated, not a member of any workspace.
    Connected,
    /// Member of at least one workspace.
    JoinedWorkspace,
}

/// One authenticated client connection.
///
/// `workspace_id` tracks the most recently joined workspace; the
/// presence registry remains the authority on full membership (a
/// session that re-joins without leaving stays in both local sets).
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub principal: Principal,
    pub display_name: Option<String>,
    pub workspace_id: Option<WorkspaceId>,
}

impl Session {
    /// Create a session for a freshly authenticated connection.
    pub fn new(principal: Principal) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            principal,
            display_name: None,
            workspace_id: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.workspace_id.is_some() {
            SessionState::JoinedWorkspace
        } else {
            SessionState::Connected
        }
    }

    /// Record the name the client announced at join and the workspace
    /// it entered.
    pub fn joined(&mut self, workspace: WorkspaceId, display_name: impl Into<String>) {
        self.display_name = Some(display_name.into());
        self.workspace_id = Some(workspace);
    }

    /// Clear the current workspace if it is the one being left.
    pub fn left(&mut self, workspace: WorkspaceId) {
        if self.workspace_id == Some(workspace) {
            self.workspace_id = None;
        }
    }

    /// Name used in broadcast payloads: announced name first, then the
    /// token's name claim.
    pub fn broadcast_name(&self) -> Option<String> {
        self.display_name
            .clone()
            .or_else(|| self.principal.name.clone())
    }
}
