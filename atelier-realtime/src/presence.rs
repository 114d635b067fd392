//! Per-process presence bookkeeping.
//!
//! Maps a workspace to the set of locally-connected sessions that have
//! joined it. Membership is process-local: a session connected to a
//! different gateway process never appears here — cross-process
//! visibility comes from the broadcast events carried by the bridge,
//! not from shared registry state.
//!
//! The registry is owned by whoever constructs the gateway and handed
//! in as an `Arc`; it holds no locks across awaits and every operation
//! completes synchronously.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::protocol::{SessionId, WorkspaceId};

/// Workspace → locally-connected member sessions.
#[derive(Default)]
pub struct PresenceRegistry {
    workspaces: RwLock<HashMap<WorkspaceId, HashSet<SessionId>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `session` as a local member of `workspace`.
    ///
    /// Creates the workspace set on first join. Idempotent: returns
    /// `false` when the session was already a member.
    pub fn join(&self, workspace: WorkspaceId, session: SessionId) -> bool {
        self.workspaces
            .write()
            .entry(workspace)
            .or_default()
            .insert(session)
    }

    /// Remove `session` from `workspace` if present.
    ///
    /// Tolerates leave-without-join and double-leave; returns `false`
    /// in either case. An emptied set is dropped — `count` reports 0
    /// for absent and empty workspaces alike.
    pub fn leave(&self, workspace: WorkspaceId, session: SessionId) -> bool {
        let mut workspaces = self.workspaces.write();
        let Some(members) = workspaces.get_mut(&workspace) else {
            return false;
        };
        let removed = members.remove(&session);
        if members.is_empty() {
            workspaces.remove(&workspace);
        }
        removed
    }

    /// Disconnect sweep: remove `session` from every workspace set.
    ///
    /// Returns the workspaces it was actually a member of, so the
    /// gateway can emit one `user:left` per affected workspace.
    pub fn remove_everywhere(&self, session: SessionId) -> Vec<WorkspaceId> {
        let mut workspaces = self.workspaces.write();
        let mut affected = Vec::new();
        workspaces.retain(|workspace, members| {
            if members.remove(&session) {
                affected.push(*workspace);
            }
            !members.is_empty()
        });
        affected
    }

    /// Local member count for `workspace`.
    ///
    /// This is the participant count as seen by *this* process, not a
    /// fleet-wide figure.
    pub fn count(&self, workspace: WorkspaceId) -> usize {
        self.workspaces
            .read()
            .get(&workspace)
            .map_or(0, HashSet::len)
    }

    /// Whether `session` is a local member of `workspace`.
    pub fn contains(&self, workspace: WorkspaceId, session: SessionId) -> bool {
        self.workspaces
            .read()
            .get(&workspace)
            .is_some_and(|members| members.contains(&session))
    }

    /// Number of workspaces with at least one local member.
    pub fn workspace_count(&self) -> usize {
        self.workspaces.read().len()
    }
}
