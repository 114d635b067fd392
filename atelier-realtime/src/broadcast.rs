//! Same-process fan-out to workspace rooms.
//!
//! Each workspace with at least one subscribed connection owns a
//! `tokio::sync::broadcast` channel. An event is encoded once and the
//! `Arc`'d frame is cloned per receiver, so fan-out cost is O(peers)
//! pointer copies, not O(peers) serializations.
//!
//! Delivery is fire-and-forget: a receiver that lags past the channel
//! capacity skips frames, and a connection mid-teardown simply stops
//! draining its receiver. Neither case fails the broadcast for the
//! remaining recipients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, SessionId, WorkspaceEvent, WorkspaceId};

/// One pre-encoded event frame travelling through a room channel.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub workspace_id: WorkspaceId,
    /// Session that originated the event.
    pub origin: SessionId,
    /// When set, the origin's own connection must drop this frame.
    pub exclude_origin: bool,
    /// JSON text frame, encoded once per broadcast.
    pub payload: Arc<String>,
}

/// Fan-out counters, read via [`LocalBroadcaster::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_broadcast: u64,
    pub frames_delivered: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicStats {
    events_broadcast: AtomicU64,
    frames_delivered: AtomicU64,
}

/// Delivers events to every local connection subscribed to a room.
pub struct LocalBroadcaster {
    rooms: RwLock<HashMap<WorkspaceId, broadcast::Sender<RoomFrame>>>,
    capacity: usize,
    stats: AtomicStats,
}

impl LocalBroadcaster {
    /// `capacity` bounds how many frames a slow receiver may buffer
    /// before it starts skipping.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicStats::default(),
        }
    }

    /// Subscribe a connection to a workspace room, creating the room on
    /// first use.
    pub fn subscribe(&self, workspace: WorkspaceId) -> broadcast::Receiver<RoomFrame> {
        let mut rooms = self.rooms.write();
        rooms
            .entry(workspace)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop the room if no receiver is subscribed anymore.
    ///
    /// Called after a connection releases its receiver at leave or
    /// disconnect. Returns `true` if the room was reaped.
    pub fn remove_if_idle(&self, workspace: WorkspaceId) -> bool {
        let mut rooms = self.rooms.write();
        if let Some(sender) = rooms.get(&workspace) {
            if sender.receiver_count() == 0 {
                rooms.remove(&workspace);
                return true;
            }
        }
        false
    }

    /// Encode `event` once and fan it out to the workspace's room.
    ///
    /// Returns the number of receivers the frame reached. A workspace
    /// with no room (nobody subscribed locally) is a successful no-op.
    pub fn broadcast(
        &self,
        event: &WorkspaceEvent,
        exclude_origin: bool,
    ) -> Result<usize, ProtocolError> {
        let frame = RoomFrame {
            workspace_id: event.workspace_id(),
            origin: event.origin(),
            exclude_origin,
            payload: Arc::new(event.encode()?),
        };

        let sender = {
            let rooms = self.rooms.read();
            rooms.get(&frame.workspace_id).cloned()
        };
        let Some(sender) = sender else {
            return Ok(0);
        };

        // send() only errors when there are no receivers; that is not a
        // failure of the broadcast.
        let delivered = sender.send(frame).unwrap_or(0);
        self.stats.events_broadcast.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Number of rooms with at least one live channel.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Subscriber count for one room (0 if the room does not exist).
    pub fn receiver_count(&self, workspace: WorkspaceId) -> usize {
        self.rooms
            .read()
            .get(&workspace)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_broadcast: self.stats.events_broadcast.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            active_rooms: self.room_count(),
        }
    }
}

/// Whether a connection's forwarder should hand this frame to its
/// session. Kept as a free function so the forwarder task and tests
/// share one definition of the exclusion rule.
pub fn frame_is_for(frame: &RoomFrame, session: SessionId) -> bool {
    !(frame.exclude_origin && frame.origin == session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeType;
    use uuid::Uuid;

    fn file_event(origin: SessionId, ws: WorkspaceId) -> WorkspaceEvent {
        WorkspaceEvent::file_changed(
            origin,
            Some("alice".into()),
            ws,
            "a.txt",
            ChangeType::Update,
            Some("hi".into()),
        )
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let broadcaster = LocalBroadcaster::new(16);
        let ws = Uuid::new_v4();

        let mut rx1 = broadcaster.subscribe(ws);
        let mut rx2 = broadcaster.subscribe(ws);

        let event = file_event(Uuid::new_v4(), ws);
        let delivered = broadcaster.broadcast(&event, false).unwrap();
        assert_eq!(delivered, 2);

        let frame1 = rx1.recv().await.unwrap();
        let frame2 = rx2.recv().await.unwrap();
        assert_eq!(frame1.payload, frame2.payload);
        assert_eq!(frame1.workspace_id, ws);
    }

    #[tokio::test]
    async fn test_broadcast_without_room_is_noop() {
        let broadcaster = LocalBroadcaster::new(16);
        let event = file_event(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(broadcaster.broadcast(&event, true).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let broadcaster = LocalBroadcaster::new(16);
        let ws_a = Uuid::new_v4();
        let ws_b = Uuid::new_v4();

        let mut rx_a = broadcaster.subscribe(ws_a);
        let mut rx_b = broadcaster.subscribe(ws_b);

        broadcaster.broadcast(&file_event(Uuid::new_v4(), ws_a), false).unwrap();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
        drop(rx_a);
        drop(rx_b);
    }

    #[test]
    fn test_exclusion_rule() {
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();
        let frame = RoomFrame {
            workspace_id: Uuid::new_v4(),
            origin,
            exclude_origin: true,
            payload: Arc::new(String::new()),
        };

        assert!(!frame_is_for(&frame, origin));
        assert!(frame_is_for(&frame, other));

        let inclusive = RoomFrame {
            exclude_origin: false,
            payload: Arc::new(String::new()),
            ..frame
        };
        assert!(frame_is_for(&inclusive, origin));
    }

    #[test]
    fn test_room_reaping() {
        let broadcaster = LocalBroadcaster::new(16);
        let ws = Uuid::new_v4();

        let rx = broadcaster.subscribe(ws);
        assert_eq!(broadcaster.room_count(), 1);

        // Still subscribed — room must survive.
        assert!(!broadcaster.remove_if_idle(ws));

        drop(rx);
        assert!(broadcaster.remove_if_idle(ws));
        assert_eq!(broadcaster.room_count(), 0);
        assert_eq!(broadcaster.receiver_count(ws), 0);
    }

    #[test]
    fn test_stats_accumulate() {
        let broadcaster = LocalBroadcaster::new(16);
        let ws = Uuid::new_v4();
        let _rx1 = broadcaster.subscribe(ws);
        let _rx2 = broadcaster.subscribe(ws);

        broadcaster.broadcast(&file_event(Uuid::new_v4(), ws), false).unwrap();
        broadcaster.broadcast(&file_event(Uuid::new_v4(), ws), true).unwrap();

        let stats = broadcaster.stats();
        assert_eq!(stats.events_broadcast, 2);
        assert_eq!(stats.frames_delivered, 4);
        assert_eq!(stats.active_rooms, 1);
    }
}
