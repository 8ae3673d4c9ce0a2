//! Session registry — live connections and room membership.
//!
//! DESIGN
//! ======
//! The registry is the single writer of membership. Three small index maps
//! find the shards:
//! - `connections`: connection id -> outbound handle + joined rooms
//! - `rooms`: room id -> member set
//! - `users`: user id -> that user's live connection ids
//!
//! Index locks are plain mutexes held only for a lookup or insert. Each
//! connection's room set and each room's member set has its own async
//! mutex, so work in one room never waits on another. Join, leave and
//! unregister hold the connection shard and then the room shard while they
//! edit both sides, which keeps the two directions in agreement.
//!
//! Fan-out copies the member list, releases the room lock, then enqueues
//! with `try_send`, so a full queue can never stall a broadcaster.
//!
//! ERROR HANDLING
//! ==============
//! A full outbound queue is a `DeliveryError` for that member alone: the
//! member is asked to close as a slow consumer and fan-out moves on.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{CollaborationMessage, ErrorCode};
use crate::services::connection::CloseReason;

pub type RoomId = String;

// =============================================================================
// TYPES
// =============================================================================

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one admitted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: String,
    pub username: String,
}

/// Outbound side of a connection as seen by broadcasters.
#[derive(Debug, Clone)]
pub struct Member {
    pub handle: Arc<ConnectionHandle>,
    outbound: mpsc::Sender<CollaborationMessage>,
    close: mpsc::Sender<CloseReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
}

impl ErrorCode for DeliveryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::QueueFull => "E_QUEUE_FULL",
            Self::Closed => "E_CONNECTION_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}

impl Member {
    #[must_use]
    pub fn new(
        handle: ConnectionHandle,
        outbound: mpsc::Sender<CollaborationMessage>,
        close: mpsc::Sender<CloseReason>,
    ) -> Self {
        Self { handle: Arc::new(handle), outbound, close }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Non-blocking enqueue. A full queue requests a slow-consumer close.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the member is not draining its queue, `Closed` when
    /// the connection task is already gone.
    pub fn deliver(&self, msg: CollaborationMessage) -> Result<(), DeliveryError> {
        match self.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.request_close(CloseReason::SlowConsumer);
                Err(DeliveryError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Ask the connection task to drain. The first request wins.
    pub fn request_close(&self, reason: CloseReason) {
        let _ = self.close.try_send(reason);
    }
}

/// Result of one fan-out pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: Vec<(ConnectionId, DeliveryError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left { room_deleted: bool },
    NotMember,
}

/// What remained after a connection was removed.
#[derive(Debug, Clone)]
pub struct Departure {
    pub handle: Arc<ConnectionHandle>,
    pub rooms: BTreeSet<RoomId>,
    /// Other live connections still held by the same user.
    pub remaining_user_connections: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
struct JoinedRooms {
    rooms: BTreeSet<RoomId>,
    /// Set by `unregister`; later joins fail as unknown.
    closed: bool,
}

/// One connection's side of the membership relation.
struct ConnectionSlot {
    member: Member,
    joined: tokio::sync::Mutex<JoinedRooms>,
}

/// One room's side of the membership relation.
#[derive(Default)]
struct RoomSlot {
    members: HashMap<ConnectionId, Member>,
    /// Emptied and unlinked from the index; a joiner that raced the
    /// removal must look the room up again.
    retired: bool,
}

type Room = Arc<tokio::sync::Mutex<RoomSlot>>;

#[derive(Default)]
struct Shards {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionSlot>>>,
    rooms: Mutex<HashMap<RoomId, Room>>,
    users: Mutex<HashMap<String, HashSet<ConnectionId>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    shards: Arc<Shards>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionSlot>> {
        lock(&self.shards.connections).get(&id).cloned()
    }

    fn room(&self, room: &str) -> Option<Room> {
        lock(&self.shards.rooms).get(room).cloned()
    }

    fn room_or_create(&self, room: &str) -> Room {
        Arc::clone(lock(&self.shards.rooms).entry(room.to_owned()).or_default())
    }

    /// Register an admitted connection. Returns the user's live connection count.
    pub fn register(&self, member: Member) -> usize {
        let id = member.id();
        let user_id = member.handle.user_id.clone();
        lock(&self.shards.connections).insert(
            id,
            Arc::new(ConnectionSlot { member, joined: tokio::sync::Mutex::default() }),
        );
        let mut users = lock(&self.shards.users);
        let user_conns = users.entry(user_id).or_default();
        user_conns.insert(id);
        user_conns.len()
    }

    /// Remove a connection from every room and from the user index.
    /// Empty rooms are deleted. Returns `None` if already removed.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Departure> {
        let slot = lock(&self.shards.connections).remove(&id)?;

        let mut joined = slot.joined.lock().await;
        joined.closed = true;
        for room in &joined.rooms {
            if self.detach(id, room).await {
                debug!(%room, "registry: room deleted");
            }
        }
        let rooms = std::mem::take(&mut joined.rooms);
        drop(joined);

        let user_id = &slot.member.handle.user_id;
        let remaining = {
            let mut users = lock(&self.shards.users);
            let remaining = users.get_mut(user_id).map_or(0, |conns| {
                conns.remove(&id);
                conns.len()
            });
            if remaining == 0 {
                users.remove(user_id);
            }
            remaining
        };

        Some(Departure { handle: Arc::clone(&slot.member.handle), rooms, remaining_user_connections: remaining })
    }

    /// Idempotent join; creates the room on first member.
    ///
    /// Lock order is connection then room, here and in every other path
    /// that touches both sides.
    ///
    /// # Errors
    ///
    /// `UnknownConnection` if the connection is not registered.
    pub async fn join(&self, id: ConnectionId, room: &str) -> Result<JoinOutcome, RegistryError> {
        let Some(conn) = self.connection(id) else {
            return Err(RegistryError::UnknownConnection(id));
        };
        let mut joined = conn.joined.lock().await;
        if joined.closed {
            return Err(RegistryError::UnknownConnection(id));
        }
        if joined.rooms.contains(room) {
            return Ok(JoinOutcome::AlreadyMember);
        }
        loop {
            let shard = self.room_or_create(room);
            let mut slot = shard.lock().await;
            if slot.retired {
                continue;
            }
            slot.members.insert(id, conn.member.clone());
            joined.rooms.insert(room.to_owned());
            info!(%room, connection_id = %id, members = slot.members.len(), "registry: joined room");
            return Ok(JoinOutcome::Joined);
        }
    }

    /// Idempotent leave; deletes the room when its last member leaves.
    pub async fn leave(&self, id: ConnectionId, room: &str) -> LeaveOutcome {
        let Some(conn) = self.connection(id) else {
            return LeaveOutcome::NotMember;
        };
        let mut joined = conn.joined.lock().await;
        if !joined.rooms.remove(room) {
            return LeaveOutcome::NotMember;
        }
        let room_deleted = self.detach(id, room).await;
        drop(joined);
        info!(%room, connection_id = %id, room_deleted, "registry: left room");
        LeaveOutcome::Left { room_deleted }
    }

    /// Drop `id` from the room side. Returns true if the room was deleted.
    /// Caller holds the connection's `joined` lock.
    async fn detach(&self, id: ConnectionId, room: &str) -> bool {
        let Some(shard) = self.room(room) else {
            return false;
        };
        let mut slot = shard.lock().await;
        slot.members.remove(&id);
        if !slot.members.is_empty() || slot.retired {
            return false;
        }
        slot.retired = true;
        let mut rooms = lock(&self.shards.rooms);
        if rooms
            .get(room)
            .is_some_and(|current| Arc::ptr_eq(current, &shard))
        {
            rooms.remove(room);
        }
        true
    }

    /// Snapshot of a room's members at call time.
    pub async fn members_of(&self, room: &str) -> Vec<Member> {
        let Some(shard) = self.room(room) else {
            return Vec::new();
        };
        let slot = shard.lock().await;
        slot.members.values().cloned().collect()
    }

    /// Rooms a connection has joined. Empty for unknown connections.
    pub async fn rooms_of(&self, id: ConnectionId) -> BTreeSet<RoomId> {
        let Some(conn) = self.connection(id) else {
            return BTreeSet::new();
        };
        let joined = conn.joined.lock().await;
        joined.rooms.clone()
    }

    pub async fn is_member(&self, id: ConnectionId, room: &str) -> bool {
        let Some(shard) = self.room(room) else {
            return false;
        };
        let slot = shard.lock().await;
        slot.members.contains_key(&id)
    }

    #[cfg(test)]
    pub fn member(&self, id: ConnectionId) -> Option<Member> {
        self.connection(id).map(|slot| slot.member.clone())
    }

    #[cfg(test)]
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        lock(&self.shards.users).get(user_id).map_or(0, HashSet::len)
    }

    /// Distinct users among a room's members, in stable order.
    pub async fn users_in(&self, room: &str) -> Vec<(String, String)> {
        let mut users: Vec<(String, String)> = self
            .members_of(room)
            .await
            .into_iter()
            .map(|m| (m.handle.user_id.clone(), m.handle.username.clone()))
            .collect();
        users.sort();
        users.dedup_by(|a, b| a.0 == b.0);
        users
    }

    #[must_use]
    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            connections: lock(&self.shards.connections).len(),
            rooms: lock(&self.shards.rooms).len(),
            users: lock(&self.shards.users).len(),
        }
    }

    /// Every live member. Used for shutdown.
    #[must_use]
    pub fn all_members(&self) -> Vec<Member> {
        lock(&self.shards.connections)
            .values()
            .map(|slot| slot.member.clone())
            .collect()
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Enqueue `msg` for every member of `room`, optionally excluding one.
    pub async fn broadcast(&self, room: &str, msg: &CollaborationMessage, exclude: Option<ConnectionId>) -> FanOut {
        let members = self.members_of(room).await;
        deliver_all(members.iter().filter(|m| Some(m.id()) != exclude), msg)
    }

    /// Enqueue `msg` once per distinct member across several rooms.
    pub async fn broadcast_rooms<'a, I>(&self, rooms: I, msg: &CollaborationMessage, exclude: Option<ConnectionId>) -> FanOut
    where
        I: IntoIterator<Item = &'a RoomId>,
    {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for room in rooms {
            for member in self.members_of(room).await {
                if Some(member.id()) != exclude && seen.insert(member.id()) {
                    targets.push(member);
                }
            }
        }
        deliver_all(targets.iter(), msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub connections: usize,
    pub rooms: usize,
    pub users: usize,
}

fn deliver_all<'a>(members: impl Iterator<Item = &'a Member>, msg: &CollaborationMessage) -> FanOut {
    let mut report = FanOut::default();
    for member in members {
        match member.deliver(msg.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(connection_id = %member.id(), user_id = %member.handle.user_id, error = %e, kind = %msg.kind, "registry: delivery failed");
                report.failed.push((member.id(), e));
            }
        }
    }
    report
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
