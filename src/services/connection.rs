//! Connection lifecycle — admission, room handshake, heartbeat, teardown.
//!
//! DESIGN
//! ======
//! Every connection walks `Connecting -> Active -> Draining -> Closed`.
//! `accept` covers `Connecting`: it validates the handshake identity,
//! registers the outbound queue, marks the user online and performs the
//! configured auto-joins. `close` always passes through `Draining`, even for
//! an abrupt socket loss, so the rooms the connection held are told
//! `user_left` before its resources are released.
//!
//! Presence is reference counted here, not in the tracker: a user's record
//! is cleared only when the registry reports no remaining connections.
//!
//! ERROR HANDLING
//! ==============
//! `AuthError` rejects a handshake before anything is registered. Once
//! admitted, nothing in this module can fail a connection except the close
//! reasons in `CloseReason`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::message::{CollaborationMessage, Data, ErrorCode, MessageType};
use crate::services::presence::{DEFAULT_ACTIVITY, PresenceRecord, PresenceStatus};
use crate::services::registry::{
    ConnectionHandle, ConnectionId, Departure, JoinOutcome, LeaveOutcome, Member, RegistryError,
};
use crate::state::AppState;

// =============================================================================
// CLOSE REASONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ConnectionLost,
    HeartbeatTimeout,
    SlowConsumer,
    ServerShutdown,
}

impl CloseReason {
    /// Websocket close code. `ConnectionLost` is never sent on the wire.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::ConnectionLost => 1006,
            Self::HeartbeatTimeout => 4000,
            Self::SlowConsumer => 4001,
            Self::ServerShutdown => 1001,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ConnectionLost => "connection_lost",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::ServerShutdown => "server_shutdown",
        }
    }

    /// Closes initiated by the hub rather than the client or network.
    #[must_use]
    pub fn is_forced(self) -> bool {
        matches!(self, Self::HeartbeatTimeout | Self::SlowConsumer | Self::ServerShutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ClientClosed => "closed by client",
            Self::ConnectionLost => "connection lost",
            Self::HeartbeatTimeout => "no activity within heartbeat timeout",
            Self::SlowConsumer => "outbound queue full",
            Self::ServerShutdown => "server shutting down",
        };
        f.write_str(text)
    }
}

impl ErrorCode for CloseReason {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ClientClosed => "E_CLIENT_CLOSED",
            Self::ConnectionLost => "E_CONNECTION_LOST",
            Self::HeartbeatTimeout => "E_HEARTBEAT_TIMEOUT",
            Self::SlowConsumer => "E_SLOW_CONSUMER",
            Self::ServerShutdown => "E_SERVER_SHUTDOWN",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::ClientClosed)
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting | Self::Active, Self::Draining)
                | (Self::Connecting, Self::Active)
                | (Self::Draining, Self::Closed)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid connection transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

// =============================================================================
// HANDSHAKE
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing user id")]
    MissingUserId,
    #[error("user id longer than {max} characters")]
    UserIdTooLong { max: usize },
    #[error("user id contains control characters")]
    InvalidUserId,
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingUserId => "E_MISSING_USER_ID",
            Self::UserIdTooLong { .. } => "E_USER_ID_TOO_LONG",
            Self::InvalidUserId => "E_INVALID_USER_ID",
        }
    }
}

/// Pre-validated identity supplied by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    /// Normalize handshake parts. A blank display name falls back to the user id.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` for a missing, oversized, or control-character user id.
    pub fn from_parts(user_id: Option<&str>, username: Option<&str>, max_len: usize) -> Result<Self, AuthError> {
        let user_id = user_id.map(str::trim).unwrap_or_default();
        if user_id.is_empty() {
            return Err(AuthError::MissingUserId);
        }
        if user_id.chars().count() > max_len {
            return Err(AuthError::UserIdTooLong { max: max_len });
        }
        if user_id.chars().any(char::is_control) {
            return Err(AuthError::InvalidUserId);
        }
        let username = username
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(user_id);
        Ok(Self { user_id: user_id.to_owned(), username: username.to_owned() })
    }
}

// =============================================================================
// TIMING
// =============================================================================

/// Clamps outbound timestamps so they never decrease on one connection.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, timestamp: i64) -> i64 {
        self.last = self.last.max(timestamp);
        self.last
    }
}

/// Tracks the last sign of life from the client.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    last_activity: Instant,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, last_activity: Instant::now() }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.timeout
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

#[derive(Debug)]
pub struct Connection {
    pub handle: Arc<ConnectionHandle>,
    state: ConnectionState,
    heartbeat: HeartbeatMonitor,
}

impl Connection {
    #[must_use]
    pub fn new(handle: Arc<ConnectionHandle>, heartbeat_timeout: Duration) -> Self {
        Self { handle, state: ConnectionState::Connecting, heartbeat: HeartbeatMonitor::new(heartbeat_timeout) }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// # Errors
    ///
    /// `TransitionError` for any move the lifecycle does not allow.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }

    /// Heartbeat: any inbound frame counts as activity.
    pub fn touch(&mut self) {
        self.heartbeat.touch();
    }

    #[must_use]
    pub fn heartbeat_deadline(&self) -> Instant {
        self.heartbeat.deadline()
    }

    #[must_use]
    pub fn is_heartbeat_expired(&self, now: Instant) -> bool {
        self.heartbeat.is_expired(now)
    }
}

/// Everything the socket task needs after a successful `accept`.
pub struct Admission {
    pub connection: Connection,
    /// Sender-side handle for replies to this connection itself.
    pub member: Member,
    pub outbound_rx: mpsc::Receiver<CollaborationMessage>,
    pub close_rx: mpsc::Receiver<CloseReason>,
    pub presence: PresenceRecord,
}

// =============================================================================
// ACCEPT / CLOSE
// =============================================================================

/// Admit a connection: register it, mark the user online, auto-join rooms.
///
/// # Errors
///
/// `AuthError` when the handshake identity is unusable. Nothing is
/// registered in that case.
pub async fn accept(state: &AppState, user_id: Option<&str>, username: Option<&str>) -> Result<Admission, AuthError> {
    let identity = Identity::from_parts(user_id, username, state.config.max_user_id_len)?;

    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_queue_capacity);
    let (close_tx, close_rx) = mpsc::channel(1);
    let member = Member::new(
        ConnectionHandle { id: ConnectionId::new(), user_id: identity.user_id, username: identity.username },
        outbound_tx,
        close_tx,
    );
    let handle = Arc::clone(&member.handle);
    let mut connection = Connection::new(Arc::clone(&handle), state.config.heartbeat_timeout);

    let welcome = CollaborationMessage::new(MessageType::Notification, Data::new())
        .with_data("event", "connected")
        .with_data("connection_id", handle.id.to_string())
        .with_data("heartbeat_interval_ms", duration_ms(state.config.heartbeat_interval))
        .with_data("heartbeat_timeout_ms", duration_ms(state.config.heartbeat_timeout));
    send_to_self(&member, welcome);

    // Registration and the presence decision happen under the user's hold,
    // so a concurrent close of the same user sees a consistent count.
    let mut user_presence = state.presence.lock_user(&handle.user_id).await;
    let user_connections = state.registry.register(member.clone());
    let presence = user_presence
        .record()
        .filter(|_| user_connections > 1)
        .cloned()
        .unwrap_or_else(|| user_presence.set(&handle.username, PresenceStatus::Online, Some(DEFAULT_ACTIVITY)));
    drop(user_presence);

    for room in &state.config.auto_join_rooms {
        match join_room(state, &handle, room).await {
            Ok(reply) => send_to_self(&member, reply),
            Err(e) => warn!(%room, connection_id = %handle.id, error = %e, "conn: auto-join failed"),
        }
    }

    let rooms = state.registry.rooms_of(handle.id).await;
    state
        .registry
        .broadcast_rooms(rooms.iter(), &presence_message(&presence), Some(handle.id))
        .await;

    if let Err(e) = connection.transition(ConnectionState::Active) {
        warn!(connection_id = %handle.id, error = %e, "conn: activation skipped");
    }
    info!(
        connection_id = %handle.id,
        user_id = %handle.user_id,
        user_connections,
        rooms = rooms.len(),
        "conn: admitted"
    );

    Ok(Admission { connection, member, outbound_rx, close_rx, presence })
}

/// Tear a connection down through `Draining`. Safe to call more than once.
pub async fn close(state: &AppState, connection: &mut Connection, reason: CloseReason) -> Option<Departure> {
    match connection.state() {
        ConnectionState::Closed => return None,
        ConnectionState::Draining => {}
        ConnectionState::Connecting | ConnectionState::Active => {
            let _ = connection.transition(ConnectionState::Draining);
        }
    }

    let id = connection.id();
    let mut user_presence = state.presence.lock_user(&connection.handle.user_id).await;
    let departure = state.registry.unregister(id).await;
    let last_connection = departure
        .as_ref()
        .is_some_and(|d| d.remaining_user_connections == 0);
    if last_connection {
        user_presence.clear();
    }
    drop(user_presence);

    if let Some(departure) = &departure {
        state.router.forget_all(id, &departure.rooms).await;

        let user_id = &departure.handle.user_id;

        for room in &departure.rooms {
            let msg = user_left_message(&departure.handle, reason.as_str(), last_connection);
            state.relay.emit(room, msg, None).await;
        }

        if reason.is_forced() {
            warn!(connection_id = %id, user_id = %user_id, reason = reason.as_str(), "conn: forced close");
        }
        info!(
            connection_id = %id,
            user_id = %user_id,
            reason = reason.as_str(),
            rooms = departure.rooms.len(),
            last_connection,
            "conn: closed"
        );
    }

    let _ = connection.transition(ConnectionState::Closed);
    departure
}

/// Ask every live connection to drain. Returns how many were asked.
pub fn close_all(state: &AppState, reason: CloseReason) -> usize {
    let members = state.registry.all_members();
    for member in &members {
        member.request_close(reason);
    }
    info!(connections = members.len(), reason = reason.as_str(), "conn: closing all");
    members.len()
}

// =============================================================================
// ROOM HANDSHAKE
// =============================================================================

/// Join `room`, announce the newcomer, and build the `room_joined` reply.
/// Re-joining answers again without a second `user_joined`.
///
/// # Errors
///
/// `UnknownConnection` if the connection was already unregistered.
pub async fn join_room(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    room: &str,
) -> Result<CollaborationMessage, RegistryError> {
    let outcome = state.registry.join(handle.id, room).await?;
    if outcome == JoinOutcome::Joined {
        let presence = state.presence.get(&handle.user_id).await;
        let msg = CollaborationMessage::new(MessageType::UserJoined, Data::new())
            .with_sender(handle.user_id.as_str(), handle.username.as_str())
            .with_data("user_id", handle.user_id.as_str())
            .with_data("username", handle.username.as_str())
            .with_data("connection_id", handle.id.to_string())
            .with_data("presence", serde_json::to_value(presence).unwrap_or_default());
        state.relay.emit(room, msg, Some(handle.id)).await;
    }

    let members = room_members(state, room).await;
    let cursors = serde_json::to_value(state.router.cursors_in(room)).unwrap_or_default();
    let seq = state.relay.current_seq(room).await;
    Ok(CollaborationMessage::new(MessageType::RoomJoined, Data::new())
        .with_room(room)
        .with_data("room_id", room)
        .with_data("status", "joined")
        .with_data("members", members)
        .with_data("cursors", cursors)
        .with_data("seq", seq))
}

/// Leave `room`, clear this connection's signals there, and build the
/// `room_left` reply. Leaving a room not joined still answers.
pub async fn leave_room(state: &AppState, handle: &Arc<ConnectionHandle>, room: &str) -> CollaborationMessage {
    if let LeaveOutcome::Left { room_deleted } = state.registry.leave(handle.id, room).await {
        state.router.forget(handle.id, room).await;
        if room_deleted {
            state.relay.prune(room);
        } else {
            let msg = user_left_message(handle, "left_room", false);
            state.relay.emit(room, msg, None).await;
        }
    }
    CollaborationMessage::new(MessageType::RoomLeft, Data::new())
        .with_room(room)
        .with_data("room_id", room)
        .with_data("status", "left")
}

// =============================================================================
// MESSAGES
// =============================================================================

/// `user_presence` broadcast for a stored record.
#[must_use]
pub fn presence_message(record: &PresenceRecord) -> CollaborationMessage {
    CollaborationMessage::new(MessageType::UserPresence, Data::new())
        .with_sender(record.user_id.as_str(), record.username.as_str())
        .with_data("user_id", record.user_id.as_str())
        .with_data("username", record.username.as_str())
        .with_data("status", serde_json::to_value(record.status).unwrap_or_default())
        .with_data("activity", record.activity.as_str())
        .with_data("last_seen", record.last_seen)
}

fn user_left_message(handle: &ConnectionHandle, reason: &str, last_connection: bool) -> CollaborationMessage {
    CollaborationMessage::new(MessageType::UserLeft, Data::new())
        .with_sender(handle.user_id.as_str(), handle.username.as_str())
        .with_data("user_id", handle.user_id.as_str())
        .with_data("username", handle.username.as_str())
        .with_data("connection_id", handle.id.to_string())
        .with_data("reason", reason)
        .with_data("last_connection", last_connection)
}

async fn room_members(state: &AppState, room: &str) -> serde_json::Value {
    let users = state.registry.users_in(room).await;
    let user_ids: Vec<&str> = users.iter().map(|(user_id, _)| user_id.as_str()).collect();
    let records = state.presence.get_many(user_ids).await;
    users
        .iter()
        .map(|(user_id, username)| match records.iter().find(|r| &r.user_id == user_id) {
            Some(record) => serde_json::to_value(record).unwrap_or_default(),
            None => serde_json::json!({ "user_id": user_id, "username": username }),
        })
        .collect()
}

fn send_to_self(member: &Member, msg: CollaborationMessage) {
    if let Err(e) = member.deliver(msg) {
        warn!(connection_id = %member.id(), error = %e, "conn: reply dropped");
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
