//! Ephemeral broadcast router — typing indicators and cursor positions.
//!
//! DESIGN
//! ======
//! Signals are best-effort. Each publish fans out immediately to the other
//! members of the room and records the latest signal per
//! `(room, connection, kind)` with a deadline in an `ExpiryQueue`. A single
//! worker task sleeps until the earliest deadline (or until a new signal
//! wakes it) and broadcasts the implicit clear:
//! - typing: `user_typing {is_typing: false, expired: true}`
//! - cursor: `cursor_position {visible: false, expired: true}`
//!
//! Signals live in per-room shards, each a plain mutex over the room's
//! entries and deadline heap, held only for map and heap edits. Fan-out
//! always happens after it is released. Shards with no signals left are
//! dropped from the index.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::message::{CollaborationMessage, CursorPayload, Data, MessageType, now_ms};
use crate::services::expiry::ExpiryQueue;
use crate::services::registry::{ConnectionHandle, ConnectionId, FanOut, RoomId, SessionRegistry};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Typing,
    Cursor,
}

/// Most recent cursor of one connection in one room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorSnapshot {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub username: String,
    pub task_id: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    pub updated_at: i64,
}

enum Signal {
    Typing { sender: Arc<ConnectionHandle>, task_id: String },
    Cursor(CursorSnapshot),
}

/// Signal key within one room.
type SlotKey = (ConnectionId, SignalKind);

#[derive(Default)]
struct RoomSignals {
    entries: HashMap<SlotKey, Signal>,
    expiry: ExpiryQueue<SlotKey>,
}

type Shard = Arc<Mutex<RoomSignals>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// ROUTER
// =============================================================================

#[derive(Clone)]
pub struct EphemeralRouter {
    rooms: Arc<Mutex<HashMap<RoomId, Shard>>>,
    wake: Arc<Notify>,
    registry: SessionRegistry,
    typing_ttl: Duration,
    cursor_ttl: Duration,
}

impl EphemeralRouter {
    #[must_use]
    pub fn new(registry: SessionRegistry, typing_ttl: Duration, cursor_ttl: Duration) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
            registry,
            typing_ttl,
            cursor_ttl,
        }
    }

    fn shard(&self, room: &str) -> Shard {
        Arc::clone(lock(&self.rooms).entry(room.to_owned()).or_default())
    }

    fn existing(&self, room: &str) -> Option<Shard> {
        lock(&self.rooms).get(room).cloned()
    }

    fn snapshot(&self) -> Vec<(RoomId, Shard)> {
        lock(&self.rooms)
            .iter()
            .map(|(room, shard)| (room.clone(), Arc::clone(shard)))
            .collect()
    }

    /// Drop a room's shard once it holds no signals and nobody else has it.
    fn prune(&self, room: &str) {
        let mut rooms = lock(&self.rooms);
        if rooms
            .get(room)
            .is_some_and(|shard| Arc::strong_count(shard) == 1 && lock(shard).entries.is_empty())
        {
            rooms.remove(room);
        }
    }

    /// Forward a typing pulse to the other members of `room`.
    ///
    /// `is_typing = true` (re)arms the auto-clear window; switching to a
    /// different task first clears the indicator on the previous one.
    pub async fn publish_typing(
        &self,
        sender: &Arc<ConnectionHandle>,
        room: &str,
        task_id: &str,
        is_typing: bool,
    ) -> FanOut {
        let key = (sender.id, SignalKind::Typing);
        let shard = self.shard(room);
        let superseded = {
            let mut signals = lock(&shard);
            if is_typing {
                let previous = signals
                    .entries
                    .insert(key, Signal::Typing { sender: Arc::clone(sender), task_id: task_id.to_owned() });
                signals
                    .expiry
                    .schedule(key, Instant::now() + self.typing_ttl);
                match previous {
                    Some(Signal::Typing { task_id: old, .. }) if old != task_id => Some(old),
                    _ => None,
                }
            } else {
                signals.entries.remove(&key);
                signals.expiry.cancel(&key);
                None
            }
        };
        drop(shard);
        if is_typing {
            self.wake.notify_one();
        } else {
            self.prune(room);
        }

        if let Some(old_task) = superseded {
            let clear = typing_message(sender, room, &old_task, false, false);
            self.registry
                .broadcast(room, &clear, Some(sender.id))
                .await;
        }

        debug!(%room, user_id = %sender.user_id, task_id, is_typing, "router: typing");
        let msg = typing_message(sender, room, task_id, is_typing, false);
        self.registry.broadcast(room, &msg, Some(sender.id)).await
    }

    /// Forward a cursor move and retain it as the connection's latest cursor.
    pub async fn publish_cursor(&self, sender: &Arc<ConnectionHandle>, room: &str, cursor: CursorPayload) -> FanOut {
        let snapshot = CursorSnapshot {
            connection_id: sender.id,
            user_id: sender.user_id.clone(),
            username: sender.username.clone(),
            task_id: cursor.task_id,
            x: cursor.x,
            y: cursor.y,
            element: cursor.element,
            updated_at: now_ms(),
        };
        {
            let shard = self.shard(room);
            let mut signals = lock(&shard);
            let key = (sender.id, SignalKind::Cursor);
            signals
                .entries
                .insert(key, Signal::Cursor(snapshot.clone()));
            signals
                .expiry
                .schedule(key, Instant::now() + self.cursor_ttl);
        }
        self.wake.notify_one();

        let msg = cursor_message(&snapshot, room, true, false);
        self.registry.broadcast(room, &msg, Some(sender.id)).await
    }

    /// Live cursors in a room, for late joiners.
    #[must_use]
    pub fn cursors_in(&self, room: &str) -> Vec<CursorSnapshot> {
        let Some(shard) = self.existing(room) else {
            return Vec::new();
        };
        let mut cursors: Vec<CursorSnapshot> = lock(&shard)
            .entries
            .values()
            .filter_map(|signal| match signal {
                Signal::Cursor(snapshot) => Some(snapshot.clone()),
                Signal::Typing { .. } => None,
            })
            .collect();
        cursors.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        cursors
    }

    /// Drop a connection's signals in `room` and tell the room right away.
    pub async fn forget(&self, connection_id: ConnectionId, room: &str) {
        let Some(shard) = self.existing(room) else {
            return;
        };
        let removed = {
            let mut signals = lock(&shard);
            [SignalKind::Typing, SignalKind::Cursor]
                .into_iter()
                .filter_map(|kind| {
                    let key = (connection_id, kind);
                    signals.expiry.cancel(&key);
                    signals.entries.remove(&key).map(|signal| (key, signal))
                })
                .collect::<Vec<_>>()
        };
        drop(shard);
        self.prune(room);
        for (key, signal) in removed {
            self.broadcast_clear(room, key, &signal, false).await;
        }
    }

    /// `forget` across every room a departing connection held.
    pub async fn forget_all(&self, connection_id: ConnectionId, rooms: &BTreeSet<RoomId>) {
        for room in rooms {
            self.forget(connection_id, room).await;
        }
    }

    /// Clear every signal whose window has lapsed. Returns how many expired.
    pub async fn expire_due(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        for (room, shard) in self.snapshot() {
            let lapsed = {
                let mut signals = lock(&shard);
                let keys = signals.expiry.pop_expired(now);
                keys.into_iter()
                    .filter_map(|key| signals.entries.remove(&key).map(|signal| (key, signal)))
                    .collect::<Vec<_>>()
            };
            drop(shard);
            if !lapsed.is_empty() {
                self.prune(&room);
                expired.push((room, lapsed));
            }
        }
        let mut count = 0;
        for (room, lapsed) in expired {
            for (key, signal) in lapsed {
                self.broadcast_clear(&room, key, &signal, true).await;
                count += 1;
            }
        }
        count
    }

    /// Earliest deadline across all rooms.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.snapshot()
            .into_iter()
            .filter_map(|(_, shard)| lock(&shard).expiry.next_deadline())
            .min()
    }

    #[must_use]
    pub fn active_signals(&self) -> usize {
        self.snapshot()
            .into_iter()
            .map(|(_, shard)| lock(&shard).entries.len())
            .sum()
    }

    #[cfg(test)]
    pub fn room_shards(&self) -> usize {
        lock(&self.rooms).len()
    }

    async fn broadcast_clear(&self, room: &str, (connection_id, kind): SlotKey, signal: &Signal, expired: bool) {
        let msg = match signal {
            Signal::Typing { sender, task_id } => typing_message(sender, room, task_id, false, expired),
            Signal::Cursor(snapshot) => cursor_message(snapshot, room, false, expired),
        };
        debug!(%room, %connection_id, ?kind, expired, "router: signal cleared");
        self.registry
            .broadcast(room, &msg, Some(connection_id))
            .await;
    }
}

/// Spawn the expiry worker. Returns a handle for shutdown.
pub fn spawn_expiry_task(router: EphemeralRouter) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match router.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = router.wake.notified() => {}
                    }
                }
                None => router.wake.notified().await,
            }
            router.expire_due(Instant::now()).await;
        }
    })
}

// =============================================================================
// MESSAGES
// =============================================================================

fn typing_message(
    sender: &ConnectionHandle,
    room: &str,
    task_id: &str,
    is_typing: bool,
    expired: bool,
) -> CollaborationMessage {
    let mut msg = CollaborationMessage::new(MessageType::UserTyping, Data::new())
        .with_sender(sender.user_id.as_str(), sender.username.as_str())
        .with_room(room)
        .with_data("user_id", sender.user_id.as_str())
        .with_data("username", sender.username.as_str())
        .with_data("connection_id", sender.id.to_string())
        .with_data("task_id", task_id)
        .with_data("is_typing", is_typing);
    if expired {
        msg = msg.with_data("expired", true);
    }
    msg
}

fn cursor_message(cursor: &CursorSnapshot, room: &str, visible: bool, expired: bool) -> CollaborationMessage {
    let mut msg = CollaborationMessage::new(MessageType::CursorPosition, Data::new())
        .with_sender(cursor.user_id.as_str(), cursor.username.as_str())
        .with_room(room)
        .with_data("connection_id", cursor.connection_id.to_string())
        .with_data("task_id", cursor.task_id.as_str())
        .with_data("visible", visible);
    if visible {
        msg = msg
            .with_data("x", cursor.x)
            .with_data("y", cursor.y)
            .with_data("element", cursor.element.clone());
    }
    if expired {
        msg = msg.with_data("expired", true);
    }
    msg
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
