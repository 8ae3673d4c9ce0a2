//! Durable event relay — ordered fan-out of committed mutations.
//!
//! DESIGN
//! ======
//! Each room has a lane: an async mutex around the room's sequence counter.
//! An announce holds its room's lane for the sequence bump and the
//! enqueue pass, so announces to one room reach every member in call order
//! while announces to different rooms never contend. Membership events
//! (`user_joined`, `user_left`) take the same lane so clients see them
//! interleaved correctly with task events.
//!
//! Every relayed message carries `seq` in its data. Lanes for rooms that no
//! longer have members are pruned, so the counter lives only as long as the
//! room does.
//!
//! ERROR HANDLING
//! ==============
//! The relay cannot reject a commit. The only caller error is announcing a
//! type outside the durable set. Per-member delivery failures are reported
//! in the `FanOut` and never abort the pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info};

use crate::message::{CollaborationMessage, Data, ErrorCode, MessageType, SYSTEM_USER_ID, SYSTEM_USERNAME};
use crate::services::registry::{ConnectionId, FanOut, RoomId, SessionRegistry};

type Lane = Arc<tokio::sync::Mutex<u64>>;

/// Who the relay attributes an event to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub username: String,
}

impl Actor {
    #[must_use]
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), username: username.into() }
    }

    /// The hub itself; used when the mutation API names no user.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SYSTEM_USER_ID, SYSTEM_USERNAME)
    }
}

/// Outcome of one announce, as reported back to the mutation API.
#[derive(Debug, Clone, Serialize)]
pub struct Announcement {
    pub room_id: RoomId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub seq: u64,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    #[error("{0} is not a durable event type")]
    NotDurable(MessageType),
}

impl ErrorCode for AnnounceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotDurable(_) => "E_NOT_DURABLE",
        }
    }
}

#[derive(Clone)]
pub struct DurableRelay {
    registry: SessionRegistry,
    lanes: Arc<Mutex<HashMap<RoomId, Lane>>>,
}

impl DurableRelay {
    #[must_use]
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry, lanes: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<RoomId, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lane(&self, room: &str) -> Lane {
        Arc::clone(self.lanes().entry(room.to_owned()).or_default())
    }

    /// Announce an already-committed task mutation to every member of `room`.
    ///
    /// # Errors
    ///
    /// `NotDurable` if `kind` is not one of the task mutation types.
    pub async fn announce(
        &self,
        room: &str,
        kind: MessageType,
        data: Data,
        actor: &Actor,
    ) -> Result<Announcement, AnnounceError> {
        if !kind.is_durable() {
            return Err(AnnounceError::NotDurable(kind));
        }
        let msg = CollaborationMessage::new(kind, data).with_sender(actor.user_id.as_str(), actor.username.as_str());
        let (seq, report) = self.emit(room, msg, None).await;
        info!(%room, %kind, seq, delivered = report.delivered, failed = report.failed.len(), "relay: announce");
        Ok(Announcement { room_id: room.to_owned(), kind, seq, delivered: report.delivered, failed: report.failed.len() })
    }

    /// Sequence and fan out `msg` on the room's lane. Used for task events
    /// and for membership events that must stay ordered with them.
    pub async fn emit(
        &self,
        room: &str,
        msg: CollaborationMessage,
        exclude: Option<ConnectionId>,
    ) -> (u64, FanOut) {
        let lane = self.lane(room);
        let (seq, report) = {
            let mut counter = lane.lock().await;
            *counter += 1;
            let seq = *counter;
            let msg = msg.with_room(room).with_data("seq", seq);
            let report = self.registry.broadcast(room, &msg, exclude).await;
            (seq, report)
        };
        drop(lane);
        if self.registry.members_of(room).await.is_empty() {
            self.prune(room);
        }
        (seq, report)
    }

    /// Last sequence number issued for `room`, 0 if none.
    pub async fn current_seq(&self, room: &str) -> u64 {
        let lane = self.lanes().get(room).cloned();
        match lane {
            Some(lane) => *lane.lock().await,
            None => 0,
        }
    }

    /// Drop the lane of a room that has no members left. A lane still held
    /// by an in-flight emit is kept.
    pub fn prune(&self, room: &str) {
        let mut lanes = self.lanes();
        if lanes
            .get(room)
            .is_some_and(|lane| Arc::strong_count(lane) == 1)
        {
            lanes.remove(room);
            debug!(%room, "relay: lane pruned");
        }
    }

    #[cfg(test)]
    pub fn lane_count(&self) -> usize {
        self.lanes().len()
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
