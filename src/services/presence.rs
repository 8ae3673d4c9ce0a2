//! Presence tracker — per-user status and activity.
//!
//! Presence is keyed by user, not by connection. Each user has a slot with
//! its own async mutex; the index map is locked only to find or create a
//! slot, so updates for different users never contend.
//!
//! Reference counting of a user's connections happens in the connection
//! lifecycle. It takes `lock_user` and keeps the hold across the registry
//! change, so "was this the last connection?" and the clear that follows
//! cannot interleave with another admission of the same user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::message::now_ms;

/// Activity label assigned on first admission.
pub const DEFAULT_ACTIVITY: &str = "Connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
    Focused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub username: String,
    pub status: PresenceStatus,
    pub activity: String,
    /// Milliseconds since Unix epoch of the last update.
    pub last_seen: i64,
}

type Slot = Arc<tokio::sync::Mutex<Option<PresenceRecord>>>;

#[derive(Clone, Default)]
pub struct PresenceTracker {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Exclusive hold on one user's presence. Other updates for the same user
/// wait until it is dropped.
pub struct UserPresence {
    user_id: String,
    guard: OwnedMutexGuard<Option<PresenceRecord>>,
    tracker: PresenceTracker,
}

impl UserPresence {
    #[must_use]
    pub fn record(&self) -> Option<&PresenceRecord> {
        (*self.guard).as_ref()
    }

    /// Upsert and return the stored record. `activity: None` keeps the
    /// previous label.
    pub fn set(&mut self, username: &str, status: PresenceStatus, activity: Option<&str>) -> PresenceRecord {
        let user_id = &self.user_id;
        let record = self.guard.get_or_insert_with(|| PresenceRecord {
            user_id: user_id.clone(),
            username: username.to_owned(),
            status,
            activity: DEFAULT_ACTIVITY.to_owned(),
            last_seen: 0,
        });
        username.clone_into(&mut record.username);
        record.status = status;
        if let Some(activity) = activity {
            activity.clone_into(&mut record.activity);
        }
        record.last_seen = now_ms().max(record.last_seen);
        record.clone()
    }

    pub fn clear(&mut self) -> Option<PresenceRecord> {
        self.guard.take()
    }
}

impl Drop for UserPresence {
    fn drop(&mut self) {
        if self.guard.is_none() {
            // Index entry plus this guard: nobody else is waiting on the slot.
            let slot = OwnedMutexGuard::mutex(&self.guard);
            let mut slots = self.tracker.slots();
            if slots
                .get(&self.user_id)
                .is_some_and(|held| Arc::ptr_eq(held, slot) && Arc::strong_count(held) == 2)
            {
                slots.remove(&self.user_id);
            }
        }
    }
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn existing(&self, user_id: &str) -> Option<Slot> {
        self.slots().get(user_id).cloned()
    }

    /// Take the user's presence slot, creating it if needed.
    pub async fn lock_user(&self, user_id: &str) -> UserPresence {
        let slot = Arc::clone(self.slots().entry(user_id.to_owned()).or_default());
        UserPresence { user_id: user_id.to_owned(), guard: slot.lock_owned().await, tracker: self.clone() }
    }

    /// Upsert a user's presence and return the stored record.
    /// `activity: None` keeps the previous label.
    pub async fn set_presence(
        &self,
        user_id: &str,
        username: &str,
        status: PresenceStatus,
        activity: Option<&str>,
    ) -> PresenceRecord {
        self.lock_user(user_id)
            .await
            .set(username, status, activity)
    }

    /// Remove a user's record. Returns what was removed.
    pub async fn clear_presence(&self, user_id: &str) -> Option<PresenceRecord> {
        if self.existing(user_id).is_none() {
            return None;
        }
        self.lock_user(user_id).await.clear()
    }

    pub async fn get(&self, user_id: &str) -> Option<PresenceRecord> {
        let slot = self.existing(user_id)?;
        slot.lock().await.clone()
    }

    /// Records for a set of users, skipping any without presence.
    pub async fn get_many<'a, I>(&self, user_ids: I) -> Vec<PresenceRecord>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut records = Vec::new();
        for user_id in user_ids {
            if let Some(record) = self.get(user_id).await {
                records.push(record);
            }
        }
        records
    }

    /// Users with a stored record.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots().values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    #[cfg(test)]
    pub fn slot_count(&self) -> usize {
        self.slots().len()
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
