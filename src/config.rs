//! Hub configuration parsed from environment variables.
//!
//! Every knob has a typed default; a malformed value falls back to the
//! default rather than failing startup.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TYPING_TTL_MS: u64 = 3000;
pub const DEFAULT_CURSOR_TTL_MS: u64 = 5000;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_AUTO_JOIN_ROOMS: &str = "general";
pub const DEFAULT_MAX_USER_ID_LEN: usize = 128;
pub const DEFAULT_MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub port: u16,
    /// Silence after which a connection is forced into `Draining`.
    pub heartbeat_timeout: Duration,
    /// Cadence of server `heartbeat` messages and websocket pings.
    pub heartbeat_interval: Duration,
    pub typing_ttl: Duration,
    pub cursor_ttl: Duration,
    pub outbound_queue_capacity: usize,
    /// Rooms every admitted connection joins during accept.
    pub auto_join_rooms: Vec<String>,
    pub max_user_id_len: usize,
    /// Longest room id a client may join or target, in characters.
    pub max_room_id_len: usize,
}

impl HubConfig {
    /// Build typed hub config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `HEARTBEAT_TIMEOUT_SECS`: default 60
    /// - `HEARTBEAT_INTERVAL_SECS`: default 30
    /// - `TYPING_TTL_MS`: default 3000
    /// - `CURSOR_TTL_MS`: default 5000
    /// - `OUTBOUND_QUEUE_CAPACITY`: default 256
    /// - `AUTO_JOIN_ROOMS`: comma-separated, default `general`, empty disables
    /// - `MAX_USER_ID_LEN`: default 128
    /// - `MAX_ROOM_ID_LEN`: default 128
    #[must_use]
    pub fn from_env() -> Self {
        let auto_join_raw = std::env::var("AUTO_JOIN_ROOMS").unwrap_or_else(|_| DEFAULT_AUTO_JOIN_ROOMS.to_owned());

        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            heartbeat_timeout: Duration::from_secs(env_parse("HEARTBEAT_TIMEOUT_SECS", DEFAULT_HEARTBEAT_TIMEOUT_SECS)),
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )),
            typing_ttl: Duration::from_millis(env_parse("TYPING_TTL_MS", DEFAULT_TYPING_TTL_MS)),
            cursor_ttl: Duration::from_millis(env_parse("CURSOR_TTL_MS", DEFAULT_CURSOR_TTL_MS)),
            outbound_queue_capacity: env_parse("OUTBOUND_QUEUE_CAPACITY", DEFAULT_OUTBOUND_QUEUE_CAPACITY).max(1),
            auto_join_rooms: parse_room_list(&auto_join_raw),
            max_user_id_len: env_parse("MAX_USER_ID_LEN", DEFAULT_MAX_USER_ID_LEN),
            max_room_id_len: env_parse("MAX_ROOM_ID_LEN", DEFAULT_MAX_ROOM_ID_LEN).max(1),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            typing_ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MS),
            cursor_ttl: Duration::from_millis(DEFAULT_CURSOR_TTL_MS),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            auto_join_rooms: parse_room_list(DEFAULT_AUTO_JOIN_ROOMS),
            max_user_id_len: DEFAULT_MAX_USER_ID_LEN,
            max_room_id_len: DEFAULT_MAX_ROOM_ID_LEN,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Split a comma-separated room list, dropping blanks and duplicates.
pub(crate) fn parse_room_list(raw: &str) -> Vec<String> {
    let mut rooms: Vec<String> = Vec::new();
    for room in raw.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        if !rooms.iter().any(|r| r == room) {
            rooms.push(room.to_owned());
        }
    }
    rooms
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
