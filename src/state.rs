//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It bundles the hub configuration and the four shared services. The
//! router and relay hold a clone of the same registry, so every fan-out
//! sees one membership view.

use std::sync::Arc;

use crate::config::HubConfig;
use crate::services::presence::PresenceTracker;
use crate::services::registry::SessionRegistry;
use crate::services::relay::DurableRelay;
use crate::services::router::EphemeralRouter;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-backed.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub registry: SessionRegistry,
    pub presence: PresenceTracker,
    pub router: EphemeralRouter,
    pub relay: DurableRelay,
}

impl AppState {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let registry = SessionRegistry::new();
        let router = EphemeralRouter::new(registry.clone(), config.typing_ttl, config.cursor_ttl);
        let relay = DurableRelay::new(registry.clone());
        Self { config: Arc::new(config), registry, presence: PresenceTracker::new(), router, relay }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::time::Duration;

    use super::*;

    /// Config with millisecond windows so expiry paths run quickly.
    #[must_use]
    pub fn test_config() -> HubConfig {
        HubConfig {
            port: 0,
            heartbeat_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
            typing_ttl: Duration::from_millis(150),
            cursor_ttl: Duration::from_millis(200),
            outbound_queue_capacity: 64,
            auto_join_rooms: vec!["general".into()],
            max_user_id_len: 32,
            max_room_id_len: 24,
        }
    }

    #[must_use]
    pub fn test_app_state() -> AppState {
        AppState::new(test_config())
    }

    /// Test state with a custom config tweak applied.
    #[must_use]
    pub fn test_app_state_with(tweak: impl FnOnce(&mut HubConfig)) -> AppState {
        let mut config = test_config();
        tweak(&mut config);
        AppState::new(config)
    }
}
