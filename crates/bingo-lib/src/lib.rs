// ============================
// bingo-lib/src/lib.rs
// ============================
//! Room state synchronization for multiplayer bingo.
//!
//! One host owns each room's `RoomState` and replicates it by full-snapshot
//! broadcast over a relay channel; players hold read-only replicas and
//! submit win claims that the host re-verifies before a human approves them.

pub mod animation;
pub mod config;
pub mod error;
pub mod host;
pub mod hub;
pub mod local_store;
pub mod metrics;
pub mod player;
pub mod presence;
pub mod reconcile;
pub mod session;
pub mod state;
pub mod storage;
pub mod validation;
pub mod ws_router;

use std::sync::Arc;

use crate::config::Settings;
use crate::hub::ChannelHub;

/// Application state shared across all relay handlers
#[derive(Clone)]
pub struct AppState<S> {
    /// Broadcast + presence relay
    pub hub: Arc<ChannelHub>,
    /// Settings
    pub settings: Arc<Settings>,
    /// Room persistence backend
    pub storage: S,
}

impl<S> AppState<S> {
    pub fn new(storage: S, settings: Settings) -> Self {
        Self {
            hub: Arc::new(ChannelHub::new(settings.channel_capacity)),
            settings: Arc::new(settings),
            storage,
        }
    }
}
