//! Configuration system.
//!
//! Loads server configuration from JSON strings/files (file IO left to app).
//! Every field has a default so partial JSON documents are accepted.

use serde::{Deserialize, Serialize};

/// Hard upper bound on player slots.
pub const MAX_PLAYERS: usize = 50;

/// Hard upper bound on live dummies. Keeps the worst-case snapshot inside
/// one frame and bounds the pairwise contact pass.
pub const MAX_DUMMIES: usize = 500;

/// Root server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:9002`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Number of player slots, at most [`MAX_PLAYERS`].
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Half-extent of the square play area; dummies spawn within 35% of it.
    #[serde(default = "default_map_half_extent")]
    pub map_half_extent: f32,
    /// Dummies spawned when a spawn request carries no count.
    #[serde(default = "default_dummy_count")]
    pub default_dummy_count: u32,
    /// Upper clamp for a single spawn request.
    #[serde(default = "default_max_spawn_per_request")]
    pub max_spawn_per_request: u32,
    /// Live dummies allowed at once, at most [`MAX_DUMMIES`].
    #[serde(default = "default_max_dummies")]
    pub max_dummies: usize,
    /// I/O worker threads. `None` uses the available parallelism.
    #[serde(default)]
    pub io_threads: Option<usize>,
    /// RNG seed for dummy placement. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_server_addr() -> String {
    "127.0.0.1:9002".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_max_players() -> usize {
    MAX_PLAYERS
}

fn default_map_half_extent() -> f32 {
    25.0
}

fn default_dummy_count() -> u32 {
    10
}

fn default_max_spawn_per_request() -> u32 {
    100
}

fn default_max_dummies() -> usize {
    MAX_DUMMIES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            max_players: default_max_players(),
            map_half_extent: default_map_half_extent(),
            default_dummy_count: default_dummy_count(),
            max_spawn_per_request: default_max_spawn_per_request(),
            max_dummies: default_max_dummies(),
            io_threads: None,
            seed: None,
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Slot count actually used by the registry.
    pub fn player_slots(&self) -> usize {
        self.max_players.clamp(1, MAX_PLAYERS)
    }

    /// Dummy cap actually used by the registry.
    pub fn dummy_limit(&self) -> usize {
        self.max_dummies.min(MAX_DUMMIES)
    }
}
