//! Runtime configuration shared by the core and the network layer

use crate::persistence::RetryPolicy;
use shared::{DEFAULT_GAME_NAME, DEFAULT_MAX_PLAYERS, DEFAULT_MEEPLES};
use std::path::PathBuf;
use std::time::Duration;

/// Time a probed user gets to answer with `pong` before the next sweep
/// evicts them. Exactly one unanswered probe round leads to eviction.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Roster cap applied to every session
    pub max_players: usize,
    /// Ruleset parameter copied into every session
    pub meeples: u32,
    /// Session name used when a start request carries none
    pub default_game_name: String,
    pub probe_interval: Duration,
    /// Directory for session snapshots; persistence is disabled when unset
    pub data_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_players: DEFAULT_MAX_PLAYERS,
            meeples: DEFAULT_MEEPLES,
            default_game_name: DEFAULT_GAME_NAME.to_string(),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            data_dir: None,
            retry: RetryPolicy::default(),
        }
    }
}
