use shared::GameId;
use thiserror::Error;

/// Validation and lookup failures raised by the synchronization core.
///
/// None of these are fatal: the core answers with a targeted or room-wide
/// error event and leaves its state untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("registration without a user id")]
    EmptyUid,
    #[error("game start without players")]
    EmptyRoster,
    #[error("unknown game '{0}'")]
    UnknownGame(GameId),
    #[error("points must be a positive 32-bit value, got {0}")]
    InvalidPoints(i64),
    #[error("player {index} outside roster of {players}")]
    PlayerOutOfRange { index: usize, players: usize },
}

/// Snapshot storage failures, retried by the persistence worker
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("snapshot file name '{0}' is not a valid game id")]
    BadFileName(String),
}
