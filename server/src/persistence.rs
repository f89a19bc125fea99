//! Non-blocking snapshot persistence
//!
//! The core hands snapshots to a [`PersistenceBridge`] and moves on. A
//! background worker writes them through a [`SnapshotStore`], retrying a
//! bounded number of times with linear backoff. Requests that still fail
//! are reported on a failure channel instead of reaching the core.

use crate::error::PersistError;
use log::{debug, error, warn};
use shared::{Game, GameId, LogEntry};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SESSION_EXT: &str = "session";
const LOG_EXT: &str = "log";

/// A durable snapshot the core asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Session { game_id: GameId, game: Game },
    Log { game_id: GameId, logs: Vec<LogEntry> },
}

impl SyncRequest {
    pub fn game_id(&self) -> &str {
        match self {
            SyncRequest::Session { game_id, .. } | SyncRequest::Log { game_id, .. } => game_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncRequest::Session { .. } => "session",
            SyncRequest::Log { .. } => "log",
        }
    }

    fn write_to(&self, store: &dyn SnapshotStore) -> Result<(), PersistError> {
        match self {
            SyncRequest::Session { game_id, game } => store.write_session(game_id, game),
            SyncRequest::Log { game_id, logs } => store.write_log(game_id, logs),
        }
    }
}

/// A request the worker gave up on
#[derive(Debug)]
pub struct SyncFailure {
    pub game_id: GameId,
    pub kind: &'static str,
    pub attempts: u32,
    pub error: PersistError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total write attempts per request, including the first
    pub attempts: u32,
    /// Delay before the second attempt; grows linearly afterwards
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Durable storage for session snapshots
///
/// Implementations may block; the worker calls them off the async runtime.
pub trait SnapshotStore: Send + Sync + 'static {
    fn write_session(&self, game_id: &str, game: &Game) -> Result<(), PersistError>;
    fn write_log(&self, game_id: &str, logs: &[LogEntry]) -> Result<(), PersistError>;
}

/// Handle the core uses to request snapshots
#[derive(Clone)]
pub struct PersistenceBridge {
    queue: Option<mpsc::UnboundedSender<SyncRequest>>,
}

impl PersistenceBridge {
    /// Creates a bridge feeding the returned request queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { queue: Some(tx) }, rx)
    }

    /// Spawns the write worker for `store`
    ///
    /// Must be called from within a Tokio runtime. The receiver yields every
    /// request that exhausted its retries.
    pub fn spawn(
        store: Arc<dyn SnapshotStore>,
        policy: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SyncFailure>) {
        let (bridge, requests) = Self::channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(store, policy, requests, failure_tx));
        (bridge, failure_rx)
    }

    /// A bridge that drops every request
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    pub fn sync_session(&self, game_id: &str, game: &Game) {
        self.enqueue(SyncRequest::Session {
            game_id: game_id.to_string(),
            game: game.clone(),
        });
    }

    pub fn sync_log(&self, game_id: &str, logs: &[LogEntry]) {
        self.enqueue(SyncRequest::Log {
            game_id: game_id.to_string(),
            logs: logs.to_vec(),
        });
    }

    fn enqueue(&self, request: SyncRequest) {
        let Some(queue) = &self.queue else {
            return;
        };
        if let Err(e) = queue.send(request) {
            error!(
                "Persistence worker gone, dropped {} sync for {}",
                e.0.kind(),
                e.0.game_id()
            );
        }
    }
}

async fn run_worker(
    store: Arc<dyn SnapshotStore>,
    policy: RetryPolicy,
    mut requests: mpsc::UnboundedReceiver<SyncRequest>,
    failures: mpsc::UnboundedSender<SyncFailure>,
) {
    while let Some(request) = requests.recv().await {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let job_store = Arc::clone(&store);
            let job = request.clone();
            let result = tokio::task::spawn_blocking(move || job.write_to(job_store.as_ref())).await;

            match result {
                Ok(Ok(())) => {
                    debug!("Synced {} for game {}", request.kind(), request.game_id());
                    break;
                }
                Ok(Err(e)) if attempt < policy.attempts.max(1) => {
                    warn!(
                        "Sync {} for game {} failed (attempt {}): {}",
                        request.kind(),
                        request.game_id(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
                Ok(Err(e)) => {
                    let failure = SyncFailure {
                        game_id: request.game_id().to_string(),
                        kind: request.kind(),
                        attempts: attempt,
                        error: e,
                    };
                    if failures.send(failure).is_err() {
                        debug!("Nobody listens for sync failures");
                    }
                    break;
                }
                Err(e) => {
                    error!("Sync task for game {} panicked: {}", request.game_id(), e);
                    break;
                }
            }
        }
    }
    debug!("Persistence worker stopped");
}

/// Stores each session as bincode files under one directory
///
/// File stems are the hex encoding of the game id, so client-chosen ids
/// can never escape the directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, game_id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_stem(game_id), ext))
    }

    /// Reads back every stored session, applying the newer standalone log
    /// over the log embedded in the session snapshot
    ///
    /// Files that cannot be read or decoded are logged and skipped. Only a
    /// directory that cannot be listed is an error.
    pub fn load_all(&self) -> Result<Vec<(GameId, Game)>, PersistError> {
        let mut games = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", self.dir.display(), e);
                    continue;
                }
            };
            if path.extension().and_then(|ext| ext.to_str()) != Some(SESSION_EXT) {
                continue;
            }

            match self.load_session(&path) {
                Ok(game) => games.push(game),
                Err(e) => warn!("Skipping snapshot {}: {}", path.display(), e),
            }
        }

        Ok(games)
    }

    fn load_session(&self, path: &Path) -> Result<(GameId, Game), PersistError> {
        let game_id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(decode_stem)
            .ok_or_else(|| PersistError::BadFileName(path.display().to_string()))?;

        let mut game: Game = bincode::deserialize(&fs::read(path)?)?;
        let log_path = self.path_for(&game_id, LOG_EXT);
        if log_path.exists() {
            game.logs = bincode::deserialize(&fs::read(&log_path)?)?;
        }

        Ok((game_id, game))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn write_session(&self, game_id: &str, game: &Game) -> Result<(), PersistError> {
        fs::write(self.path_for(game_id, SESSION_EXT), bincode::serialize(game)?)?;
        // The session snapshot carries the log too; a stale standalone log
        // would shadow it on load.
        fs::write(self.path_for(game_id, LOG_EXT), bincode::serialize(&game.logs)?)?;
        Ok(())
    }

    fn write_log(&self, game_id: &str, logs: &[LogEntry]) -> Result<(), PersistError> {
        fs::write(self.path_for(game_id, LOG_EXT), bincode::serialize(logs)?)?;
        Ok(())
    }
}

fn encode_stem(game_id: &str) -> String {
    game_id.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_stem(stem: &str) -> Option<String> {
    if stem.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..stem.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(stem.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
