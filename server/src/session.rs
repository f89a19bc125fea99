use crate::config::ServerConfig;
use crate::error::SyncError;
use chrono::NaiveTime;
use log::{debug, info};
use rand::Rng;
use shared::{
    Game, GameId, LogEntry, Player, PlayerSpec, DEFAULT_PLAYER_COLOR, DEFAULT_PLAYER_NAME,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// What a successful `start_or_update` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub game_id: GameId,
    pub new_game: bool,
}

/// In-memory registry of game sessions
pub struct SessionStore {
    games: HashMap<GameId, Game>,
    max_players: usize,
    meeples: u32,
    default_name: String,
}

impl SessionStore {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            games: HashMap::new(),
            max_players: config.max_players,
            meeples: config.meeples,
            default_name: config.default_game_name.clone(),
        }
    }

    /// Puts a previously persisted session back into the registry
    pub fn restore(&mut self, game_id: GameId, game: Game) {
        debug!("Restored game {} with {} log entries", game_id, game.logs.len());
        self.games.insert(game_id, game);
    }

    /// Creates a session or replaces the roster of an existing one
    ///
    /// An absent, empty or unknown `game_id` creates a new session owned by
    /// `admin`. The roster is always rebuilt from `players_in` and capped at
    /// the configured maximum. Scores carry over from the previous roster
    /// and every log column moves with the player it belongs to; columns of
    /// players who left are dropped.
    pub fn start_or_update(
        &mut self,
        game_id: Option<&str>,
        players_in: Option<&[PlayerSpec]>,
        name: Option<&str>,
        admin: Option<&str>,
    ) -> Result<StartOutcome, SyncError> {
        let players_in = match players_in {
            Some(players) if !players.is_empty() => players,
            _ => return Err(SyncError::EmptyRoster),
        };

        let game_id = match game_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self.generate_game_id(),
        };

        let game = match self.games.entry(game_id.clone()) {
            Entry::Occupied(entry) => {
                let game = entry.into_mut();
                game.new_game = false;
                game
            }
            Entry::Vacant(entry) => {
                info!("Created game {}", game_id);
                entry.insert(Game::new(
                    admin.map(str::to_string),
                    self.max_players,
                    self.meeples,
                ))
            }
        };

        let (players, sources) = rebuild_roster(&game.players, players_in, self.max_players);
        for entry in &mut game.logs {
            entry.realign(&sources);
        }
        game.players = players;
        game.name = name
            .filter(|name| !name.is_empty())
            .unwrap_or(self.default_name.as_str())
            .to_string();
        game.max_players = self.max_players;
        game.meeples = self.meeples;

        debug!(
            "Game {} roster: {:?}",
            game_id,
            game.players.iter().map(|p| &p.name).collect::<Vec<_>>()
        );

        Ok(StartOutcome {
            new_game: game.new_game,
            game_id,
        })
    }

    pub fn get(&self, game_id: &str) -> Option<&Game> {
        self.games.get(game_id)
    }

    /// Appends one score-log entry crediting `points` to `player_index`
    ///
    /// The entry is sized from the session's own roster and stamped with
    /// `at` as `HH:MM:SS`.
    pub fn record_score(
        &mut self,
        game_id: &str,
        player_index: usize,
        points: i64,
        at: NaiveTime,
    ) -> Result<&Game, SyncError> {
        let game = self
            .games
            .get_mut(game_id)
            .ok_or_else(|| SyncError::UnknownGame(game_id.to_string()))?;

        let points = u32::try_from(points)
            .ok()
            .filter(|points| *points > 0)
            .ok_or(SyncError::InvalidPoints(points))?;

        if player_index >= game.players.len() {
            return Err(SyncError::PlayerOutOfRange {
                index: player_index,
                players: game.players.len(),
            });
        }

        let entry = LogEntry::scored(
            at.format("%H:%M:%S").to_string(),
            game.players.len(),
            player_index,
            points,
        );
        game.logs.push(entry);
        debug!(
            "Game {}: +{} for player {} (totals {:?})",
            game_id,
            points,
            player_index,
            game.totals()
        );

        Ok(&*game)
    }

    /// Removes the last score-log entry
    ///
    /// Returns None, leaving everything untouched, when the session is
    /// unknown or its log is already empty.
    pub fn undo(&mut self, game_id: &str) -> Option<&Game> {
        let game = self.games.get_mut(game_id)?;
        let removed = game.logs.pop()?;
        debug!("Game {}: undid entry from {}", game_id, removed.time);
        Some(&*game)
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    fn generate_game_id(&self) -> GameId {
        loop {
            let id = generate_guid();
            if !self.games.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Random identifier in the familiar 8-4-4-4-12 hex layout
pub fn generate_guid() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffff_ffff_ffff,
    )
}

/// Builds the next roster from the incoming player list
///
/// Returns the players together with, for each new position, the previous
/// position it continues. Players naming a known id are matched first. A
/// player without an id then takes over the previous player at the same
/// position, unless someone already claimed that player by id. Everyone
/// else starts at 0 with a fresh id.
fn rebuild_roster(
    previous: &[Player],
    incoming: &[PlayerSpec],
    max_players: usize,
) -> (Vec<Player>, Vec<Option<usize>>) {
    let incoming = &incoming[..incoming.len().min(max_players)];
    let mut claimed = vec![false; previous.len()];
    let mut sources: Vec<Option<usize>> = vec![None; incoming.len()];

    for (position, spec) in incoming.iter().enumerate() {
        let Some(id) = spec.id else {
            continue;
        };
        if let Some(old) = previous.iter().position(|p| p.id == id) {
            if !claimed[old] {
                claimed[old] = true;
                sources[position] = Some(old);
            }
        }
    }

    for (position, spec) in incoming.iter().enumerate() {
        if spec.id.is_none() && position < previous.len() && !claimed[position] {
            claimed[position] = true;
            sources[position] = Some(position);
        }
    }

    let mut next_id = previous.iter().map(|p| p.id + 1).max().unwrap_or(1);
    let players = incoming
        .iter()
        .zip(&sources)
        .map(|(spec, source)| {
            let (id, score) = match source.and_then(|old| previous.get(old)) {
                Some(player) => (player.id, player.score),
                None => {
                    let id = next_id;
                    next_id += 1;
                    (id, 0)
                }
            };

            Player::new(
                id,
                spec.name
                    .as_deref()
                    .filter(|name| !name.is_empty())
                    .unwrap_or(DEFAULT_PLAYER_NAME),
                spec.color
                    .as_deref()
                    .filter(|color| !color.is_empty())
                    .unwrap_or(DEFAULT_PLAYER_COLOR),
                score,
            )
        })
        .collect();

    (players, sources)
}
