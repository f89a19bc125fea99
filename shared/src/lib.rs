use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MAX_PLAYERS: usize = 6;
pub const DEFAULT_MEEPLES: u32 = 7;
pub const DEFAULT_GAME_NAME: &str = "Scoreboard";
pub const DEFAULT_PLAYER_NAME: &str = "Player";
pub const DEFAULT_PLAYER_COLOR: &str = "Black";

/// Opaque, client-chosen user identifier
pub type Uid = String;
/// Opaque session identifier, generated by the server when absent
pub type GameId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: u32,
    pub name: String,
    pub color: String,
    pub score: u32,
}

impl Player {
    pub fn new(id: u32, name: &str, color: &str, score: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            color: color.to_string(),
            score,
        }
    }
}

/// One column of a score-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Scored(u32),
    Absent,
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mark::Scored(points) => write!(f, "+{}", points),
            Mark::Absent => f.write_str("-"),
        }
    }
}

impl FromStr for Mark {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-" {
            return Ok(Mark::Absent);
        }

        s.strip_prefix('+')
            .and_then(|digits| digits.parse::<u32>().ok())
            .map(Mark::Scored)
            .ok_or_else(|| format!("invalid score mark '{}'", s))
    }
}

impl Serialize for Mark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// A single scoring event.
///
/// On the wire this is a flat array: the `HH:MM:SS` stamp followed by one
/// mark per player position, e.g. `["20:15:03", "+5", "-"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub time: String,
    pub marks: Vec<Mark>,
}

impl LogEntry {
    /// Builds an entry crediting `points` to `player_index` and marking
    /// every other position as absent
    pub fn scored(time: String, player_count: usize, player_index: usize, points: u32) -> Self {
        let marks = (0..player_count)
            .map(|i| {
                if i == player_index {
                    Mark::Scored(points)
                } else {
                    Mark::Absent
                }
            })
            .collect();

        Self { time, marks }
    }

    pub fn points_for(&self, player_index: usize) -> u32 {
        match self.marks.get(player_index) {
            Some(Mark::Scored(points)) => *points,
            _ => 0,
        }
    }

    /// Moves marks to a new roster layout
    ///
    /// `sources[i]` is the old position whose mark lands at position `i`;
    /// positions without a source are absent.
    pub fn realign(&mut self, sources: &[Option<usize>]) {
        self.marks = sources
            .iter()
            .map(|source| {
                source
                    .and_then(|old| self.marks.get(old).copied())
                    .unwrap_or(Mark::Absent)
            })
            .collect();
    }
}

impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.marks.len() + 1))?;
        seq.serialize_element(&self.time)?;
        for mark in &self.marks {
            seq.serialize_element(mark)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut raw = Vec::<String>::deserialize(deserializer)?.into_iter();
        let time = raw
            .next()
            .ok_or_else(|| de::Error::custom("score-log entry without timestamp"))?;
        let marks = raw
            .map(|mark| mark.parse::<Mark>().map_err(<D::Error as de::Error>::custom))
            .collect::<Result<Vec<Mark>, D::Error>>()?;

        Ok(Self { time, marks })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub admin: Option<Uid>,
    pub name: String,
    pub max_players: usize,
    pub meeples: u32,
    pub new_game: bool,
    pub players: Vec<Player>,
    pub logs: Vec<LogEntry>,
}

impl Game {
    pub fn new(admin: Option<Uid>, max_players: usize, meeples: u32) -> Self {
        Self {
            admin,
            name: DEFAULT_GAME_NAME.to_string(),
            max_players,
            meeples,
            new_game: true,
            players: Vec::new(),
            logs: Vec::new(),
        }
    }

    /// Per-position point totals summed over the score log
    pub fn totals(&self) -> Vec<u32> {
        (0..self.players.len())
            .map(|i| self.logs.iter().map(|entry| entry.points_for(i)).sum())
            .collect()
    }

    /// Next unused stable player id
    pub fn next_player_id(&self) -> u32 {
        self.players.iter().map(|p| p.id + 1).max().unwrap_or(1)
    }
}

/// Lobby-wide presence counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSummary {
    pub users: usize,
    pub games: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSpec {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub color: Option<String>,
}

impl PlayerSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameDraft {
    pub players: Option<Vec<PlayerSpec>>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub game_id: Option<GameId>,
    #[serde(default)]
    pub game: GameDraft,
}

/// A score submission
///
/// Numbers are read leniently: `5`, `5.0` and `"5"` are all accepted. A
/// value that is not a whole number, or is missing, still parses so the
/// core can reject it and tell the room: `points` becomes 0 and
/// `player_selected` an index no roster has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub game_id: GameId,
    #[serde(default, deserialize_with = "lenient_points")]
    pub points: i64,
    #[serde(default = "unknown_player", deserialize_with = "lenient_index")]
    pub player_selected: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseNumber {
    Int(i64),
    Float(f64),
    Text(String),
    Other(de::IgnoredAny),
}

impl LooseNumber {
    fn whole(&self) -> Option<i64> {
        match self {
            LooseNumber::Int(n) => Some(*n),
            LooseNumber::Float(f) => whole_float(*f),
            LooseNumber::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(whole_float))
            }
            LooseNumber::Other(_) => None,
        }
    }
}

fn whole_float(f: f64) -> Option<i64> {
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.is_finite() && f.fract() == 0.0 && in_range).then_some(f as i64)
}

fn unknown_player() -> usize {
    usize::MAX
}

fn lenient_points<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let number = Option::<LooseNumber>::deserialize(deserializer)?;
    Ok(number.and_then(|n| n.whole()).unwrap_or(0))
}

fn lenient_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    let number = Option::<LooseNumber>::deserialize(deserializer)?;
    Ok(number
        .and_then(|n| n.whole())
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or_else(unknown_player))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRequest {
    pub game_id: GameId,
}

/// Events a client sends to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "register")]
    Register(Option<Uid>),
    #[serde(rename = "pong")]
    Pong(Uid),
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "game:start")]
    GameStart(StartRequest),
    #[serde(rename = "game:get")]
    GameGet(GameId),
    #[serde(rename = "game:score")]
    GameScore(ScoreRequest),
    #[serde(rename = "game:undo")]
    GameUndo(UndoRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GameReady {
    Ready { game_id: GameId, new_game: bool },
    Failed { error: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GameUpdate {
    Snapshot { game_id: GameId, game: Game },
    Failed { game_id: GameId, error: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLookup {
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<Game>,
}

impl GameLookup {
    pub fn found(game: Game) -> Self {
        Self {
            error: false,
            game: Some(game),
        }
    }

    pub fn missing() -> Self {
        Self {
            error: true,
            game: None,
        }
    }
}

/// Events the server sends to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "app:update")]
    AppUpdate(PresenceSummary),
    #[serde(rename = "init")]
    Init(bool),
    #[serde(rename = "user:failed")]
    UserFailed(bool),
    #[serde(rename = "ping")]
    Ping(Uid),
    #[serde(rename = "game:ready")]
    GameReady(GameReady),
    #[serde(rename = "game:update")]
    GameUpdate(GameUpdate),
    #[serde(rename = "game:get")]
    GameLookup(GameLookup),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::AppUpdate(_) => "app:update",
            ServerEvent::Init(_) => "init",
            ServerEvent::UserFailed(_) => "user:failed",
            ServerEvent::Ping(_) => "ping",
            ServerEvent::GameReady(_) => "game:ready",
            ServerEvent::GameUpdate(_) => "game:update",
            ServerEvent::GameLookup(_) => "game:get",
        }
    }
}
