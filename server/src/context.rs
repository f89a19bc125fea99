//! The synchronization core
//!
//! [`SyncContext`] owns every registry: presence sets, sessions, channel
//! routing and the sweep timer. The network layer feeds it one event at a
//! time and each call runs to completion before the next starts, so no
//! locking is involved. Session mutations enqueue persistence before they
//! fan out, and persistence never blocks the fanout.

use crate::broadcast::{ConnId, Dispatcher, Outbox};
use crate::config::ServerConfig;
use crate::persistence::PersistenceBridge;
use crate::presence::PresenceTracker;
use crate::session::SessionStore;
use crate::sweep::SweepTimer;
use chrono::Local;
use log::{debug, info, warn};
use shared::{
    ClientEvent, Game, GameId, GameLookup, GameReady, GameUpdate, PresenceSummary, ScoreRequest,
    ServerEvent, StartRequest, Uid,
};
use tokio::time::Instant;

pub struct SyncContext {
    presence: PresenceTracker,
    sessions: SessionStore,
    dispatcher: Dispatcher,
    persistence: PersistenceBridge,
    sweep_timer: SweepTimer,
}

impl SyncContext {
    pub fn new(config: &ServerConfig, persistence: PersistenceBridge) -> Self {
        Self {
            presence: PresenceTracker::new(config.probe_interval),
            sessions: SessionStore::new(config),
            dispatcher: Dispatcher::new(),
            persistence,
            sweep_timer: SweepTimer::new(),
        }
    }

    /// Seeds the session registry, typically from persisted snapshots
    pub fn restore_sessions(&mut self, games: impl IntoIterator<Item = (GameId, Game)>) {
        for (game_id, game) in games {
            self.sessions.restore(game_id, game);
        }
        info!("Restored {} game(s)", self.sessions.len());
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn sweep_deadline(&self) -> Option<Instant> {
        self.sweep_timer.deadline()
    }

    /// Welcomes a newly opened channel
    pub fn connect(&mut self, conn: ConnId, outbox: Outbox) {
        self.dispatcher.attach(conn, outbox);
        self.dispatcher
            .send_to(conn, ServerEvent::AppUpdate(self.summary()));
        self.dispatcher.send_to(conn, ServerEvent::Init(true));
        debug!(
            "Connection {} attached ({} open)",
            conn,
            self.dispatcher.connection_count()
        );
    }

    /// Handles a channel that went away
    ///
    /// The channel's user loses their live connection and a sweep runs
    /// right away to probe them.
    pub fn disconnect(&mut self, conn: ConnId, now: Instant) {
        if let Some(uid) = self.dispatcher.detach(conn) {
            self.presence.mark_disconnected(&uid);
            info!("Connection {} of user {} closed", conn, uid);
        } else {
            debug!("Anonymous connection {} closed", conn);
        }
        self.sweep(now);
    }

    pub fn handle_event(&mut self, conn: ConnId, event: ClientEvent, now: Instant) {
        match event {
            ClientEvent::Register(uid) => self.register(conn, uid, now),
            ClientEvent::Pong(uid) => self.pong(&uid),
            ClientEvent::Disconnect => self.drop_user(conn, now),
            ClientEvent::GameStart(request) => self.start_game(conn, request),
            ClientEvent::GameGet(game_id) => self.get_game(conn, &game_id),
            ClientEvent::GameScore(request) => self.record_score(conn, request),
            ClientEvent::GameUndo(request) => self.undo(conn, &request.game_id),
        }
    }

    /// Runs a reconciliation sweep and re-arms the sweep timer
    pub fn sweep(&mut self, now: Instant) {
        let outcome = self.presence.reconcile(now);

        for uid in outcome.probed {
            self.dispatcher.publish_lobby(ServerEvent::Ping(uid));
        }
        if !outcome.evicted.is_empty() {
            info!("Evicted {} user(s): {:?}", outcome.evicted.len(), outcome.evicted);
        }

        self.sweep_timer.cancel();
        if let Some(deadline) = self.presence.next_deadline() {
            self.sweep_timer.schedule(deadline);
        }

        self.dispatcher
            .publish_lobby(ServerEvent::AppUpdate(self.summary()));
    }

    /// Resolves when the next scheduled sweep is due
    pub async fn sweep_due(&self) {
        self.sweep_timer.wait().await;
    }

    pub fn summary(&self) -> PresenceSummary {
        PresenceSummary {
            users: self.presence.active_count(),
            games: self.sessions.len(),
        }
    }

    /// Binds a uid to the channel
    ///
    /// A channel switching to another uid leaves the old one without a live
    /// channel, so the old uid is probed like after a drop.
    fn register(&mut self, conn: ConnId, uid: Option<Uid>, now: Instant) {
        let uid = uid.unwrap_or_default();
        if let Err(e) = self.presence.register(&uid) {
            warn!("Connection {} failed to register: {}", conn, e);
            self.dispatcher.send_to(conn, ServerEvent::UserFailed(true));
            return;
        }

        let replaced = self
            .dispatcher
            .bind_uid(conn, &uid)
            .filter(|previous| *previous != uid);

        match replaced {
            Some(previous) => {
                info!("Connection {} switched from user {} to {}", conn, previous, uid);
                self.presence.mark_disconnected(&previous);
                self.sweep(now);
            }
            None => {
                self.cancel_idle_sweep();
                self.dispatcher
                    .publish_lobby(ServerEvent::AppUpdate(self.summary()));
            }
        }
    }

    fn pong(&mut self, uid: &str) {
        if self.presence.pong(uid) {
            self.cancel_idle_sweep();
        }
    }

    /// Explicit `disconnect` from a channel that stays open
    fn drop_user(&mut self, conn: ConnId, now: Instant) {
        if let Some(uid) = self.dispatcher.uid_of(conn) {
            let uid = uid.to_string();
            self.presence.mark_disconnected(&uid);
            info!("User {} announced disconnect", uid);
        }
        self.sweep(now);
    }

    fn cancel_idle_sweep(&mut self) {
        if !self.presence.has_pending_probes() && self.sweep_timer.is_armed() {
            debug!("No probes pending, sweep cancelled");
            self.sweep_timer.cancel();
        }
    }

    fn start_game(&mut self, conn: ConnId, request: StartRequest) {
        let StartRequest { game_id, game } = request;
        let admin = self.dispatcher.uid_of(conn).map(str::to_string);

        let outcome = match self.sessions.start_or_update(
            game_id.as_deref(),
            game.players.as_deref(),
            game.name.as_deref(),
            admin.as_deref(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Connection {} failed to start game: {}", conn, e);
                self.dispatcher
                    .send_to(conn, ServerEvent::GameReady(GameReady::Failed { error: true }));
                return;
            }
        };

        let Some(game) = self.sessions.get(&outcome.game_id) else {
            return;
        };

        self.persistence.sync_session(&outcome.game_id, game);
        self.dispatcher.join(conn, &outcome.game_id);
        self.dispatcher.send_to(
            conn,
            ServerEvent::GameReady(GameReady::Ready {
                game_id: outcome.game_id.clone(),
                new_game: outcome.new_game,
            }),
        );
        self.dispatcher.publish_room(
            &outcome.game_id,
            ServerEvent::GameUpdate(GameUpdate::Snapshot {
                game_id: outcome.game_id.clone(),
                game: game.clone(),
            }),
            Some(conn),
        );
    }

    fn get_game(&mut self, conn: ConnId, game_id: &str) {
        match self.sessions.get(game_id) {
            Some(game) => {
                self.dispatcher.join(conn, game_id);
                self.dispatcher
                    .send_to(conn, ServerEvent::GameLookup(GameLookup::found(game.clone())));
            }
            None => {
                debug!("Connection {} asked for unknown game {}", conn, game_id);
                self.dispatcher
                    .send_to(conn, ServerEvent::GameLookup(GameLookup::missing()));
            }
        }
    }

    fn record_score(&mut self, conn: ConnId, request: ScoreRequest) {
        let ScoreRequest {
            game_id,
            points,
            player_selected,
        } = request;

        match self
            .sessions
            .record_score(&game_id, player_selected, points, Local::now().time())
        {
            Ok(game) => {
                self.persistence.sync_log(&game_id, &game.logs);
                self.dispatcher.join(conn, &game_id);
                self.dispatcher.publish_room(
                    &game_id,
                    ServerEvent::GameUpdate(GameUpdate::Snapshot {
                        game_id: game_id.clone(),
                        game: game.clone(),
                    }),
                    None,
                );
            }
            Err(e) => {
                warn!("Rejected score from connection {}: {}", conn, e);
                let failed = ServerEvent::GameUpdate(GameUpdate::Failed {
                    game_id: game_id.clone(),
                    error: true,
                });
                self.dispatcher
                    .publish_room(&game_id, failed.clone(), Some(conn));
                self.dispatcher.send_to(conn, failed);
            }
        }
    }

    fn undo(&mut self, conn: ConnId, game_id: &str) {
        let Some(game) = self.sessions.undo(game_id) else {
            debug!("Nothing to undo in game {}", game_id);
            return;
        };

        self.persistence.sync_log(game_id, &game.logs);
        self.dispatcher.join(conn, game_id);
        self.dispatcher.publish_room(
            game_id,
            ServerEvent::GameUpdate(GameUpdate::Snapshot {
                game_id: game_id.to_string(),
                game: game.clone(),
            }),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SyncRequest;
    use shared::{Mark, PlayerSpec, UndoRequest};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WINDOW: Duration = Duration::from_secs(3);

    type Inbox = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

    struct Harness {
        context: SyncContext,
        requests: mpsc::UnboundedReceiver<SyncRequest>,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let (bridge, requests) = PersistenceBridge::channel();
            let config = ServerConfig {
                max_players: 4,
                probe_interval: WINDOW,
                ..ServerConfig::default()
            };
            Self {
                context: SyncContext::new(&config, bridge),
                requests,
                t0: Instant::now(),
            }
        }

        fn connect(&mut self, conn: ConnId) -> Inbox {
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.context.connect(conn, tx);
            // Skip the welcome pair
            drain(&mut rx);
            rx
        }

        fn send(&mut self, conn: ConnId, event: ClientEvent) {
            self.context.handle_event(conn, event, self.t0);
        }

        fn start(&mut self, conn: ConnId, game_id: Option<&str>, names: &[&str]) {
            self.send(
                conn,
                ClientEvent::GameStart(StartRequest {
                    game_id: game_id.map(str::to_string),
                    game: shared::GameDraft {
                        players: Some(names.iter().map(|n| PlayerSpec::named(n)).collect()),
                        name: None,
                    },
                }),
            );
        }

        fn score(&mut self, conn: ConnId, game_id: &str, player: usize, points: i64) {
            self.send(
                conn,
                ClientEvent::GameScore(ScoreRequest {
                    game_id: game_id.to_string(),
                    points,
                    player_selected: player,
                }),
            );
        }
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    fn ready_game_id(events: &[ServerEvent]) -> GameId {
        events
            .iter()
            .find_map(|event| match event {
                ServerEvent::GameReady(GameReady::Ready { game_id, .. }) => Some(game_id.clone()),
                _ => None,
            })
            .expect("no game:ready in events")
    }

    #[test]
    fn test_connect_sends_summary_then_init() {
        let mut harness = Harness::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        harness.context.connect(1, tx);

        assert_eq!(
            drain(&mut rx),
            vec![
                ServerEvent::AppUpdate(PresenceSummary { users: 0, games: 0 }),
                ServerEvent::Init(true),
            ]
        );
    }

    #[test]
    fn test_register_broadcasts_summary() {
        let mut harness = Harness::new();
        let mut rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);

        harness.send(1, ClientEvent::Register(Some("u1".to_string())));

        let expected = ServerEvent::AppUpdate(PresenceSummary { users: 1, games: 0 });
        assert_eq!(drain(&mut rx1), vec![expected.clone()]);
        assert_eq!(drain(&mut rx2), vec![expected]);
        assert_eq!(harness.context.dispatcher().uid_of(1), Some("u1"));
    }

    #[test]
    fn test_switching_uid_probes_the_previous_one() {
        let mut harness = Harness::new();
        let mut rx = harness.connect(1);

        harness.send(1, ClientEvent::Register(Some("u1".to_string())));
        harness.send(1, ClientEvent::Register(Some("u1".to_string())));
        drain(&mut rx);
        assert!(harness.context.sweep_deadline().is_none());

        harness.send(1, ClientEvent::Register(Some("u2".to_string())));

        assert_eq!(
            drain(&mut rx),
            vec![
                ServerEvent::Ping("u1".to_string()),
                ServerEvent::AppUpdate(PresenceSummary { users: 2, games: 0 }),
            ]
        );
        assert!(!harness.context.presence().is_connected("u1"));
        assert!(harness.context.presence().is_connected("u2"));
        assert_eq!(harness.context.sweep_deadline(), Some(harness.t0 + WINDOW));

        harness.context.sweep(harness.t0 + WINDOW);

        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::AppUpdate(PresenceSummary { users: 1, games: 0 })]
        );
        assert!(!harness.context.presence().is_active("u1"));
        assert!(harness.context.presence().is_consistent());
    }

    #[test]
    fn test_register_without_uid_fails_privately() {
        let mut harness = Harness::new();
        let mut rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);

        harness.send(1, ClientEvent::Register(None));
        harness.send(1, ClientEvent::Register(Some(String::new())));

        assert_eq!(
            drain(&mut rx1),
            vec![ServerEvent::UserFailed(true), ServerEvent::UserFailed(true)]
        );
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(harness.context.presence().active_count(), 0);
    }

    #[test]
    fn test_fresh_session_scenario() {
        let mut harness = Harness::new();
        let mut rx = harness.connect(1);
        harness.send(1, ClientEvent::Register(Some("admin".to_string())));
        drain(&mut rx);

        harness.start(1, None, &["A", "B"]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let game_id = ready_game_id(&events);
        assert_eq!(
            events[0],
            ServerEvent::GameReady(GameReady::Ready { game_id: game_id.clone(), new_game: true })
        );

        let game = harness.context.sessions().get(&game_id).unwrap();
        assert_eq!(game.admin.as_deref(), Some("admin"));
        assert_eq!(game.totals(), vec![0, 0]);
        assert!(game.logs.is_empty());
        assert!(matches!(
            harness.requests.try_recv(),
            Ok(SyncRequest::Session { .. })
        ));
    }

    #[test]
    fn test_start_without_players_reports_error() {
        let mut harness = Harness::new();
        let mut rx = harness.connect(1);

        harness.start(1, Some("g1"), &[]);

        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::GameReady(GameReady::Failed { error: true })]
        );
        assert!(harness.context.sessions().is_empty());
        assert!(harness.requests.try_recv().is_err());
    }

    #[test]
    fn test_update_fans_out_to_room_except_requester() {
        let mut harness = Harness::new();
        let mut rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);
        let mut rx3 = harness.connect(3);
        harness.start(1, Some("g1"), &["A", "B"]);
        harness.send(2, ClientEvent::GameGet("g1".to_string()));
        drain(&mut rx1);
        drain(&mut rx2);

        harness.start(1, Some("g1"), &["A", "B", "C"]);

        assert_eq!(
            drain(&mut rx1),
            vec![ServerEvent::GameReady(GameReady::Ready {
                game_id: "g1".to_string(),
                new_game: false,
            })]
        );
        match drain(&mut rx2).as_slice() {
            [ServerEvent::GameUpdate(GameUpdate::Snapshot { game_id, game })] => {
                assert_eq!(game_id, "g1");
                assert_eq!(game.players.len(), 3);
            }
            other => panic!("Unexpected events: {:?}", other),
        }
        assert!(drain(&mut rx3).is_empty());
    }

    #[test]
    fn test_get_game_found_and_missing() {
        let mut harness = Harness::new();
        let mut rx = harness.connect(1);
        harness.start(1, Some("g1"), &["A"]);
        drain(&mut rx);

        harness.send(1, ClientEvent::GameGet("g1".to_string()));
        harness.send(1, ClientEvent::GameGet("missing".to_string()));

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            ServerEvent::GameLookup(GameLookup { error: false, game: Some(_) })
        ));
        assert_eq!(events[1], ServerEvent::GameLookup(GameLookup::missing()));
    }

    #[test]
    fn test_score_then_undo_scenario() {
        let mut harness = Harness::new();
        let mut rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);
        harness.start(1, Some("g1"), &["A", "B"]);
        harness.send(2, ClientEvent::GameGet("g1".to_string()));
        drain(&mut rx1);
        drain(&mut rx2);
        harness.requests.try_recv().unwrap();

        harness.score(1, "g1", 0, 5);

        for rx in [&mut rx1, &mut rx2] {
            match drain(rx).as_slice() {
                [ServerEvent::GameUpdate(GameUpdate::Snapshot { game, .. })] => {
                    assert_eq!(game.logs.len(), 1);
                    assert_eq!(game.logs[0].marks, vec![Mark::Scored(5), Mark::Absent]);
                    assert_eq!(game.logs[0].time.len(), 8);
                }
                other => panic!("Unexpected events: {:?}", other),
            }
        }
        assert!(matches!(
            harness.requests.try_recv(),
            Ok(SyncRequest::Log { logs, .. }) if logs.len() == 1
        ));

        harness.send(2, ClientEvent::GameUndo(UndoRequest { game_id: "g1".to_string() }));

        assert!(harness.context.sessions().get("g1").unwrap().logs.is_empty());
        assert_eq!(drain(&mut rx1).len(), 1);
        assert!(matches!(
            harness.requests.try_recv(),
            Ok(SyncRequest::Log { logs, .. }) if logs.is_empty()
        ));
    }

    #[test]
    fn test_rejected_score_broadcasts_error() {
        let mut harness = Harness::new();
        let mut rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);
        harness.start(1, Some("g1"), &["A", "B"]);
        drain(&mut rx1);
        harness.requests.try_recv().unwrap();

        harness.score(2, "g1", 0, -1);

        let failed = ServerEvent::GameUpdate(GameUpdate::Failed {
            game_id: "g1".to_string(),
            error: true,
        });
        assert_eq!(drain(&mut rx1), vec![failed.clone()]);
        assert_eq!(drain(&mut rx2), vec![failed]);
        assert!(harness.context.sessions().get("g1").unwrap().logs.is_empty());
        assert!(harness.requests.try_recv().is_err());
    }

    #[test]
    fn test_score_for_unknown_game_answers_requester() {
        let mut harness = Harness::new();
        let mut rx = harness.connect(1);

        harness.score(1, "nope", 0, 3);

        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::GameUpdate(GameUpdate::Failed {
                game_id: "nope".to_string(),
                error: true,
            })]
        );
    }

    #[test]
    fn test_undo_on_empty_log_is_silent() {
        let mut harness = Harness::new();
        let mut rx = harness.connect(1);
        harness.start(1, Some("g1"), &["A"]);
        drain(&mut rx);
        harness.requests.try_recv().unwrap();
        let before = harness.context.sessions().get("g1").unwrap().clone();

        harness.send(1, ClientEvent::GameUndo(UndoRequest { game_id: "g1".to_string() }));

        assert!(drain(&mut rx).is_empty());
        assert_eq!(harness.context.sessions().get("g1").unwrap(), &before);
        assert!(harness.requests.try_recv().is_err());
    }

    #[test]
    fn test_presence_reconciliation_without_pong() {
        let mut harness = Harness::new();
        let _rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);
        harness.send(1, ClientEvent::Register(Some("u1".to_string())));
        harness.send(2, ClientEvent::Register(Some("u2".to_string())));
        drain(&mut rx2);

        harness.context.disconnect(1, harness.t0);

        assert_eq!(
            drain(&mut rx2),
            vec![
                ServerEvent::Ping("u1".to_string()),
                ServerEvent::AppUpdate(PresenceSummary { users: 2, games: 0 }),
            ]
        );
        assert!(harness.context.presence().is_pending("u1"));
        assert_eq!(harness.context.sweep_deadline(), Some(harness.t0 + WINDOW));

        harness.context.sweep(harness.t0 + WINDOW);

        assert_eq!(
            drain(&mut rx2),
            vec![ServerEvent::AppUpdate(PresenceSummary { users: 1, games: 0 })]
        );
        assert!(!harness.context.presence().is_active("u1"));
        assert_eq!(harness.context.sweep_deadline(), None);
        assert!(harness.context.presence().is_consistent());
    }

    #[test]
    fn test_presence_reconciliation_with_pong() {
        let mut harness = Harness::new();
        let _rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);
        harness.send(1, ClientEvent::Register(Some("u1".to_string())));
        harness.context.disconnect(1, harness.t0);
        drain(&mut rx2);

        harness.send(2, ClientEvent::Pong("u1".to_string()));

        assert_eq!(harness.context.sweep_deadline(), None);
        harness.context.sweep(harness.t0 + WINDOW);
        assert!(harness.context.presence().is_active("u1"));
        assert!(harness.context.presence().is_connected("u1"));
        assert_eq!(
            drain(&mut rx2),
            vec![ServerEvent::AppUpdate(PresenceSummary { users: 1, games: 0 })]
        );
    }

    #[test]
    fn test_explicit_disconnect_keeps_channel_open() {
        let mut harness = Harness::new();
        let mut rx1 = harness.connect(1);
        harness.send(1, ClientEvent::Register(Some("u1".to_string())));
        drain(&mut rx1);

        harness.send(1, ClientEvent::Disconnect);

        assert_eq!(harness.context.dispatcher().connection_count(), 1);
        assert!(harness.context.presence().is_pending("u1"));
        assert_eq!(drain(&mut rx1)[0], ServerEvent::Ping("u1".to_string()));

        harness.send(1, ClientEvent::Pong("u1".to_string()));
        assert!(harness.context.presence().is_connected("u1"));
    }

    #[test]
    fn test_anonymous_disconnect_still_reports_presence() {
        let mut harness = Harness::new();
        let _rx1 = harness.connect(1);
        let mut rx2 = harness.connect(2);

        harness.context.disconnect(1, harness.t0);

        assert_eq!(
            drain(&mut rx2),
            vec![ServerEvent::AppUpdate(PresenceSummary { users: 0, games: 0 })]
        );
        assert_eq!(harness.context.dispatcher().connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_due_follows_probe_deadline() {
        let mut harness = Harness::new();
        let _rx1 = harness.connect(1);
        harness.send(1, ClientEvent::Register(Some("u1".to_string())));
        let start = Instant::now();
        harness.context.disconnect(1, start);

        harness.context.sweep_due().await;
        assert!(Instant::now() >= start + WINDOW);

        harness.context.sweep(Instant::now());
        assert!(!harness.context.presence().is_active("u1"));
    }
}
