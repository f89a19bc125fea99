//! Event fanout to connected channels
//!
//! Every open channel belongs to the lobby, which receives presence
//! summaries and liveness probes. Session updates only go to the room of
//! that session: the channels that created, fetched or scored it. Delivery
//! is best effort; a channel whose writer has gone away is skipped.

use log::debug;
use shared::{GameId, ServerEvent, Uid};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Server-assigned identifier of one open channel
pub type ConnId = u64;

/// Queue feeding a channel's writer task
pub type Outbox = mpsc::UnboundedSender<Arc<ServerEvent>>;

struct Connection {
    outbox: Outbox,
    uid: Option<Uid>,
    rooms: BTreeSet<GameId>,
}

#[derive(Default)]
pub struct Dispatcher {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<GameId, BTreeSet<ConnId>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, conn: ConnId, outbox: Outbox) {
        self.connections.insert(
            conn,
            Connection {
                outbox,
                uid: None,
                rooms: BTreeSet::new(),
            },
        );
    }

    /// Forgets a channel and its room memberships
    ///
    /// Returns the uid the channel registered with, if any. Dropping the
    /// outbox lets the channel's writer task finish.
    pub fn detach(&mut self, conn: ConnId) -> Option<Uid> {
        let connection = self.connections.remove(&conn)?;
        for game_id in &connection.rooms {
            if let Some(members) = self.rooms.get_mut(game_id) {
                members.remove(&conn);
                if members.is_empty() {
                    self.rooms.remove(game_id);
                }
            }
        }
        connection.uid
    }

    /// Records the uid a channel registered with, returning the one it
    /// replaced
    pub fn bind_uid(&mut self, conn: ConnId, uid: &str) -> Option<Uid> {
        let connection = self.connections.get_mut(&conn)?;
        connection.uid.replace(uid.to_string())
    }

    pub fn uid_of(&self, conn: ConnId) -> Option<&str> {
        self.connections.get(&conn)?.uid.as_deref()
    }

    /// Subscribes a channel to updates of one session
    pub fn join(&mut self, conn: ConnId, game_id: &str) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.rooms.insert(game_id.to_string()) {
            self.rooms
                .entry(game_id.to_string())
                .or_default()
                .insert(conn);
        }
    }

    /// Sends an event to one channel
    pub fn send_to(&self, conn: ConnId, event: ServerEvent) -> bool {
        match self.connections.get(&conn) {
            Some(connection) => deliver(conn, &connection.outbox, Arc::new(event)),
            None => false,
        }
    }

    /// Sends an event to every open channel, returning the delivery count
    pub fn publish_lobby(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        self.connections
            .iter()
            .filter(|(conn, connection)| deliver(**conn, &connection.outbox, Arc::clone(&event)))
            .count()
    }

    /// Sends an event to every member of a session's room
    pub fn publish_room(&self, game_id: &str, event: ServerEvent, exclude: Option<ConnId>) -> usize {
        let Some(members) = self.rooms.get(game_id) else {
            return 0;
        };

        let event = Arc::new(event);
        members
            .iter()
            .filter(|conn| Some(**conn) != exclude)
            .filter_map(|conn| self.connections.get(conn).map(|c| (*conn, c)))
            .filter(|(conn, connection)| deliver(*conn, &connection.outbox, Arc::clone(&event)))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_size(&self, game_id: &str) -> usize {
        self.rooms.get(game_id).map_or(0, BTreeSet::len)
    }
}

fn deliver(conn: ConnId, outbox: &Outbox, event: Arc<ServerEvent>) -> bool {
    let name = event.name();
    match outbox.send(event) {
        Ok(()) => true,
        Err(_) => {
            debug!("Dropped {} for closed connection {}", name, conn);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PresenceSummary;

    fn attach(dispatcher: &mut Dispatcher, conn: ConnId) -> mpsc::UnboundedReceiver<Arc<ServerEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.attach(conn, tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<ServerEvent>>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    #[test]
    fn test_lobby_reaches_every_connection() {
        let mut dispatcher = Dispatcher::new();
        let mut rx1 = attach(&mut dispatcher, 1);
        let mut rx2 = attach(&mut dispatcher, 2);

        let summary = ServerEvent::AppUpdate(PresenceSummary { users: 2, games: 0 });
        assert_eq!(dispatcher.publish_lobby(summary.clone()), 2);

        assert_eq!(drain(&mut rx1), vec![summary.clone()]);
        assert_eq!(drain(&mut rx2), vec![summary]);
    }

    #[test]
    fn test_room_scoping_and_exclusion() {
        let mut dispatcher = Dispatcher::new();
        let mut rx1 = attach(&mut dispatcher, 1);
        let mut rx2 = attach(&mut dispatcher, 2);
        let mut rx3 = attach(&mut dispatcher, 3);
        dispatcher.join(1, "g1");
        dispatcher.join(2, "g1");
        dispatcher.join(3, "g2");

        let ping = ServerEvent::Ping("x".to_string());
        assert_eq!(dispatcher.publish_room("g1", ping.clone(), Some(1)), 1);

        assert!(drain(&mut rx1).is_empty());
        assert_eq!(drain(&mut rx2), vec![ping]);
        assert!(drain(&mut rx3).is_empty());
        assert_eq!(dispatcher.publish_room("unknown", ServerEvent::Init(true), None), 0);
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut dispatcher = Dispatcher::new();
        let _rx = attach(&mut dispatcher, 1);

        dispatcher.join(1, "g1");
        dispatcher.join(1, "g1");
        dispatcher.join(99, "g1");

        assert_eq!(dispatcher.room_size("g1"), 1);
    }

    #[test]
    fn test_detach_returns_uid_and_leaves_rooms() {
        let mut dispatcher = Dispatcher::new();
        let _rx = attach(&mut dispatcher, 1);
        dispatcher.bind_uid(1, "u1");
        dispatcher.join(1, "g1");

        assert_eq!(dispatcher.uid_of(1), Some("u1"));
        assert_eq!(dispatcher.bind_uid(1, "u2"), Some("u1".to_string()));
        assert_eq!(dispatcher.bind_uid(99, "u3"), None);
        assert_eq!(dispatcher.detach(1), Some("u2".to_string()));
        assert_eq!(dispatcher.room_size("g1"), 0);
        assert_eq!(dispatcher.connection_count(), 0);
        assert_eq!(dispatcher.detach(1), None);
    }

    #[test]
    fn test_closed_outbox_is_skipped() {
        let mut dispatcher = Dispatcher::new();
        let rx1 = attach(&mut dispatcher, 1);
        let mut rx2 = attach(&mut dispatcher, 2);
        drop(rx1);

        assert_eq!(dispatcher.publish_lobby(ServerEvent::Init(true)), 1);
        assert!(!dispatcher.send_to(1, ServerEvent::Init(true)));
        assert_eq!(drain(&mut rx2).len(), 1);
    }
}
