//! User presence tracking and disconnect reconciliation
//!
//! This module decides which users are still part of the system when the
//! underlying transport drops connections without warning. It handles:
//! - Registration of user ids announced by clients
//! - Provisional disconnects when a channel closes
//! - Liveness probes and their `pong` answers
//! - Confirmed removal once a probe window passes unanswered
//!
//! A closed channel alone never evicts a user. Page reloads and short
//! network losses reconnect within the probe window and keep their place in
//! running games.

use crate::error::SyncError;
use log::{debug, info};
use shared::Uid;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

/// Result of a single reconciliation sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Users that were just flagged and need a `ping`
    pub probed: Vec<Uid>,
    /// Users whose probe went unanswered and who are now gone
    pub evicted: Vec<Uid>,
}

/// Tracks the `active`, `connected` and `disconnected` user sets
///
/// Both `connected` and `disconnected` are always subsets of `active`.
/// Pending probes remember when they were sent so that a sweep triggered
/// right after a probe cannot evict a user before they had a chance to
/// answer.
pub struct PresenceTracker {
    active: BTreeSet<Uid>,
    connected: BTreeSet<Uid>,
    /// Provisionally dropped users and the time their probe went out
    disconnected: BTreeMap<Uid, Instant>,
    probe_window: Duration,
}

impl PresenceTracker {
    pub fn new(probe_window: Duration) -> Self {
        Self {
            active: BTreeSet::new(),
            connected: BTreeSet::new(),
            disconnected: BTreeMap::new(),
            probe_window,
        }
    }

    /// Adds a user to the active and connected sets
    ///
    /// Idempotent. A user re-registering while a probe is pending is alive,
    /// so the probe is dropped. Returns true if the user was not active yet.
    pub fn register(&mut self, uid: &str) -> Result<bool, SyncError> {
        if uid.is_empty() {
            return Err(SyncError::EmptyUid);
        }

        if self.disconnected.remove(uid).is_some() {
            debug!("User {} re-registered while probed", uid);
        }
        self.connected.insert(uid.to_string());
        let fresh = self.active.insert(uid.to_string());
        if fresh {
            info!("User {} registered", uid);
        }

        Ok(fresh)
    }

    /// Removes a user from the connected set after their channel closed
    ///
    /// The user stays active until a sweep confirms they are gone.
    pub fn mark_disconnected(&mut self, uid: &str) -> bool {
        self.connected.remove(uid)
    }

    /// Answers a liveness probe
    ///
    /// Only users with a pending probe are affected; they move back to the
    /// connected set. Returns true if a pending probe was cleared.
    pub fn pong(&mut self, uid: &str) -> bool {
        if self.disconnected.remove(uid).is_none() {
            return false;
        }

        self.connected.insert(uid.to_string());
        info!("User {} answered probe", uid);
        true
    }

    /// Runs one reconciliation sweep
    ///
    /// Every active user without a live channel is either probed (first
    /// time seen missing) or evicted (probe older than the window).
    pub fn reconcile(&mut self, now: Instant) -> SweepOutcome {
        let missing: Vec<Uid> = self
            .active
            .iter()
            .filter(|uid| !self.connected.contains(*uid))
            .cloned()
            .collect();

        let mut outcome = SweepOutcome::default();

        for uid in missing {
            match self.disconnected.get(&uid) {
                Some(probed_at) => {
                    if now.saturating_duration_since(*probed_at) >= self.probe_window {
                        self.disconnected.remove(&uid);
                        self.active.remove(&uid);
                        info!("User {} evicted after unanswered probe", uid);
                        outcome.evicted.push(uid);
                    }
                }
                None => {
                    self.disconnected.insert(uid.clone(), now);
                    debug!("Probing user {}", uid);
                    outcome.probed.push(uid);
                }
            }
        }

        outcome
    }

    /// Earliest time at which a pending probe expires
    pub fn next_deadline(&self) -> Option<Instant> {
        self.disconnected
            .values()
            .min()
            .map(|probed_at| *probed_at + self.probe_window)
    }

    pub fn has_pending_probes(&self) -> bool {
        !self.disconnected.is_empty()
    }

    pub fn is_active(&self, uid: &str) -> bool {
        self.active.contains(uid)
    }

    pub fn is_connected(&self, uid: &str) -> bool {
        self.connected.contains(uid)
    }

    pub fn is_pending(&self, uid: &str) -> bool {
        self.disconnected.contains_key(uid)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Checks that the connected and pending sets are subsets of active
    pub fn is_consistent(&self) -> bool {
        self.connected.is_subset(&self.active)
            && self.disconnected.keys().all(|uid| self.active.contains(uid))
    }
}
