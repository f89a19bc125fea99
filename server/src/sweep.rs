//! Deferred reconciliation sweep scheduling
//!
//! A disconnect triggers an immediate sweep. Any probe it sends needs a
//! follow-up sweep once the probe window has passed. Requests for follow-up
//! sweeps coalesce onto the earliest requested deadline so that a burst of
//! disconnects never stacks up timers.

use std::future;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Default)]
pub struct SweepTimer {
    deadline: Option<Instant>,
}

impl SweepTimer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arms the timer for `at`, keeping an already armed earlier deadline
    ///
    /// Returns true if the effective deadline changed.
    pub fn schedule(&mut self, at: Instant) -> bool {
        match self.deadline {
            Some(current) if current <= at => false,
            _ => {
                self.deadline = Some(at);
                true
            }
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves once the armed deadline is reached; never resolves while
    /// disarmed. Safe to drop and recreate inside `select!`.
    pub async fn wait(&self) {
        match self.deadline {
            Some(at) => sleep_until(at).await,
            None => future::pending::<()>().await,
        }
    }
}
