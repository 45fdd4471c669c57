//! Debounced action primitive.
//!
//! A `DebouncedAction` is a single rearmable deadline. Every `trigger()`
//! supersedes the previous one; the action fires once the quiet period has
//! elapsed with no further triggers. The owner polls it from its event loop:
//!
//! ```text
//! trigger() ── trigger() ──── trigger() ─────────[delay]──► fire()
//!    └─ superseded ─┘  └─ superseded ─┘
//! ```
//!
//! Deadlines use `tokio::time::Instant` so tests can drive them with a
//! paused clock.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct DebouncedAction {
    delay: Duration,
    deadline: Option<Instant>,
}

impl DebouncedAction {
    pub fn new(delay: Duration) -> Self {
        Self { delay, deadline: None }
    }

    /// Arm (or re-arm) the action relative to `now`.
    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    /// Disarm without firing. Returns whether an action was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Consume the pending action if its quiet period has elapsed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(due) if now >= due => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
