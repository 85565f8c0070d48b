//! Two-phase wait for a target instant.
//!
//! The owner loop sleeps coarsely until the fine window opens, then polls
//! at a short interval so the action fires just after its target and never
//! before it.

use std::time::Duration;

use slate_core::{ActionKind, UnixTime};
use tracing::debug;

/// Width of the fine-grained polling window before the target.
pub const FINE_WAIT_WINDOW: Duration = Duration::from_millis(500);

/// Hint for the owner loop about how long it may sleep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wake {
    /// Nothing armed; sleep at the coarse cadence.
    Idle,
    /// Sleep until roughly this instant, then ask again.
    SleepUntil(UnixTime),
    /// Inside the fine window; poll at the fine cadence.
    FineTick,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    kind: ActionKind,
    target: UnixTime,
}

/// Holds at most one armed action; arming again replaces the previous one.
#[derive(Debug, Default)]
pub struct ActionScheduler {
    armed: Option<Armed>,
}

impl ActionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire at `target`. Any previously armed action is
    /// discarded, fired or not.
    pub fn schedule(&mut self, kind: ActionKind, target: UnixTime) {
        if let Some(prev) = self.armed.replace(Armed { kind, target }) {
            debug!(
                replaced = ?prev.kind,
                with = ?kind,
                target = target.as_secs(),
                "superseding armed action"
            );
        }
    }

    /// Disarm without firing.
    pub fn cancel(&mut self) {
        self.armed = None;
    }

    pub fn scheduled(&self) -> Option<(ActionKind, UnixTime)> {
        self.armed.map(|a| (a.kind, a.target))
    }

    /// Fire once `now` has reached the target. Returns the fired action and
    /// its target; the scheduler disarms itself.
    pub fn poll(&mut self, now: UnixTime) -> Option<(ActionKind, UnixTime)> {
        match self.armed {
            Some(a) if now >= a.target => {
                self.armed = None;
                Some((a.kind, a.target))
            }
            _ => None,
        }
    }

    /// How the owner should wait before the next [`ActionScheduler::poll`].
    pub fn next_wake(&self, now: UnixTime) -> Wake {
        match self.armed {
            None => Wake::Idle,
            Some(a) => {
                let fine_open = a.target - FINE_WAIT_WINDOW;
                if now >= fine_open {
                    Wake::FineTick
                } else {
                    Wake::SleepUntil(fine_open)
                }
            }
        }
    }
}
