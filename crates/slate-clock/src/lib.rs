//! Reference clock seam.
//!
//! The engine schedules actions in a reference-corrected timebase when one is
//! available. This crate defines the clock contract plus a hand-driven clock
//! for tests and a null clock for meshes without any reachable reference.

use std::time::Duration;

use slate_core::UnixTime;
use tracing::debug;

/// How long a successful sync stays fresh before a resync is wanted.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(3600);

/// External time-reference contract consumed by the coordination engine.
///
/// Implementations convert the caller's local wall-clock reading into the
/// reference timebase once synchronized. Resyncs run in the background:
/// `begin_resync` returns immediately and `resync_in_flight` reports
/// progress, so the engine can bound its wait and fall back to local time.
pub trait ReferenceClock {
    /// Reference-corrected reading of `local_now`, or `None` before the first
    /// successful sync.
    fn corrected(&self, local_now: UnixTime) -> Option<UnixTime>;
    /// Time since the last successful sync, or `None` if never synced.
    fn last_sync_age(&self, local_now: UnixTime) -> Option<Duration>;
    /// Starts a sync round-trip. Non-blocking; repeated calls while one is
    /// running are tolerated.
    fn begin_resync(&mut self, local_now: UnixTime);
    /// Whether a sync round-trip is still running.
    fn resync_in_flight(&self) -> bool;

    /// True if never synchronized or the last sync is older than the
    /// staleness window.
    fn needs_resync(&self, local_now: UnixTime) -> bool {
        match self.last_sync_age(local_now) {
            None => true,
            Some(age) => age > STALENESS_WINDOW,
        }
    }
}

/// Clock for meshes with no reachable reference: never synchronizes, so the
/// engine always takes the local-time fallback path.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClock;

impl ReferenceClock for NullClock {
    fn corrected(&self, _local_now: UnixTime) -> Option<UnixTime> {
        None
    }

    fn last_sync_age(&self, _local_now: UnixTime) -> Option<Duration> {
        None
    }

    fn begin_resync(&mut self, _local_now: UnixTime) {
        debug!("no time reference configured, resync is a no-op");
    }

    fn resync_in_flight(&self) -> bool {
        false
    }
}

/// Hand-driven clock for tests: offset, sync instant, and resync progress are
/// all set explicitly by the caller.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    offset_secs: Option<f64>,
    last_sync: Option<UnixTime>,
    in_flight: bool,
}

impl ManualClock {
    /// A clock that has never synchronized.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that already synchronized at `synced_at` with the given offset
    /// (corrected = local + offset).
    pub fn synced(offset_secs: f64, synced_at: UnixTime) -> Self {
        Self {
            offset_secs: Some(offset_secs),
            last_sync: Some(synced_at),
            in_flight: false,
        }
    }

    /// Resolves an in-flight resync as successful.
    pub fn complete_resync(&mut self, offset_secs: f64, at: UnixTime) {
        self.offset_secs = Some(offset_secs);
        self.last_sync = Some(at);
        self.in_flight = false;
    }

    /// Resolves an in-flight resync as failed; any previous sync state is
    /// kept.
    pub fn fail_resync(&mut self) {
        self.in_flight = false;
    }
}

impl ReferenceClock for ManualClock {
    fn corrected(&self, local_now: UnixTime) -> Option<UnixTime> {
        self.offset_secs
            .map(|offset| UnixTime::from_secs(local_now.as_secs() + offset))
    }

    fn last_sync_age(&self, local_now: UnixTime) -> Option<Duration> {
        self.last_sync.map(|at| local_now.saturating_since(at))
    }

    fn begin_resync(&mut self, _local_now: UnixTime) {
        debug!("manual clock resync started");
        self.in_flight = true;
    }

    fn resync_in_flight(&self) -> bool {
        self.in_flight
    }
}
