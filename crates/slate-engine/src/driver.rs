//! Blocking drive loop for an engine and its transport.
//!
//! The loop alternates drive steps with waits chosen from the engine's wake
//! hint. Coarse waits are bounded by the tick interval so inbound traffic
//! and ack deadlines stay live even while an action is far out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use slate_clock::ReferenceClock;
use slate_core::UnixTime;
use slate_transport::MeshTransport;

use crate::engine::{CoordinationEngine, EngineEvent};
use crate::schedule::Wake;

/// How the drive loop spends time between steps.
pub trait WaitStrategy {
    /// Wait roughly `duration` while far from any target.
    fn coarse_wait(&mut self, duration: Duration);
    /// One short wait inside the fine window before a target.
    fn fine_tick(&mut self);
}

/// Thread-blocking waits via [`std::thread::sleep`].
#[derive(Debug, Clone)]
pub struct ThreadWait {
    fine_tick: Duration,
}

impl ThreadWait {
    pub fn new(fine_tick: Duration) -> Self {
        Self { fine_tick }
    }
}

impl Default for ThreadWait {
    fn default() -> Self {
        Self::new(Duration::from_millis(5))
    }
}

impl WaitStrategy for ThreadWait {
    fn coarse_wait(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn fine_tick(&mut self) {
        std::thread::sleep(self.fine_tick);
    }
}

/// Drive `engine` against the wall clock until `shutdown` flips. Every
/// event is handed to `on_event` in order.
pub fn run<C, T, W, F>(
    engine: &mut CoordinationEngine<C>,
    transport: &mut T,
    wait: &mut W,
    shutdown: &AtomicBool,
    on_event: F,
) where
    C: ReferenceClock,
    T: MeshTransport,
    W: WaitStrategy,
    F: FnMut(EngineEvent),
{
    run_with_now(engine, transport, wait, shutdown, UnixTime::now, on_event);
}

/// [`run`] with an injectable time source.
pub fn run_with_now<C, T, W, N, F>(
    engine: &mut CoordinationEngine<C>,
    transport: &mut T,
    wait: &mut W,
    shutdown: &AtomicBool,
    mut now_fn: N,
    mut on_event: F,
) where
    C: ReferenceClock,
    T: MeshTransport,
    W: WaitStrategy,
    N: FnMut() -> UnixTime,
    F: FnMut(EngineEvent),
{
    while !shutdown.load(Ordering::Relaxed) {
        let now = now_fn();
        for event in engine.tick(transport, now) {
            on_event(event);
        }
        let tick_interval = engine.config().tick_interval;
        match engine.next_wake(now) {
            Wake::FineTick => wait.fine_tick(),
            Wake::SleepUntil(at) => {
                let until = at.saturating_since(now).min(tick_interval);
                wait.coarse_wait(until);
            }
            Wake::Idle => wait.coarse_wait(tick_interval),
        }
    }
}
