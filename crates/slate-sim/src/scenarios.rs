//! Lockstep multi-node simulation.
//!
//! Every node runs a real engine over an [`InMemoryMesh`]. The net advances
//! simulated time in fixed steps; after each step, outbound frames hop to
//! their target's inbound queue, so one step is also one network hop. Frames
//! can be dropped deterministically per target or randomly with a seeded
//! generator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slate_clock::ManualClock;
use slate_core::{ActionKind, CoordinationError, PeerId, UnixTime};
use slate_engine::config::EngineConfig;
use slate_engine::engine::{CoordinationEngine, EngineEvent};
use slate_transport::InMemoryMesh;

/// One simulated camera node.
pub struct SimNode {
    pub id: PeerId,
    pub engine: CoordinationEngine<ManualClock>,
    pub mesh: InMemoryMesh,
    /// Offset of this node's local wall clock from simulated true time.
    pub skew: f64,
    /// Engine events with the simulated true time they surfaced at.
    pub events: Vec<(f64, EngineEvent)>,
}

impl SimNode {
    /// Fired actions as (sim time, kind, target).
    pub fn due_actions(&self) -> Vec<(f64, ActionKind, UnixTime)> {
        self.events
            .iter()
            .filter_map(|(at, event)| match event {
                EngineEvent::ActionDue { kind, target } => Some((*at, *kind, *target)),
                _ => None,
            })
            .collect()
    }

    pub fn faults(&self) -> Vec<CoordinationError> {
        self.events
            .iter()
            .filter_map(|(_, event)| match event {
                EngineEvent::Fault(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn scheduled(&self) -> Option<(ActionKind, UnixTime)> {
        self.engine.scheduled()
    }
}

/// A mesh of nodes sharing one simulated timeline.
pub struct SimNet {
    pub nodes: Vec<SimNode>,
    /// Simulated true time.
    pub now: f64,
    /// Step length; also the one-way hop latency.
    pub step: f64,
    loss: f64,
    rng: StdRng,
    forced_drops: Vec<u32>,
    dropped: u64,
}

impl SimNet {
    /// `count` nodes named cam-0.., all freshly synced with zero offset.
    pub fn new(count: usize, start: f64) -> Self {
        let clocks = (0..count)
            .map(|_| ManualClock::synced(0.0, UnixTime::from_secs(start)))
            .collect();
        Self::with_clocks(clocks, start)
    }

    /// Nodes with caller-supplied clocks and no local skew.
    pub fn with_clocks(clocks: Vec<ManualClock>, start: f64) -> Self {
        let parts = clocks.into_iter().map(|c| (c, 0.0)).collect();
        Self::from_parts(parts, start)
    }

    /// Nodes whose local wall clocks run `skew` seconds off true time, each
    /// synced with the compensating offset. Corrected time agrees across the
    /// mesh even though local readings do not.
    pub fn with_skews(skews: &[f64], start: f64) -> Self {
        let parts = skews
            .iter()
            .map(|&skew| {
                let synced_at = UnixTime::from_secs(start + skew);
                (ManualClock::synced(-skew, synced_at), skew)
            })
            .collect();
        Self::from_parts(parts, start)
    }

    fn from_parts(parts: Vec<(ManualClock, f64)>, start: f64) -> Self {
        let ids: Vec<PeerId> = (0..parts.len())
            .map(|i| PeerId::from(format!("cam-{i}")))
            .collect();
        let nodes = parts
            .into_iter()
            .enumerate()
            .map(|(i, (clock, skew))| {
                let roster: Vec<PeerId> = ids
                    .iter()
                    .filter(|id| **id != ids[i])
                    .cloned()
                    .collect();
                SimNode {
                    id: ids[i].clone(),
                    engine: CoordinationEngine::new(
                        ids[i].clone(),
                        clock,
                        EngineConfig::default(),
                    ),
                    mesh: InMemoryMesh::with_peers(roster),
                    skew,
                    events: Vec::new(),
                }
            })
            .collect();
        let count = ids.len();
        Self {
            nodes,
            now: start,
            step: 0.05,
            loss: 0.0,
            rng: StdRng::seed_from_u64(7),
            forced_drops: vec![0; count],
            dropped: 0,
        }
    }

    /// Random loss applied to every routed frame.
    pub fn set_loss(&mut self, loss: f64, seed: u64) {
        self.loss = loss;
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Drop the next `count` frames addressed to node `index`, whatever
    /// they are.
    pub fn drop_next_to(&mut self, index: usize, count: u32) {
        self.forced_drops[index] += count;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Issue a coordination request on node `index` at the current time.
    pub fn request(&mut self, index: usize, kind: ActionKind) {
        let now = self.now;
        let node = &mut self.nodes[index];
        let local = UnixTime::from_secs(now + node.skew);
        let events = node.engine.request_action(&mut node.mesh, kind, local);
        node.events.extend(events.into_iter().map(|e| (now, e)));
        self.route_frames();
    }

    /// Advance one step: move time, tick every engine, deliver frames.
    pub fn tick_all(&mut self) {
        self.now += self.step;
        let now = self.now;
        for node in &mut self.nodes {
            let local = UnixTime::from_secs(now + node.skew);
            let events = node.engine.tick(&mut node.mesh, local);
            node.events.extend(events.into_iter().map(|e| (now, e)));
        }
        self.route_frames();
    }

    pub fn run_until(&mut self, deadline: f64) {
        while self.now < deadline {
            self.tick_all();
        }
    }

    fn route_frames(&mut self) {
        let ids: Vec<PeerId> = self.nodes.iter().map(|n| n.id.clone()).collect();
        let mut in_transit: Vec<(usize, PeerId, Vec<u8>)> = Vec::new();
        for i in 0..self.nodes.len() {
            for (target, bytes) in self.nodes[i].mesh.take_outbound() {
                let Some(j) = ids.iter().position(|id| *id == target) else {
                    continue;
                };
                if self.forced_drops[j] > 0 {
                    self.forced_drops[j] -= 1;
                    self.dropped += 1;
                    continue;
                }
                if self.loss > 0.0 && self.rng.gen::<f64>() < self.loss {
                    self.dropped += 1;
                    continue;
                }
                in_transit.push((j, ids[i].clone(), bytes));
            }
        }
        for (j, sender, bytes) in in_transit {
            self.nodes[j].mesh.enqueue_inbound(sender, bytes);
        }
    }
}
