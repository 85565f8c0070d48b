//! Round-trip probing of the connected roster.
//!
//! A round pings every peer in parallel and completes after exactly one
//! outcome per ping, ack or timeout. Timeouts leave any earlier sample for
//! that peer in place, so estimates degrade slowly instead of vanishing.

use std::collections::HashMap;
use std::time::Duration;

use slate_core::{MessageId, PeerId, UnixTime};
use slate_proto::SyncMessage;
use slate_transport::MeshTransport;
use tracing::debug;

use crate::link::ReliableLink;

/// One measured round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSample {
    pub rtt: Duration,
    /// When the sample was taken.
    pub at: UnixTime,
}

#[derive(Debug)]
struct Probe {
    peer: PeerId,
    sent_at: UnixTime,
}

#[derive(Debug, Default)]
struct ProbeRound {
    outstanding: HashMap<MessageId, Probe>,
}

/// Latency estimates per peer plus at most one probe round in flight.
#[derive(Debug, Default)]
pub struct LatencyProber {
    samples: HashMap<PeerId, RttSample>,
    round: Option<ProbeRound>,
}

impl LatencyProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a round against `peers`, one ping each. An empty roster yields
    /// an already-complete round. Starting over an unfinished round abandons
    /// the old one; its stragglers resolve as unknown ids.
    ///
    /// Samples for peers outside `peers` are dropped so departed peers stop
    /// influencing the delay estimate.
    pub fn begin_round<T: MeshTransport>(
        &mut self,
        link: &mut ReliableLink,
        transport: &mut T,
        local: &PeerId,
        peers: &[PeerId],
        now: UnixTime,
    ) {
        self.samples.retain(|peer, _| peers.contains(peer));
        let mut round = ProbeRound::default();
        for peer in peers {
            let ping = SyncMessage::ping(local.clone(), now);
            if let Some(id) = link.send_with_ack(transport, peer, ping, now) {
                round.outstanding.insert(
                    id,
                    Probe {
                        peer: peer.clone(),
                        sent_at: now,
                    },
                );
            }
        }
        debug!(peers = peers.len(), "latency probe round started");
        self.round = Some(round);
    }

    /// Record the ack for a probe; returns false for ids that are not ours.
    pub fn on_ack(&mut self, id: &MessageId, now: UnixTime) -> bool {
        let Some(round) = self.round.as_mut() else {
            return false;
        };
        let Some(probe) = round.outstanding.remove(id) else {
            return false;
        };
        let rtt = now.saturating_since(probe.sent_at);
        debug!(peer = %probe.peer, rtt_ms = rtt.as_millis() as u64, "probe answered");
        self.samples.insert(probe.peer, RttSample { rtt, at: now });
        true
    }

    /// Record a probe timeout; the peer's previous sample, if any, stands.
    pub fn on_fail(&mut self, id: &MessageId) -> Option<PeerId> {
        let round = self.round.as_mut()?;
        let probe = round.outstanding.remove(id)?;
        debug!(peer = %probe.peer, "probe timed out, keeping previous sample");
        Some(probe.peer)
    }

    pub fn round_in_flight(&self) -> bool {
        self.round.is_some()
    }

    /// True once every ping in the round has resolved one way or the other.
    pub fn round_complete(&self) -> bool {
        self.round
            .as_ref()
            .is_some_and(|r| r.outstanding.is_empty())
    }

    /// Clear a completed round. Returns false if the round is still open.
    pub fn finish_round(&mut self) -> bool {
        if self.round_complete() {
            self.round = None;
            true
        } else {
            false
        }
    }

    /// Snapshot of all current round-trip estimates.
    pub fn rtts(&self) -> Vec<Duration> {
        self.samples.values().map(|s| s.rtt).collect()
    }

    pub fn sample(&self, peer: &PeerId) -> Option<&RttSample> {
        self.samples.get(peer)
    }

    pub fn samples(&self) -> &HashMap<PeerId, RttSample> {
        &self.samples
    }
}
