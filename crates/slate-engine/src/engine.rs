//! The coordination state machine.
//!
//! One engine runs per node. It owns no sockets and never sleeps; the owner
//! loop feeds it inbound frames and wall-clock time through
//! [`CoordinationEngine::tick`] and acts on the returned events. A
//! coordination request moves through clock sync, a latency probe round, and
//! delay computation before the action is armed locally and announced to
//! every connected peer.

use std::collections::HashMap;

use slate_clock::ReferenceClock;
use slate_core::{ActionKind, CoordinationError, MessageId, PeerId, UnixTime};
use slate_proto::{MessageKind, SyncMessage};
use slate_transport::MeshTransport;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::delay::compute_delay;
use crate::link::{LinkEvent, LinkStats, ReliableLink};
use crate::probe::{LatencyProber, RttSample};
use crate::schedule::{ActionScheduler, Wake};

/// Where an armed action came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOrigin {
    /// This node computed the target and announced it.
    Local,
    /// The named peer announced the target.
    Peer(PeerId),
}

/// Observable engine output, returned from each drive step.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// An action was armed for the given target instant.
    ActionScheduled {
        kind: ActionKind,
        target: UnixTime,
        origin: ScheduleOrigin,
    },
    /// An armed action reached its target; the owner performs it now.
    ActionDue { kind: ActionKind, target: UnixTime },
    /// A recovered failure worth surfacing to diagnostics.
    Fault(CoordinationError),
    /// A peer answered our time-sync request with its reported time.
    TimeSyncReply { peer: PeerId, reported: UnixTime },
}

/// Engine counters, readable at any time.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    /// Coordination requests accepted.
    pub requests: u64,
    /// Actions armed from a locally computed target.
    pub local_schedules: u64,
    /// Actions armed from a peer announcement.
    pub peer_schedules: u64,
    /// Armed actions that reached their target and fired.
    pub actions_fired: u64,
    /// Target computations that fell back to the local clock.
    pub clock_fallbacks: u64,
    /// Decoded messages whose payload failed validation.
    pub malformed_payloads: u64,
    /// Per-peer announcements attempted.
    pub announcements: u64,
    /// Announcements that exhausted their retry budget.
    pub announcement_failures: u64,
    /// Time-sync requests issued.
    pub timesync_requests: u64,
    /// Time-sync replies received.
    pub timesync_replies: u64,
}

#[derive(Debug, Clone, Copy)]
enum RequestPhase {
    /// Waiting for a clock resync to settle, up to the deadline.
    AwaitingClock { deadline: UnixTime },
    /// Waiting for the latency probe round to resolve.
    Probing,
}

#[derive(Debug)]
struct RequestState {
    kind: ActionKind,
    phase: RequestPhase,
}

enum Step {
    Wait,
    StartProbe,
    CheckProbe,
}

/// Coordinates one synchronized action at a time across the mesh.
#[derive(Debug)]
pub struct CoordinationEngine<C> {
    local: PeerId,
    clock: C,
    config: EngineConfig,
    link: ReliableLink,
    prober: LatencyProber,
    scheduler: ActionScheduler,
    request: Option<RequestState>,
    /// Announcement ids still awaiting a delivery outcome, by target peer.
    pending_broadcasts: HashMap<MessageId, PeerId>,
    /// Our outstanding time-sync requests, by send time.
    timesync_inflight: HashMap<MessageId, UnixTime>,
    stats: EngineStats,
}

impl<C: ReferenceClock> CoordinationEngine<C> {
    pub fn new(local: PeerId, clock: C, config: EngineConfig) -> Self {
        let link = ReliableLink::new(local.clone(), config.clone());
        Self {
            local,
            clock,
            config,
            link,
            prober: LatencyProber::new(),
            scheduler: ActionScheduler::new(),
            request: None,
            pending_broadcasts: HashMap::new(),
            timesync_inflight: HashMap::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn link_stats(&self) -> &LinkStats {
        self.link.stats()
    }

    /// The currently armed action, if any.
    pub fn scheduled(&self) -> Option<(ActionKind, UnixTime)> {
        self.scheduler.scheduled()
    }

    /// Current round-trip estimates, by peer.
    pub fn rtt_samples(&self) -> &HashMap<PeerId, RttSample> {
        self.prober.samples()
    }

    /// Begin coordinating `kind` across the mesh. A request already in
    /// flight is superseded. Events that resolve synchronously, such as the
    /// empty-roster case, are returned directly; the rest arrive from later
    /// [`CoordinationEngine::tick`] calls.
    pub fn request_action<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        kind: ActionKind,
        now: UnixTime,
    ) -> Vec<EngineEvent> {
        self.stats.requests += 1;
        if self.request.is_some() {
            warn!(?kind, "superseding coordination request already in flight");
        }
        let phase = if self.clock.needs_resync(now) {
            self.clock.begin_resync(now);
            let deadline = now + self.config.resync_deadline;
            debug!(?kind, "waiting for clock resync");
            RequestPhase::AwaitingClock { deadline }
        } else {
            RequestPhase::Probing
        };
        let started_probing = matches!(phase, RequestPhase::Probing);
        self.request = Some(RequestState { kind, phase });
        if started_probing {
            self.start_probe(transport, now);
        }
        self.advance(transport, now)
    }

    /// One drive step: drain inbound frames, run link deadlines, advance the
    /// request machine, and fire any due action.
    pub fn tick<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        now: UnixTime,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        // Inbound first, so acks settle pending sends before expiry runs.
        while let Some((from, bytes)) = transport.recv() {
            if let Some(link_event) = self.link.on_inbound(transport, from, &bytes, now) {
                self.route_link_event(transport, link_event, now, &mut events);
            }
        }
        for link_event in self.link.tick(transport, now) {
            self.route_link_event(transport, link_event, now, &mut events);
        }

        events.extend(self.advance(transport, now));

        // Targets are exchanged in the corrected timebase, so firing is
        // evaluated there too.
        let eval_now = self.clock.corrected(now).unwrap_or(now);
        if let Some((kind, target)) = self.scheduler.poll(eval_now) {
            self.stats.actions_fired += 1;
            info!(?kind, target = target.as_secs(), "action due");
            events.push(EngineEvent::ActionDue { kind, target });
        }

        events
    }

    /// Ask `peer` for its corrected-or-local time. The answer arrives as an
    /// [`EngineEvent::TimeSyncReply`]; silence becomes an
    /// [`CoordinationError::AckTimeout`] fault.
    pub fn request_time_sync<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        peer: &PeerId,
        now: UnixTime,
    ) -> Option<MessageId> {
        let reported = self.clock.corrected(now).unwrap_or(now);
        let request = SyncMessage::time_sync_request(self.local.clone(), reported, now);
        let id = self.link.send_with_ack(transport, peer, request, now)?;
        self.timesync_inflight.insert(id.clone(), now);
        self.stats.timesync_requests += 1;
        debug!(peer = %peer, id = %id, "time sync requested");
        Some(id)
    }

    /// How the owner should wait before the next drive step.
    pub fn next_wake(&self, now: UnixTime) -> Wake {
        let eval_now = self.clock.corrected(now).unwrap_or(now);
        match self.scheduler.next_wake(eval_now) {
            // Map the corrected-timebase instant back onto the caller's.
            Wake::SleepUntil(t) => Wake::SleepUntil(now + t.saturating_since(eval_now)),
            other => other,
        }
    }

    fn route_link_event<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        event: LinkEvent,
        now: UnixTime,
        out: &mut Vec<EngineEvent>,
    ) {
        match event {
            LinkEvent::Malformed { from, detail } => {
                out.push(EngineEvent::Fault(CoordinationError::MalformedMessage {
                    peer: from,
                    detail,
                }));
            }
            LinkEvent::Delivered {
                message_id,
                peer,
                attempts,
            } => {
                if self.pending_broadcasts.remove(&message_id).is_some() {
                    debug!(peer = %peer, attempts, "announcement delivered");
                } else if self.timesync_inflight.contains_key(&message_id) {
                    debug!(peer = %peer, "time sync request acknowledged");
                } else if self.prober.on_ack(&message_id, now) {
                    // Sample recorded; round completion is advance's job.
                } else {
                    debug!(id = %message_id, "delivery outcome for unknown id");
                }
            }
            LinkEvent::Failed {
                message_id,
                peer,
                attempts,
            } => {
                if self.pending_broadcasts.remove(&message_id).is_some() {
                    self.stats.announcement_failures += 1;
                    out.push(EngineEvent::Fault(CoordinationError::RetriesExhausted {
                        peer,
                        attempts,
                    }));
                } else if self.timesync_inflight.remove(&message_id).is_some() {
                    out.push(EngineEvent::Fault(CoordinationError::AckTimeout {
                        id: message_id,
                    }));
                } else if let Some(peer) = self.prober.on_fail(&message_id) {
                    out.push(EngineEvent::Fault(CoordinationError::ProbeTimeout { peer }));
                } else {
                    debug!(id = %message_id, "failure outcome for unknown id");
                }
            }
            LinkEvent::Inbound { message, from } => {
                self.handle_message(transport, message, from, now, out);
            }
        }
    }

    fn handle_message<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        message: SyncMessage,
        from: PeerId,
        now: UnixTime,
        out: &mut Vec<EngineEvent>,
    ) {
        match message.kind {
            MessageKind::StartRecording | MessageKind::StopRecording => {
                let Some(kind) = message.kind.action() else {
                    return;
                };
                match message.time_payload() {
                    Ok(target) => {
                        self.scheduler.schedule(kind, target);
                        self.stats.peer_schedules += 1;
                        info!(
                            peer = %from,
                            ?kind,
                            target = target.as_secs(),
                            "peer scheduled action"
                        );
                        out.push(EngineEvent::ActionScheduled {
                            kind,
                            target,
                            origin: ScheduleOrigin::Peer(from),
                        });
                    }
                    Err(error) => {
                        self.stats.malformed_payloads += 1;
                        warn!(peer = %from, %error, "dropping action with bad target");
                        out.push(EngineEvent::Fault(CoordinationError::MalformedMessage {
                            peer: from,
                            detail: error.to_string(),
                        }));
                    }
                }
            }
            MessageKind::Ping => {
                // The link already acknowledged it; the payload is opaque
                // to the receiver.
            }
            MessageKind::TimeSync => {
                self.handle_time_sync(transport, message, from, now, out);
            }
            MessageKind::Acknowledgment => {
                // Consumed by the link before dispatch.
            }
        }
    }

    fn handle_time_sync<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        message: SyncMessage,
        from: PeerId,
        now: UnixTime,
        out: &mut Vec<EngineEvent>,
    ) {
        let Some(id) = message.message_id.clone() else {
            self.stats.malformed_payloads += 1;
            warn!(peer = %from, "dropping time sync without an id");
            out.push(EngineEvent::Fault(CoordinationError::MalformedMessage {
                peer: from,
                detail: "time sync without message id".to_string(),
            }));
            return;
        };
        match message.time_payload() {
            Ok(reported) => {
                if self.timesync_inflight.remove(&id).is_some() {
                    self.stats.timesync_replies += 1;
                    debug!(
                        peer = %from,
                        reported = reported.as_secs(),
                        "time sync reply"
                    );
                    out.push(EngineEvent::TimeSyncReply {
                        peer: from,
                        reported,
                    });
                } else {
                    // A peer is asking; answer with our corrected-or-local
                    // time, correlated by the request id.
                    let ours = self.clock.corrected(now).unwrap_or(now);
                    debug!(
                        peer = %from,
                        theirs = reported.as_secs(),
                        ours = ours.as_secs(),
                        "answering time sync"
                    );
                    let reply =
                        SyncMessage::time_sync_reply(self.local.clone(), ours, id, now);
                    self.link.send_to(transport, &from, &reply);
                }
            }
            Err(error) => {
                self.stats.malformed_payloads += 1;
                warn!(peer = %from, %error, "dropping time sync with bad payload");
                out.push(EngineEvent::Fault(CoordinationError::MalformedMessage {
                    peer: from,
                    detail: error.to_string(),
                }));
            }
        }
    }

    /// Expire time-sync reply windows and move the request machine forward.
    fn advance<T: MeshTransport>(&mut self, transport: &mut T, now: UnixTime) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        let expired: Vec<MessageId> = self
            .timesync_inflight
            .iter()
            .filter(|(_, sent)| now >= **sent + self.config.ack_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.timesync_inflight.remove(&id);
            warn!(id = %id, "no time sync reply within the ack window");
            events.push(EngineEvent::Fault(CoordinationError::AckTimeout { id }));
        }

        let step = match self.request.as_ref() {
            None => return events,
            Some(request) => match request.phase {
                RequestPhase::AwaitingClock { deadline } => {
                    if !self.clock.resync_in_flight() {
                        debug!("clock resync settled");
                        Step::StartProbe
                    } else if now >= deadline {
                        warn!("clock resync deadline passed, continuing without it");
                        Step::StartProbe
                    } else {
                        Step::Wait
                    }
                }
                RequestPhase::Probing => Step::CheckProbe,
            },
        };

        match step {
            Step::Wait => {}
            Step::StartProbe => {
                self.start_probe(transport, now);
                if let Some(request) = self.request.as_mut() {
                    request.phase = RequestPhase::Probing;
                }
                if self.prober.round_complete() {
                    events.extend(self.complete_request(transport, now));
                }
            }
            Step::CheckProbe => {
                if self.prober.round_complete() {
                    events.extend(self.complete_request(transport, now));
                }
            }
        }

        events
    }

    fn start_probe<T: MeshTransport>(&mut self, transport: &mut T, now: UnixTime) {
        let roster = transport.connected_peers();
        self.prober
            .begin_round(&mut self.link, transport, &self.local, &roster, now);
    }

    /// Probe round resolved: compute the delay, arm locally, announce to the
    /// roster. The engine is idle again once this returns; announcement
    /// delivery outcomes surface later as events.
    fn complete_request<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        now: UnixTime,
    ) -> Vec<EngineEvent> {
        let Some(request) = self.request.take() else {
            return Vec::new();
        };
        self.prober.finish_round();
        let mut events = Vec::new();

        let rtts = self.prober.rtts();
        let delay = compute_delay(&rtts);
        let base = match self.clock.corrected(now) {
            Some(corrected) => corrected,
            None => {
                self.stats.clock_fallbacks += 1;
                warn!("reference clock unavailable, using local time");
                events.push(EngineEvent::Fault(CoordinationError::ClockUnavailable));
                now
            }
        };
        let target = base + delay;

        self.scheduler.schedule(request.kind, target);
        self.stats.local_schedules += 1;
        info!(
            kind = ?request.kind,
            target = target.as_secs(),
            delay_ms = delay.as_millis() as u64,
            samples = rtts.len(),
            "action scheduled"
        );
        events.push(EngineEvent::ActionScheduled {
            kind: request.kind,
            target,
            origin: ScheduleOrigin::Local,
        });

        let roster = transport.connected_peers();
        if roster.is_empty() {
            warn!("no connected peers, scheduling locally only");
            events.push(EngineEvent::Fault(CoordinationError::NoConnectedPeers));
        } else {
            for peer in roster {
                // Fresh id per peer keeps ack bookkeeping one-to-one.
                let announcement =
                    SyncMessage::action(request.kind, self.local.clone(), target, now);
                if let Some(id) = self.link.send_with_retry(transport, &peer, announcement, now)
                {
                    self.pending_broadcasts.insert(id, peer);
                    self.stats.announcements += 1;
                }
            }
        }

        events
    }
}
