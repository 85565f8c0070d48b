//! Acknowledged and retried delivery on top of a fire-and-forget mesh.
//!
//! The link owns no sockets and no timers. The engine feeds it inbound
//! frames and drives [`ReliableLink::tick`] with the current time; deadline
//! expiry, backoff, and resends all happen inside those calls.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use slate_core::{MessageId, PeerId, UnixTime};
use slate_proto::{MessageKind, SyncMessage};
use slate_transport::MeshTransport;
use tracing::{debug, warn};

use crate::config::EngineConfig;

/// Outcome of feeding or ticking the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// An acknowledged send was confirmed by its target.
    Delivered {
        message_id: MessageId,
        peer: PeerId,
        attempts: u32,
    },
    /// An acknowledged send gave up, either on its single timeout or after
    /// its retry budget.
    Failed {
        message_id: MessageId,
        peer: PeerId,
        attempts: u32,
    },
    /// A frame arrived that did not decode as a message.
    Malformed { from: PeerId, detail: String },
    /// A decoded, deduplicated message ready for dispatch.
    Inbound { message: SyncMessage, from: PeerId },
}

/// Delivery counters, readable at any time.
#[derive(Debug, Default, Clone)]
pub struct LinkStats {
    /// Raw frames taken off the mesh.
    pub inbound_frames: u64,
    /// Frames that failed to decode.
    pub malformed_frames: u64,
    /// Decoded messages, duplicates included.
    pub inbound_messages: u64,
    /// Decoded messages suppressed by the seen-id window.
    pub duplicate_messages: u64,
    /// Acknowledgments we sent in response to inbound messages.
    pub acks_sent: u64,
    /// Acknowledgments that resolved a pending send.
    pub acks_matched: u64,
    /// Acknowledgments that matched nothing, late ones included.
    pub acks_unmatched: u64,
    /// Frames handed to the transport.
    pub sends: u64,
    /// Frames the transport refused.
    pub send_errors: u64,
    /// Resends triggered by ack timeouts.
    pub retries: u64,
    /// Sends that conclusively failed.
    pub failures: u64,
}

#[derive(Debug)]
struct PendingAck {
    peer: PeerId,
    deadline: UnixTime,
}

#[derive(Debug)]
struct RetryState {
    message: SyncMessage,
    peer: PeerId,
    /// Sends performed so far, the initial one included.
    attempts: u32,
    max_retries: u32,
    /// When set, the message is in backoff and resends at this instant.
    next_send_at: Option<UnixTime>,
}

/// Per-message ack tracking, retry with exponential backoff, automatic
/// acknowledgment of inbound messages, and duplicate suppression.
#[derive(Debug)]
pub struct ReliableLink {
    local: PeerId,
    config: EngineConfig,
    pending: HashMap<MessageId, PendingAck>,
    retries: HashMap<MessageId, RetryState>,
    seen_ids: LruCache<MessageId, ()>,
    stats: LinkStats,
}

impl ReliableLink {
    pub fn new(local: PeerId, config: EngineConfig) -> Self {
        let capacity = NonZeroUsize::new(config.seen_ids_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            local,
            config,
            pending: HashMap::new(),
            retries: HashMap::new(),
            seen_ids: LruCache::new(capacity),
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Fire-and-forget to every connected peer. An empty roster is a no-op.
    pub fn send<T: MeshTransport>(&mut self, transport: &mut T, message: &SyncMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "dropping unencodable message");
                self.stats.send_errors += 1;
                return;
            }
        };
        for peer in transport.connected_peers() {
            self.transmit_bytes(transport, &peer, &bytes);
        }
    }

    /// Fire-and-forget to a single peer.
    pub fn send_to<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        peer: &PeerId,
        message: &SyncMessage,
    ) {
        match message.encode() {
            Ok(bytes) => self.transmit_bytes(transport, peer, &bytes),
            Err(error) => {
                warn!(%error, "dropping unencodable message");
                self.stats.send_errors += 1;
            }
        }
    }

    /// Send `message` to `peer` and await one acknowledgment within the ack
    /// window. Resolution arrives later as a [`LinkEvent::Delivered`] or
    /// [`LinkEvent::Failed`].
    pub fn send_with_ack<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        peer: &PeerId,
        message: SyncMessage,
        now: UnixTime,
    ) -> Option<MessageId> {
        let id = match message.message_id.clone() {
            Some(id) => id,
            None => {
                warn!("refusing acked send without a message id");
                return None;
            }
        };
        self.pending.insert(
            id.clone(),
            PendingAck {
                peer: peer.clone(),
                deadline: now + self.config.ack_timeout,
            },
        );
        // A transport refusal still leaves the entry registered; the ack
        // window will expire it.
        self.send_to(transport, peer, &message);
        Some(id)
    }

    /// Like [`ReliableLink::send_with_ack`], but each timeout schedules a
    /// resend of the same message after an exponentially growing backoff,
    /// up to the configured attempt budget.
    pub fn send_with_retry<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        peer: &PeerId,
        message: SyncMessage,
        now: UnixTime,
    ) -> Option<MessageId> {
        let id = self.send_with_ack(transport, peer, message.clone(), now)?;
        self.retries.insert(
            id.clone(),
            RetryState {
                message,
                peer: peer.clone(),
                attempts: 1,
                max_retries: self.config.max_retries,
                next_send_at: None,
            },
        );
        Some(id)
    }

    /// Decode one inbound frame, acknowledge it if it carries an id, and
    /// suppress ids already seen. Acks resolve pending sends in place.
    pub fn on_inbound<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        from: PeerId,
        bytes: &[u8],
        now: UnixTime,
    ) -> Option<LinkEvent> {
        self.stats.inbound_frames += 1;
        let message = match SyncMessage::decode(bytes) {
            Ok(message) => message,
            Err(error) => {
                self.stats.malformed_frames += 1;
                warn!(peer = %from, %error, "dropping undecodable frame");
                return Some(LinkEvent::Malformed {
                    from,
                    detail: error.to_string(),
                });
            }
        };
        self.stats.inbound_messages += 1;

        if message.kind == MessageKind::Acknowledgment {
            let id = message.message_id?;
            return match self.pending.remove(&id) {
                Some(entry) => {
                    self.stats.acks_matched += 1;
                    let attempts = self
                        .retries
                        .remove(&id)
                        .map(|r| r.attempts)
                        .unwrap_or(1);
                    Some(LinkEvent::Delivered {
                        message_id: id,
                        peer: entry.peer,
                        attempts,
                    })
                }
                None => {
                    // Late or unknown ack. Nothing is waiting, so drop it.
                    self.stats.acks_unmatched += 1;
                    debug!(id = %id, peer = %from, "unmatched acknowledgment");
                    None
                }
            };
        }

        if let Some(id) = message.message_id.clone() {
            // Acknowledge before deduplicating: a duplicate usually means
            // our previous ack was lost.
            let ack = SyncMessage::acknowledgment(self.local.clone(), id.clone(), now);
            self.send_to(transport, &from, &ack);
            self.stats.acks_sent += 1;

            if self.seen_ids.put(id.clone(), ()).is_some() {
                self.stats.duplicate_messages += 1;
                debug!(id = %id, peer = %from, "suppressing duplicate message");
                return None;
            }
        }

        Some(LinkEvent::Inbound { message, from })
    }

    /// Expire ack windows and perform due resends. Call once per drive step.
    pub fn tick<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        now: UnixTime,
    ) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        let expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let Some(entry) = self.pending.remove(&id) else {
                continue;
            };
            match self.retries.get_mut(&id) {
                Some(retry) => {
                    let backoff = self.config.retry_backoff(retry.attempts);
                    retry.next_send_at = Some(now + backoff);
                    debug!(
                        id = %id,
                        peer = %entry.peer,
                        attempts = retry.attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "ack window expired, backing off"
                    );
                }
                None => {
                    self.stats.failures += 1;
                    warn!(id = %id, peer = %entry.peer, "acknowledged send timed out");
                    events.push(LinkEvent::Failed {
                        message_id: id,
                        peer: entry.peer,
                        attempts: 1,
                    });
                }
            }
        }

        let due: Vec<MessageId> = self
            .retries
            .iter()
            .filter(|(_, r)| r.next_send_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            let exhausted = self
                .retries
                .get(&id)
                .is_some_and(|r| r.attempts >= r.max_retries);
            if exhausted {
                let Some(retry) = self.retries.remove(&id) else {
                    continue;
                };
                self.stats.failures += 1;
                warn!(
                    id = %id,
                    peer = %retry.peer,
                    attempts = retry.attempts,
                    "retry budget exhausted"
                );
                events.push(LinkEvent::Failed {
                    message_id: id,
                    peer: retry.peer,
                    attempts: retry.attempts,
                });
                continue;
            }
            let (peer, message, attempts) = {
                let Some(retry) = self.retries.get_mut(&id) else {
                    continue;
                };
                retry.attempts += 1;
                retry.next_send_at = None;
                (retry.peer.clone(), retry.message.clone(), retry.attempts)
            };
            self.pending.insert(
                id.clone(),
                PendingAck {
                    peer: peer.clone(),
                    deadline: now + self.config.ack_timeout,
                },
            );
            self.stats.retries += 1;
            debug!(id = %id, peer = %peer, attempts, "resending");
            self.send_to(transport, &peer, &message);
        }

        events
    }

    fn transmit_bytes<T: MeshTransport>(
        &mut self,
        transport: &mut T,
        peer: &PeerId,
        bytes: &[u8],
    ) {
        match transport.send_to(peer, bytes) {
            Ok(()) => self.stats.sends += 1,
            Err(error) => {
                self.stats.send_errors += 1;
                warn!(peer = %peer, %error, "send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use slate_core::{ActionKind, PeerId, UnixTime};
    use slate_proto::{MessageKind, SyncMessage};
    use slate_transport::InMemoryMesh;

    use super::{LinkEvent, ReliableLink};
    use crate::config::EngineConfig;

    fn local() -> PeerId {
        PeerId::from("cam-local")
    }

    fn peer() -> PeerId {
        PeerId::from("cam-remote")
    }

    fn link() -> ReliableLink {
        ReliableLink::new(local(), EngineConfig::default())
    }

    fn mesh() -> InMemoryMesh {
        InMemoryMesh::with_peers(vec![peer()])
    }

    fn t(secs: f64) -> UnixTime {
        UnixTime::from_secs(secs)
    }

    #[test]
    fn ack_resolves_pending_send() {
        let mut link = link();
        let mut mesh = mesh();
        let ping = SyncMessage::ping(local(), t(0.0));
        let id = link
            .send_with_ack(&mut mesh, &peer(), ping, t(0.0))
            .unwrap();

        let ack = SyncMessage::acknowledgment(peer(), id.clone(), t(0.1));
        let event = link.on_inbound(&mut mesh, peer(), &ack.encode().unwrap(), t(0.1));
        assert_eq!(
            event,
            Some(LinkEvent::Delivered {
                message_id: id,
                peer: peer(),
                attempts: 1,
            })
        );
        assert_eq!(link.stats().acks_matched, 1);
        assert_eq!(link.pending_len(), 0);
    }

    #[test]
    fn unretried_send_fails_once_on_timeout() {
        let mut link = link();
        let mut mesh = mesh();
        let ping = SyncMessage::ping(local(), t(0.0));
        let id = link
            .send_with_ack(&mut mesh, &peer(), ping, t(0.0))
            .unwrap();

        assert!(link.tick(&mut mesh, t(4.9)).is_empty());
        let events = link.tick(&mut mesh, t(5.0));
        assert_eq!(
            events,
            vec![LinkEvent::Failed {
                message_id: id,
                peer: peer(),
                attempts: 1,
            }]
        );
        // Nothing left to expire.
        assert!(link.tick(&mut mesh, t(60.0)).is_empty());
    }

    #[test]
    fn retry_resends_same_id_on_backoff_schedule() {
        let mut link = link();
        let mut mesh = mesh();
        let action = SyncMessage::action(ActionKind::StartRecording, local(), t(10.0), t(0.0));
        let id = link
            .send_with_retry(&mut mesh, &peer(), action, t(0.0))
            .unwrap();
        assert_eq!(mesh.take_outbound().len(), 1);

        // First window expires at 5.0; the resend is due 0.5 s later.
        assert!(link.tick(&mut mesh, t(5.0)).is_empty());
        assert!(mesh.take_outbound().is_empty());
        assert!(link.tick(&mut mesh, t(5.5)).is_empty());
        let resent = mesh.take_outbound();
        assert_eq!(resent.len(), 1);
        let decoded = SyncMessage::decode(&resent[0].1).unwrap();
        assert_eq!(decoded.message_id, Some(id.clone()));

        // Second window, 1 s backoff.
        assert!(link.tick(&mut mesh, t(10.5)).is_empty());
        assert!(link.tick(&mut mesh, t(11.5)).is_empty());
        assert_eq!(mesh.take_outbound().len(), 1);

        // Third window expires at 16.5; the budget of three attempts is
        // spent once the final 2 s backoff elapses.
        assert!(link.tick(&mut mesh, t(16.5)).is_empty());
        let events = link.tick(&mut mesh, t(18.5));
        assert_eq!(
            events,
            vec![LinkEvent::Failed {
                message_id: id,
                peer: peer(),
                attempts: 3,
            }]
        );
        assert!(mesh.take_outbound().is_empty());
        assert_eq!(link.stats().retries, 2);
        assert_eq!(link.stats().failures, 1);
    }

    #[test]
    fn ack_after_resend_reports_attempt_count() {
        let mut link = link();
        let mut mesh = mesh();
        let action = SyncMessage::action(ActionKind::StopRecording, local(), t(20.0), t(0.0));
        let id = link
            .send_with_retry(&mut mesh, &peer(), action, t(0.0))
            .unwrap();

        link.tick(&mut mesh, t(5.0));
        link.tick(&mut mesh, t(5.5));

        let ack = SyncMessage::acknowledgment(peer(), id.clone(), t(5.6));
        let event = link.on_inbound(&mut mesh, peer(), &ack.encode().unwrap(), t(5.6));
        assert_eq!(
            event,
            Some(LinkEvent::Delivered {
                message_id: id,
                peer: peer(),
                attempts: 2,
            })
        );
        // Fully settled; later ticks resend nothing.
        assert!(link.tick(&mut mesh, t(30.0)).is_empty());
    }

    #[test]
    fn late_ack_is_dropped_silently() {
        let mut link = link();
        let mut mesh = mesh();
        let ping = SyncMessage::ping(local(), t(0.0));
        let id = link
            .send_with_ack(&mut mesh, &peer(), ping, t(0.0))
            .unwrap();
        link.tick(&mut mesh, t(5.0));

        let ack = SyncMessage::acknowledgment(peer(), id, t(9.0));
        let event = link.on_inbound(&mut mesh, peer(), &ack.encode().unwrap(), t(9.0));
        assert_eq!(event, None);
        assert_eq!(link.stats().acks_unmatched, 1);
    }

    #[test]
    fn inbound_message_is_auto_acked() {
        let mut link = link();
        let mut mesh = mesh();
        let action = SyncMessage::action(ActionKind::StartRecording, peer(), t(30.0), t(1.0));
        let id = action.message_id.clone().unwrap();

        let event = link.on_inbound(&mut mesh, peer(), &action.encode().unwrap(), t(1.0));
        assert!(matches!(event, Some(LinkEvent::Inbound { .. })));

        let outbound = mesh.take_outbound();
        assert_eq!(outbound.len(), 1);
        let ack = SyncMessage::decode(&outbound[0].1).unwrap();
        assert_eq!(ack.kind, MessageKind::Acknowledgment);
        assert_eq!(ack.message_id, Some(id));
        assert_eq!(ack.sender, local());
    }

    #[test]
    fn duplicate_is_suppressed_but_reacked() {
        let mut link = link();
        let mut mesh = mesh();
        let action = SyncMessage::action(ActionKind::StartRecording, peer(), t(30.0), t(1.0));
        let frame = action.encode().unwrap();

        assert!(matches!(
            link.on_inbound(&mut mesh, peer(), &frame, t(1.0)),
            Some(LinkEvent::Inbound { .. })
        ));
        assert_eq!(link.on_inbound(&mut mesh, peer(), &frame, t(1.2)), None);

        assert_eq!(link.stats().duplicate_messages, 1);
        assert_eq!(link.stats().acks_sent, 2);
        assert_eq!(mesh.take_outbound().len(), 2);
    }

    #[test]
    fn undecodable_frame_reports_malformed() {
        let mut link = link();
        let mut mesh = mesh();
        let event = link.on_inbound(&mut mesh, peer(), b"{not json", t(0.0));
        assert!(matches!(event, Some(LinkEvent::Malformed { .. })));
        assert_eq!(link.stats().malformed_frames, 1);
    }

    #[test]
    fn broadcast_reaches_all_connected_peers() {
        let mut link = link();
        let mut mesh =
            InMemoryMesh::with_peers(vec![PeerId::from("cam-a"), PeerId::from("cam-b")]);
        let ping = SyncMessage::ping(local(), t(0.0));
        link.send(&mut mesh, &ping);
        assert_eq!(mesh.take_outbound().len(), 2);

        let mut empty = InMemoryMesh::new();
        link.send(&mut empty, &ping);
        assert!(empty.take_outbound().is_empty());
    }
}
