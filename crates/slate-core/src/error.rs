use thiserror::Error;

use crate::types::{MessageId, PeerId};

/// Failure taxonomy for the coordination core.
///
/// Every variant is recovered locally (fallback, bounded retry, or drop);
/// none of them terminate the engine. They surface in logs and in diagnostic
/// engine events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// No corrected time available; the local wall clock is used instead.
    #[error("reference clock unavailable, falling back to local time")]
    ClockUnavailable,
    /// A latency probe went unanswered within its window.
    #[error("latency probe to {peer} timed out")]
    ProbeTimeout { peer: PeerId },
    /// An acknowledged send saw no ack before its deadline.
    #[error("no acknowledgment for message {id} within the ack window")]
    AckTimeout { id: MessageId },
    /// Retry budget exhausted for one peer.
    #[error("retries exhausted for peer {peer} after {attempts} attempts")]
    RetriesExhausted { peer: PeerId, attempts: u32 },
    /// Undecodable frame or unparseable payload.
    #[error("malformed message from {peer}: {detail}")]
    MalformedMessage { peer: PeerId, detail: String },
    /// Broadcast requested with an empty roster.
    #[error("no connected peers, scheduling locally only")]
    NoConnectedPeers,
}
