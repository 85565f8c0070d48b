use serde::{Deserialize, Serialize};
use slate_core::{ActionKind, MessageId, PeerId, UnixTime};

use crate::error::ProtoError;

/// Wire message kinds. The serialized names are the protocol's type strings;
/// anything else fails decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    StartRecording,
    StopRecording,
    Acknowledgment,
    Ping,
    TimeSync,
}

impl MessageKind {
    /// The synchronized action this kind announces, if it announces one.
    pub fn action(self) -> Option<ActionKind> {
        match self {
            MessageKind::StartRecording => Some(ActionKind::StartRecording),
            MessageKind::StopRecording => Some(ActionKind::StopRecording),
            _ => None,
        }
    }
}

impl From<ActionKind> for MessageKind {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::StartRecording => MessageKind::StartRecording,
            ActionKind::StopRecording => MessageKind::StopRecording,
        }
    }
}

/// One coordination frame as it travels over the mesh.
///
/// `message_id` is present on anything requiring acknowledgment or reply
/// correlation; `timestamp` is the sender's local clock at construction and is
/// diagnostic only. Frames are immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub timestamp: f64,
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

impl SyncMessage {
    /// Action announcement carrying the agreed target instant.
    pub fn action(kind: ActionKind, sender: PeerId, target: UnixTime, now: UnixTime) -> Self {
        Self {
            kind: kind.into(),
            sender,
            payload: Some(format_time_payload(target)),
            timestamp: now.as_secs(),
            message_id: Some(MessageId::random()),
        }
    }

    /// RTT probe. The payload carries the send time but receivers do not
    /// interpret it.
    pub fn ping(sender: PeerId, now: UnixTime) -> Self {
        Self {
            kind: MessageKind::Ping,
            sender,
            payload: Some(format_time_payload(now)),
            timestamp: now.as_secs(),
            message_id: Some(MessageId::random()),
        }
    }

    /// Acknowledgment of `acked`; carries no payload of its own.
    pub fn acknowledgment(sender: PeerId, acked: MessageId, now: UnixTime) -> Self {
        Self {
            kind: MessageKind::Acknowledgment,
            sender,
            payload: None,
            timestamp: now.as_secs(),
            message_id: Some(acked),
        }
    }

    /// Time-sync request reporting the sender's corrected-or-local time.
    pub fn time_sync_request(sender: PeerId, reported: UnixTime, now: UnixTime) -> Self {
        Self {
            kind: MessageKind::TimeSync,
            sender,
            payload: Some(format_time_payload(reported)),
            timestamp: now.as_secs(),
            message_id: Some(MessageId::random()),
        }
    }

    /// Time-sync reply; reuses the request id so the requester can correlate.
    pub fn time_sync_reply(
        sender: PeerId,
        reported: UnixTime,
        request_id: MessageId,
        now: UnixTime,
    ) -> Self {
        Self {
            kind: MessageKind::TimeSync,
            sender,
            payload: Some(format_time_payload(reported)),
            timestamp: now.as_secs(),
            message_id: Some(request_id),
        }
    }

    /// Parses the unix-seconds payload carried by action and time-sync frames.
    pub fn time_payload(&self) -> Result<UnixTime, ProtoError> {
        let raw = self
            .payload
            .as_deref()
            .ok_or(ProtoError::InvalidMessage("missing time payload"))?;
        parse_time_payload(raw)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(|e| ProtoError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(|e| ProtoError::Decode(e.to_string()))
    }
}

/// Formats an instant as the protocol's decimal unix-seconds string.
pub fn format_time_payload(t: UnixTime) -> String {
    format!("{:.6}", t.as_secs())
}

/// Parses a decimal unix-seconds string, rejecting non-finite values.
pub fn parse_time_payload(raw: &str) -> Result<UnixTime, ProtoError> {
    let secs = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| ProtoError::InvalidTimePayload(raw.to_string()))?;
    if !secs.is_finite() {
        return Err(ProtoError::InvalidTimePayload(raw.to_string()));
    }
    Ok(UnixTime::from_secs(secs))
}
