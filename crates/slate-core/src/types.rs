use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier for a mesh participant.
///
/// Assigned by the discovery layer; the coordination core never interprets
/// its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Correlation key for acknowledgment and retry, unique per logical message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Fresh id from 16 random bytes, hex-encoded.
    pub fn random() -> Self {
        let mut bytes = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The synchronized action a mesh agrees to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    StartRecording,
    StopRecording,
}

/// Wall-clock instant in unix seconds, at the f64 resolution the wire uses.
///
/// Arithmetic with `Duration` is saturating at zero on subtraction-to-duration
/// so waits can never go negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct UnixTime(f64);

impl UnixTime {
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Current system wall-clock time. A host clock set before the unix epoch
    /// reads as zero rather than failing.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Self(elapsed.as_secs_f64()),
            Err(_) => Self(0.0),
        }
    }

    /// Elapsed time since `earlier`, clamped to zero if `earlier` is ahead.
    pub fn saturating_since(self, earlier: UnixTime) -> Duration {
        Duration::from_secs_f64((self.0 - earlier.0).max(0.0))
    }
}

impl Add<Duration> for UnixTime {
    type Output = UnixTime;

    fn add(self, rhs: Duration) -> UnixTime {
        UnixTime(self.0 + rhs.as_secs_f64())
    }
}

impl Sub<Duration> for UnixTime {
    type Output = UnixTime;

    fn sub(self, rhs: Duration) -> UnixTime {
        UnixTime(self.0 - rhs.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{MessageId, PeerId, UnixTime};

    #[test]
    fn random_message_ids_are_distinct_hex() {
        let a = MessageId::random();
        let b = MessageId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unix_time_duration_arithmetic() {
        let t = UnixTime::from_secs(1000.0);
        let later = t + Duration::from_millis(2500);
        assert!((later.as_secs() - 1002.5).abs() < 1e-9);
        assert_eq!(later.saturating_since(t), Duration::from_millis(2500));
        let earlier = later - Duration::from_secs(3);
        assert!((earlier.as_secs() - 999.5).abs() < 1e-9);
    }

    #[test]
    fn saturating_since_clamps_to_zero() {
        let t = UnixTime::from_secs(1000.0);
        let ahead = UnixTime::from_secs(1010.0);
        assert_eq!(t.saturating_since(ahead), Duration::ZERO);
    }

    #[test]
    fn peer_id_round_trips_display_form() {
        let peer = PeerId::from("camera-rig-2");
        assert_eq!(peer.to_string(), "camera-rig-2");
        assert_eq!(PeerId::new("camera-rig-2"), peer);
    }
}
