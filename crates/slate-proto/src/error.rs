use thiserror::Error;

/// Errors returned by wire message codec operations.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// JSON serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// JSON deserialization failure (includes unknown message types).
    #[error("decode error: {0}")]
    Decode(String),
    /// Message-level field consistency failure.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    /// Time payload is not a finite decimal number of unix seconds.
    #[error("invalid time payload: {0}")]
    InvalidTimePayload(String),
}
