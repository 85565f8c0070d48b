//! Slate wire protocol.
//!
//! Defines the flat JSON coordination frame exchanged between peers and its
//! encode/decode helpers.

pub mod error;
pub mod message;

pub use error::ProtoError;
pub use message::{format_time_payload, parse_time_payload, MessageKind, SyncMessage};
