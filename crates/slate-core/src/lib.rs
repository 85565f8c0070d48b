//! Core slate primitives shared across crates.
//!
//! Peer and message identity, action kinds, unix-seconds wall-clock time, and
//! the shared failure taxonomy.

pub mod error;
pub mod types;

pub use error::CoordinationError;
pub use types::{ActionKind, MessageId, PeerId, UnixTime};
