//! Transport seam for the coordination mesh.
//!
//! The engine drives any `MeshTransport`; the in-memory implementation backs
//! tests and simulations.

pub mod adapter;

pub use adapter::{route_in_memory, InMemoryMesh, MeshTransport};
