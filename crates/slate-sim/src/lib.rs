//! Simulation harness for multi-node coordination runs.
//!
//! Real engines, in-memory meshes, and a lockstep scheduler for time and
//! frame delivery. Used by the end-to-end tests.

pub mod scenarios;
