//! Coordination engine for synchronized mesh actions.
//!
//! This crate wires together clock gating, latency probing, delay
//! computation, reliable announcement delivery, and two-phase action
//! scheduling on top of pluggable transports.

pub mod config;
pub mod delay;
pub mod driver;
pub mod engine;
pub mod link;
pub mod probe;
pub mod schedule;
