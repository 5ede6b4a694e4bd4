//! Common types and primitives for fleetprobe
//!
//! This crate provides the poll-until retry runner, the typed topic payload
//! model, topology assertion matching and agent log policies shared by the
//! fleetprobe scenarios. It performs no I/O.

pub mod logscan;
pub mod payload;
pub mod poll;
pub mod topology;

pub use logscan::*;
pub use payload::*;
pub use poll::*;
pub use topology::*;
