//! Per-(partition, region) health tracking: the partition-level circuit
//! breaker.
//!
//! The decision logic lives in `state` as a pure state machine (current
//! state + event in, new state + decision out; the clock is a parameter).
//! [tracker] wraps it in a sharded-lock concurrent map, which serves both
//! the threaded and the cooperative (async) client: no suspension point
//! ever occurs between reading and committing a transition.

pub(crate) mod state;
pub mod tracker;

pub use state::HealthStatus;
pub use tracker::{PartitionHealthTracker, ProbePermit, RegionAvailability};
