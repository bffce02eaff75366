//! Test doubles for the engine's ports.
//!
//! These mocks are deterministic and fully in-memory. They are exported
//! so hosts can exercise their own wiring against the engine without a
//! live metrics source or change surface.

mod mocks;

pub use mocks::{FlakyCheckpointStore, MockChangeApplier, MockMetricsCollector};
