//! Common test utilities for edge-uplink integration tests

#[allow(dead_code)]
pub mod assertions;
#[allow(dead_code)]
pub mod collector;

#[allow(unused_imports)]
pub use assertions::*;
pub use collector::*;
