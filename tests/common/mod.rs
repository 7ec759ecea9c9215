//! Integration test common infrastructure.
//!
//! Provides an in-memory daemon harness, a scriptable fake gateway and a
//! recording notifier.

pub mod gateway;
pub mod harness;

#[allow(unused_imports)]
pub use gateway::FakeGateway;
#[allow(unused_imports)]
pub use harness::{dec, RecordingNotifier, TestHarness};
