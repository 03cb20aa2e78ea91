//! Agent orchestration.
//!
//! Covers the lifecycle manager, per-agent locking, reconciliation of
//! records against the substrates, and ordered teardown.

pub mod cleanup;
pub mod locks;
pub mod manager;
pub mod reconcile;

pub use manager::{AgentManager, SpawnRequest, StopOutcome};
