//! Worker discovery and liveness tracking for the mesh marketplace.

pub mod health;
pub mod index;
pub mod metrics;
pub mod protocol;

use thiserror::Error;

pub use health::{HealthConfig, HealthMonitor, HealthReport};
pub use index::{CapabilityIndex, RankedWorker, StatusChange};
pub use protocol::{AuctionInvite, LivenessProbe, MeshProtocolMessage, MeshTransport};

/// Error types specific to discovery
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("Invalid discovery query: {0}")]
    InvalidQuery(String),

    #[error("Invalid worker record: {0}")]
    InvalidRecord(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),
}
