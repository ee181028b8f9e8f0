pub mod jobs;
pub mod mesh;
pub mod periodic;
pub mod reputation;

pub use jobs::{AuctionKind, ExecutionOutcome, ExecutionReport, TaskId, TaskSpec, TokenAmount};
pub use mesh::{DiscoveryQuery, WorkerId, WorkerRecord, WorkerStatus};
pub use periodic::PeriodicTask;
pub use reputation::{normalize_percent, ReputationReason, ReputationUpdate};
