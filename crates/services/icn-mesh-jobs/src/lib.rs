//! Auctions, settlement and the end-to-end allocation flow of the mesh
//! compute marketplace.

pub mod auction;
pub mod bid_logic;
pub mod config;
pub mod error;
pub mod execution;
pub mod marketplace;
pub mod metrics;
pub mod reputation_cache;
pub mod reputation_client;
pub mod settlement;

pub use auction::{
    AuctionConfig, AuctionCoordinator, AuctionId, AuctionSpec, AuctionStatus, Bid, BidAck,
    BidSubmission, SweepReport, TaskAuction,
};
pub use config::MarketConfig;
pub use error::{AuctionError, MarketError};
pub use execution::ExecutionClient;
pub use marketplace::{
    Allocation, AllocationResult, Marketplace, MarketplaceDeps, NotAllocatedReason, RefundReason,
};
pub use reputation_cache::CachingReputationClient;
pub use reputation_client::{DefaultReputationClient, InMemoryReputationClient, ReputationClient};
pub use settlement::{
    EscrowHandle, FailurePenaltyPolicy, Settlement, SettlementConfig, SettlementCoordinator,
    SettlementInput,
};
