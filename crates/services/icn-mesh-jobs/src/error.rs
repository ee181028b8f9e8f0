use icn_economics::LedgerError;
use planetary_mesh::DiscoveryError;
use thiserror::Error;

use crate::auction::AuctionStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuctionError {
    #[error("No eligible workers to invite")]
    NoEligibleWorkers,

    #[error("Auction not found: {0}")]
    NotFound(String),

    #[error("Auction {0} has expired")]
    AuctionExpired(String),

    #[error("Auction {id} is no longer open (status {status:?})")]
    AuctionClosed { id: String, status: AuctionStatus },

    #[error("Auction {id} received {received} bids, {required} required")]
    InsufficientBidders {
        id: String,
        received: usize,
        required: usize,
    },

    #[error("Invalid bid: {0}")]
    InvalidBid(String),

    #[error("Bidder {worker_id} has reputation {reputation}, auction requires {minimum}")]
    BelowReputationFloor {
        worker_id: String,
        reputation: f64,
        minimum: f64,
    },

    #[error("Invalid auction spec: {0}")]
    InvalidSpec(String),

    #[error("Transport unavailable: {0}")]
    Transport(String),
}

impl AuctionError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AuctionError::NoEligibleWorkers => "no_eligible_workers",
            AuctionError::NotFound(_) => "not_found",
            AuctionError::AuctionExpired(_) => "expired",
            AuctionError::AuctionClosed { .. } => "closed",
            AuctionError::InsufficientBidders { .. } => "insufficient_bidders",
            AuctionError::InvalidBid(_) => "invalid_bid",
            AuctionError::BelowReputationFloor { .. } => "below_reputation_floor",
            AuctionError::InvalidSpec(_) => "invalid_spec",
            AuctionError::Transport(_) => "transport",
        }
    }

    /// Malformed or misaddressed requests, as opposed to requests refused by
    /// auction rules or state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AuctionError::InvalidBid(_) | AuctionError::InvalidSpec(_) | AuctionError::NotFound(_)
        )
    }
}

/// Errors surfaced by the marketplace facade.
#[derive(Error, Debug)]
pub enum MarketError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Auction(#[from] AuctionError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for MarketError {
    fn from(e: config::ConfigError) -> Self {
        MarketError::Config(e.to_string())
    }
}
