use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use icn_types::{AuctionKind, TaskId, TokenAmount, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Messages the marketplace pushes onto the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MeshProtocolMessage {
    /// Asks the listed workers to bid on a task.
    AuctionInviteV1 {
        recipients: Vec<WorkerId>,
        invite: AuctionInvite,
    },
}

/// Invitation to bid, delivered to every candidate selected by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuctionInvite {
    pub auction_id: String,
    pub task_id: TaskId,
    pub requester: String,
    pub required_capabilities: BTreeSet<String>,
    pub kind: AuctionKind,
    /// Bids above this price are rejected.
    pub max_price: TokenAmount,
    pub reserve_price: TokenAmount,
    pub min_reputation: f64,
    /// Bids arriving after this instant are rejected.
    pub expires_at: DateTime<Utc>,
}

/// Propagates marketplace messages to workers.
///
/// The marketplace never dials workers directly; bids come back through
/// whatever acknowledgement stream the transport feeds into the auction.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn broadcast_invite(&self, workers: &[WorkerId], invite: &AuctionInvite) -> Result<()>;
}

/// Sends a liveness probe to a single worker and returns the round-trip time.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, worker: &WorkerId) -> Result<Duration>;
}
