use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::mesh::WorkerId;

/// Amount of tokens, in the smallest indivisible unit.
pub type TokenAmount = u64;

/// Identifier of a unit of work submitted to the marketplace.
pub type TaskId = String;

/// Pricing rule applied when an auction is awarded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuctionKind {
    /// Winner pays its own quoted price.
    FirstPrice,
    /// Vickrey auction: winner pays the second-highest quoted price.
    #[default]
    SecondPrice,
    /// Winner pays at least the reserve price.
    Reserve,
}

impl AuctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionKind::FirstPrice => "first_price",
            AuctionKind::SecondPrice => "second_price",
            AuctionKind::Reserve => "reserve",
        }
    }
}

/// A task as submitted by a requester.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub task_id: TaskId,
    /// Account that pays for the work.
    pub requester: String,
    pub required_capabilities: BTreeSet<String>,
    pub max_price: TokenAmount,
    pub reserve_price: TokenAmount,
    /// Bidders below this reputation (0-100) are rejected.
    pub min_reputation: f64,
    pub auction_kind: AuctionKind,
    /// How long the auction accepts bids. Falls back to the configured default.
    pub auction_duration: Option<Duration>,
    /// Upper bound on execution time. Falls back to the configured default.
    pub execution_timeout: Option<Duration>,
    pub preferred_region: Option<String>,
    /// Opaque payload forwarded to the execution service.
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new<I, S>(
        task_id: impl Into<TaskId>,
        requester: impl Into<String>,
        capabilities: I,
        max_price: TokenAmount,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task_id: task_id.into(),
            requester: requester.into(),
            required_capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_price,
            reserve_price: 0,
            min_reputation: 0.0,
            auction_kind: AuctionKind::default(),
            auction_duration: None,
            execution_timeout: None,
            preferred_region: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_kind(mut self, kind: AuctionKind) -> Self {
        self.auction_kind = kind;
        self
    }

    pub fn with_reserve(mut self, reserve: TokenAmount) -> Self {
        self.reserve_price = reserve;
        self
    }

    pub fn with_min_reputation(mut self, min: f64) -> Self {
        self.min_reputation = min;
        self
    }

    pub fn with_auction_duration(mut self, duration: Duration) -> Self {
        self.auction_duration = Some(duration);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.preferred_region = Some(region.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failure => "failure",
        }
    }
}

/// Result reported by the execution service for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub outcome: ExecutionOutcome,
    pub cost_actual: TokenAmount,
    pub duration: Duration,
    /// Fraction of the work completed, 0.0 to 1.0.
    pub progress: f64,
}

impl ExecutionReport {
    pub fn success(task_id: impl Into<TaskId>, worker_id: impl Into<WorkerId>, duration: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            outcome: ExecutionOutcome::Success,
            cost_actual: 0,
            duration,
            progress: 1.0,
        }
    }

    pub fn failure(
        task_id: impl Into<TaskId>,
        worker_id: impl Into<WorkerId>,
        duration: Duration,
        progress: f64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            outcome: ExecutionOutcome::Failure,
            cost_actual: 0,
            duration,
            progress: progress.clamp(0.0, 1.0),
        }
    }
}
