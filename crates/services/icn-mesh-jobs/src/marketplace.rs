use icn_economics::{EscrowLedger, LedgerStore, SledLedgerStore};
use icn_types::{
    DiscoveryQuery, ExecutionOutcome, PeriodicTask, TaskSpec, TokenAmount, WorkerId, WorkerRecord,
    WorkerStatus,
};
use planetary_mesh::{CapabilityIndex, HealthMonitor, LivenessProbe, MeshTransport, RankedWorker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auction::{
    AuctionCoordinator, AuctionId, AuctionSpec, AuctionStatus, BidAck, BidSubmission, TaskAuction,
};
use crate::config::MarketConfig;
use crate::error::{AuctionError, MarketError};
use crate::execution::ExecutionClient;
use crate::metrics;
use crate::reputation_client::ReputationClient;
use crate::settlement::{EscrowHandle, Settlement, SettlementCoordinator, SettlementInput};

/// External collaborators the marketplace drives.
#[derive(Clone)]
pub struct MarketplaceDeps {
    pub transport: Arc<dyn MeshTransport>,
    pub probe: Arc<dyn LivenessProbe>,
    pub executor: Arc<dyn ExecutionClient>,
    pub reputation: Arc<dyn ReputationClient>,
    /// Overrides `ledger_store_path`. The ledger is rebuilt from it on start.
    pub ledger_store: Option<Arc<dyn LedgerStore>>,
}

/// Why an allocation never reached the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotAllocatedReason {
    InvalidRequest { detail: String },
    NoEligibleWorkers { found: usize, required: usize },
    InsufficientBidders { received: usize, required: usize },
    NoBids,
    AuctionCanceled,
    TransportUnavailable { detail: String },
    PaymentRejected { detail: String },
}

/// Why a funded escrow went back to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RefundReason {
    ExecutionFailed { progress: f64 },
    TimedOut,
    ExecutorError { detail: String },
    /// The escrow-hold watchdog refunded before the result was settled.
    EscrowExpired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub task_id: String,
    pub auction_id: AuctionId,
    pub worker_id: WorkerId,
    pub bid_price: TokenAmount,
    pub clearing_price: TokenAmount,
    pub escrow: EscrowHandle,
    pub settlement: Settlement,
}

/// Terminal result of one allocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AllocationResult {
    Settled(Allocation),
    Refunded {
        allocation: Allocation,
        reason: RefundReason,
    },
    NotAllocated {
        reason: NotAllocatedReason,
    },
}

impl AllocationResult {
    pub fn label(&self) -> &'static str {
        match self {
            AllocationResult::Settled(_) => "settled",
            AllocationResult::Refunded { .. } => "refunded",
            AllocationResult::NotAllocated { .. } => "not_allocated",
        }
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        match self {
            AllocationResult::Settled(a) | AllocationResult::Refunded { allocation: a, .. } => Some(a),
            AllocationResult::NotAllocated { .. } => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, AllocationResult::Settled(_))
    }
}

/// Composes discovery, auctions, escrow and settlement into one flow.
///
/// Owns one instance of every core component and the background tasks that
/// keep them healthy.
pub struct Marketplace {
    config: MarketConfig,
    index: Arc<CapabilityIndex>,
    health: Arc<HealthMonitor>,
    auctions: Arc<AuctionCoordinator>,
    ledger: Arc<EscrowLedger>,
    settlement: Arc<SettlementCoordinator>,
    executor: Arc<dyn ExecutionClient>,
    reputation: Arc<dyn ReputationClient>,
    background: Mutex<Vec<PeriodicTask>>,
}

impl Marketplace {
    pub async fn new(config: MarketConfig, deps: MarketplaceDeps) -> Result<Self, MarketError> {
        config.validate()?;

        let store: Option<Arc<dyn LedgerStore>> = match (&deps.ledger_store, &config.ledger_store_path) {
            (Some(store), _) => Some(store.clone()),
            (None, Some(path)) => Some(Arc::new(SledLedgerStore::open(path)?) as Arc<dyn LedgerStore>),
            (None, None) => None,
        };
        let ledger = match store {
            Some(store) => Arc::new(EscrowLedger::restore(store, config.ledger()).await?),
            None => Arc::new(EscrowLedger::new(config.ledger())),
        };

        let index = Arc::new(CapabilityIndex::new(config.discovery_reference_response_ms));
        let health = Arc::new(HealthMonitor::new(index.clone(), deps.probe, config.health()));
        let auctions = Arc::new(AuctionCoordinator::new(deps.transport, config.auction()));
        let settlement = Arc::new(SettlementCoordinator::new(
            ledger.clone(),
            deps.reputation.clone(),
            config.settlement(),
        ));

        Ok(Self {
            config,
            index,
            health,
            auctions,
            ledger,
            settlement,
            executor: deps.executor,
            reputation: deps.reputation,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<CapabilityIndex> {
        &self.index
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn auctions(&self) -> &Arc<AuctionCoordinator> {
        &self.auctions
    }

    pub fn ledger(&self) -> &Arc<EscrowLedger> {
        &self.ledger
    }

    pub fn settlement(&self) -> &Arc<SettlementCoordinator> {
        &self.settlement
    }

    /// Starts the health monitor, the auction sweep and the escrow watchdog.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            debug!("Marketplace background tasks already running");
            return;
        }
        background.push(self.health.clone().spawn());
        background.push(self.auctions.clone().spawn_sweeper());
        background.push(self.settlement.clone().spawn_watchdog());
        info!(tasks = background.len(), "Marketplace background tasks started");
    }

    /// Stops every background task and waits for them to finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<PeriodicTask> = self.background.lock().await.drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            task.shutdown().await;
        }
        info!(tasks = count, "Marketplace background tasks stopped");
    }

    // ---- workers --------------------------------------------------------

    /// Registers a worker, refreshing its reputation snapshot first.
    pub async fn register_worker(&self, mut record: WorkerRecord) -> Result<(), MarketError> {
        match self.reputation.get_score(&record.id).await {
            Ok(score) => record.reputation = score,
            Err(e) => warn!(worker_id = %record.id, error = %e, "Reputation lookup failed; keeping supplied score"),
        }
        self.index.register(record).await?;
        Ok(())
    }

    pub async fn unregister_worker(&self, id: &str) -> Result<WorkerRecord, MarketError> {
        Ok(self.index.unregister(id).await?)
    }

    pub async fn set_worker_status(&self, id: &str, status: WorkerStatus) -> Result<(), MarketError> {
        Ok(self.index.update_status(id, status).await?)
    }

    /// Pulls a fresh score from the reputation service into the index.
    pub async fn refresh_reputation(&self, id: &str) -> Result<f64, MarketError> {
        let score = self.reputation.get_score(&id.to_string()).await?;
        self.index.update_reputation(id, score).await?;
        Ok(score)
    }

    /// A discovery query for `capabilities` carrying the configured
    /// utilization ceiling and result limit.
    pub fn query_for<I, S>(&self, capabilities: I) -> DiscoveryQuery
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DiscoveryQuery::for_capabilities(capabilities)
            .max_utilization(self.config.discovery_default_max_utilization)
            .limit(self.config.discovery_default_limit)
    }

    pub async fn discover(&self, query: &DiscoveryQuery) -> Result<Vec<WorkerRecord>, MarketError> {
        let ranked = self.index.query(query).await?;
        Ok(ranked.into_iter().map(|r| r.record).collect())
    }

    // ---- auctions -------------------------------------------------------

    /// Opens an auction for `task` and invites the best-matching workers.
    pub async fn create_auction(&self, task: &TaskSpec) -> Result<AuctionId, MarketError> {
        let candidates = self.candidates(task).await?;
        let spec = AuctionSpec::from_task(
            task,
            candidates.into_iter().map(|c| c.record.id).collect(),
            self.execution_timeout(task),
        );
        Ok(self.auctions.create_auction(spec).await?)
    }

    /// Submits a bid, attaching the bidder's current reputation and quality.
    pub async fn submit_bid(
        &self,
        auction_id: &str,
        worker_id: &str,
        price: TokenAmount,
        estimated_duration: Duration,
    ) -> Result<BidAck, MarketError> {
        let record = self.index.get(worker_id).await.ok_or_else(|| {
            AuctionError::InvalidBid(format!("{} is not a registered worker", worker_id))
        })?;
        let bid = BidSubmission {
            worker_id: record.id,
            price,
            estimated_duration,
            reputation: record.reputation,
            quality: record.quality,
        };
        Ok(self.auctions.submit_bid(auction_id, bid).await?)
    }

    pub async fn get_auction_status(&self, auction_id: &str) -> Result<TaskAuction, MarketError> {
        Ok(self.auctions.get_auction_status(auction_id).await?)
    }

    pub async fn cancel_auction(&self, auction_id: &str) -> Result<TaskAuction, MarketError> {
        Ok(self.auctions.cancel_auction(auction_id).await?)
    }

    pub async fn auction_for_task(&self, task_id: &str) -> Option<TaskAuction> {
        self.auctions.auction_for_task(task_id).await
    }

    // ---- accounts -------------------------------------------------------

    pub async fn deposit(&self, owner: &str, amount: TokenAmount) -> Result<TokenAmount, MarketError> {
        Ok(self.ledger.deposit(owner, amount).await?)
    }

    pub async fn withdraw(&self, owner: &str, amount: TokenAmount) -> Result<TokenAmount, MarketError> {
        Ok(self.ledger.withdraw(owner, amount).await?)
    }

    pub async fn get_balance(&self, owner: &str) -> Result<TokenAmount, MarketError> {
        Ok(self.ledger.get_balance(owner).await?)
    }

    // ---- end to end -----------------------------------------------------

    /// Runs discover, auction, escrow, execution and settlement for one task.
    ///
    /// Every attempt ends as settled, refunded or not allocated. `Err` is
    /// reserved for ledger failures that freeze an entity or lose a write.
    pub async fn allocate_and_settle(&self, task: &TaskSpec) -> Result<AllocationResult, MarketError> {
        let result = self.allocate_and_settle_inner(task).await;
        match &result {
            Ok(outcome) => {
                metrics::record_allocation(outcome.label());
                info!(task_id = %task.task_id, result = outcome.label(), "Allocation finished");
            }
            Err(e) => {
                metrics::record_allocation("error");
                warn!(task_id = %task.task_id, error = %e, "Allocation aborted");
            }
        }
        result
    }

    async fn allocate_and_settle_inner(&self, task: &TaskSpec) -> Result<AllocationResult, MarketError> {
        let timeout = self.execution_timeout(task);
        if timeout >= self.settlement.config().escrow_max_hold {
            return Ok(not_allocated(NotAllocatedReason::InvalidRequest {
                detail: format!(
                    "execution timeout {:?} must be shorter than the escrow hold {:?}",
                    timeout,
                    self.settlement.config().escrow_max_hold
                ),
            }));
        }

        let candidates = match self.candidates(task).await {
            Ok(c) => c,
            Err(MarketError::Discovery(e)) => {
                return Ok(not_allocated(NotAllocatedReason::InvalidRequest {
                    detail: e.to_string(),
                }))
            }
            Err(e) => return Err(e),
        };
        let required = self.auctions.config().min_bidders;
        if candidates.len() < required {
            debug!(task_id = %task.task_id, found = candidates.len(), required, "Too few eligible workers");
            return Ok(not_allocated(NotAllocatedReason::NoEligibleWorkers {
                found: candidates.len(),
                required,
            }));
        }

        // ---- auction
        let spec = AuctionSpec::from_task(
            task,
            candidates.into_iter().map(|c| c.record.id).collect(),
            timeout,
        );
        let auction_id = match self.auctions.create_auction(spec).await {
            Ok(id) => id,
            Err(e) => return Ok(not_allocated(auction_failure(e))),
        };
        let auction = self.auctions.await_resolution(&auction_id).await?;
        let (winner, clearing_price) = match auction.award() {
            Some((bid, price)) => (bid.clone(), price),
            None => {
                let reason = match auction.status {
                    AuctionStatus::InsufficientBidders => NotAllocatedReason::InsufficientBidders {
                        received: auction.bids.len(),
                        required: auction.min_bidders,
                    },
                    AuctionStatus::Canceled => NotAllocatedReason::AuctionCanceled,
                    _ => NotAllocatedReason::NoBids,
                };
                return Ok(not_allocated(reason));
            }
        };

        // ---- escrow
        let escrow = match self
            .settlement
            .open_escrow(
                &task.requester,
                &winner.worker_id,
                clearing_price,
                &task.task_id,
                Some(&auction_id),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                return Ok(not_allocated(NotAllocatedReason::PaymentRejected {
                    detail: e.to_string(),
                }))
            }
        };

        // ---- execution, outside every lock
        self.adjust_load(&winner.worker_id, 1).await;
        let input = match tokio::time::timeout(timeout, self.executor.execute(task, &winner.worker_id)).await {
            Ok(Ok(report)) => SettlementInput::Completed(report),
            Ok(Err(e)) => {
                warn!(task_id = %task.task_id, worker_id = %winner.worker_id, error = %e, "Execution failed");
                SettlementInput::ExecutorError(e.to_string())
            }
            Err(_) => {
                warn!(task_id = %task.task_id, worker_id = %winner.worker_id, ?timeout, "Execution timed out");
                SettlementInput::TimedOut
            }
        };
        self.adjust_load(&winner.worker_id, -1).await;

        // ---- settlement
        let requested = input.outcome();
        let settlement = self.settlement.settle(&escrow, input.clone(), timeout).await?;
        let refund_reason = if settlement.receipt.outcome == ExecutionOutcome::Success {
            None
        } else {
            Some(match input {
                _ if requested == ExecutionOutcome::Success => RefundReason::EscrowExpired,
                SettlementInput::Completed(report) => RefundReason::ExecutionFailed {
                    progress: report.progress,
                },
                SettlementInput::TimedOut => RefundReason::TimedOut,
                SettlementInput::ExecutorError(detail) => RefundReason::ExecutorError { detail },
            })
        };

        let allocation = Allocation {
            task_id: task.task_id.clone(),
            auction_id,
            worker_id: winner.worker_id.clone(),
            bid_price: winner.price,
            clearing_price,
            escrow,
            settlement,
        };
        Ok(match refund_reason {
            None => AllocationResult::Settled(allocation),
            Some(reason) => AllocationResult::Refunded { allocation, reason },
        })
    }

    async fn candidates(&self, task: &TaskSpec) -> Result<Vec<RankedWorker>, MarketError> {
        // invitations are capped by the auction, not the discovery default
        let mut query = self
            .query_for(task.required_capabilities.iter().cloned())
            .min_reputation(task.min_reputation)
            .limit(self.config.auction_max_invited);
        if let Some(region) = &task.preferred_region {
            query = query.prefer_region(region.clone());
        }
        Ok(self.index.query(&query).await?)
    }

    fn execution_timeout(&self, task: &TaskSpec) -> Duration {
        task.execution_timeout.unwrap_or_else(|| self.config.execution_timeout())
    }

    async fn adjust_load(&self, worker: &str, delta: i64) {
        if let Err(e) = self.index.update_load(worker, delta).await {
            // unregistered mid-task
            debug!(worker_id = worker, delta, error = %e, "Load update skipped");
        }
    }
}

fn not_allocated(reason: NotAllocatedReason) -> AllocationResult {
    AllocationResult::NotAllocated { reason }
}

fn auction_failure(e: AuctionError) -> NotAllocatedReason {
    match e {
        AuctionError::NoEligibleWorkers => NotAllocatedReason::NoEligibleWorkers { found: 0, required: 1 },
        AuctionError::Transport(detail) => NotAllocatedReason::TransportUnavailable { detail },
        other => NotAllocatedReason::InvalidRequest {
            detail: other.to_string(),
        },
    }
}
