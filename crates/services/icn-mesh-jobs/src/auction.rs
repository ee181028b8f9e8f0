use chrono::{DateTime, Utc};
use icn_types::{AuctionKind, PeriodicTask, TaskId, TaskSpec, TokenAmount, WorkerId};
use planetary_mesh::{AuctionInvite, MeshTransport};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bid_logic::composite_score;
use crate::error::AuctionError;
use crate::metrics;

pub type AuctionId = String;

/// `Open -> Closed -> Awarded` on the happy path, otherwise
/// `Open -> Expired | InsufficientBidders | Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Open,
    Closed,
    Awarded,
    Expired,
    Canceled,
    InsufficientBidders,
}

impl AuctionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuctionStatus::Open | AuctionStatus::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Open => "open",
            AuctionStatus::Closed => "closed",
            AuctionStatus::Awarded => "awarded",
            AuctionStatus::Expired => "expired",
            AuctionStatus::Canceled => "canceled",
            AuctionStatus::InsufficientBidders => "insufficient_bidders",
        }
    }
}

/// A bid as accepted by the coordinator. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub auction_id: AuctionId,
    pub worker_id: WorkerId,
    pub price: TokenAmount,
    pub estimated_duration: Duration,
    /// Reputation snapshot taken when the bid arrived.
    pub reputation: f64,
    /// Quality snapshot taken when the bid arrived.
    pub quality: f64,
    pub submitted_at: DateTime<Utc>,
    /// Arrival order within the auction, starting at 0.
    pub sequence: u64,
    pub composite_score: f64,
}

/// Bid fields supplied by the bidder (or the transport on its behalf).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidSubmission {
    pub worker_id: WorkerId,
    pub price: TokenAmount,
    pub estimated_duration: Duration,
    pub reputation: f64,
    pub quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidAck {
    pub auction_id: AuctionId,
    pub worker_id: WorkerId,
    pub sequence: u64,
    pub composite_score: f64,
    /// Status right after the bid was stored. `Awarded` (or another terminal
    /// status) when this bid filled the auction.
    pub status: AuctionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAuction {
    pub id: AuctionId,
    pub task_id: TaskId,
    pub requester: String,
    pub kind: AuctionKind,
    pub status: AuctionStatus,
    pub reserve_price: TokenAmount,
    pub max_price: TokenAmount,
    pub min_reputation: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub execution_timeout: Duration,
    pub invited: BTreeSet<WorkerId>,
    pub bids: Vec<Bid>,
    pub winning_bid: Option<Bid>,
    pub final_price: Option<TokenAmount>,
    pub closed_at: Option<DateTime<Utc>>,
    pub max_bids: usize,
    pub min_bidders: usize,
    next_sequence: u64,
}

impl TaskAuction {
    /// Winning bid and clearing price, once awarded.
    pub fn award(&self) -> Option<(&Bid, TokenAmount)> {
        match (self.status, &self.winning_bid, self.final_price) {
            (AuctionStatus::Awarded, Some(bid), Some(price)) => Some((bid, price)),
            _ => None,
        }
    }
}

/// Parameters of one auction round.
#[derive(Debug, Clone)]
pub struct AuctionSpec {
    pub task_id: TaskId,
    pub requester: String,
    pub kind: AuctionKind,
    pub reserve_price: TokenAmount,
    pub max_price: TokenAmount,
    pub min_reputation: f64,
    pub required_capabilities: BTreeSet<String>,
    /// Falls back to [`AuctionConfig::default_duration`].
    pub duration: Option<Duration>,
    pub execution_timeout: Duration,
    /// Ranked candidates; the head of the list is invited first.
    pub candidates: Vec<WorkerId>,
    /// Overrides [`AuctionConfig::min_bidders`].
    pub min_bidders: Option<usize>,
}

impl AuctionSpec {
    pub fn from_task(task: &TaskSpec, candidates: Vec<WorkerId>, execution_timeout: Duration) -> Self {
        Self {
            task_id: task.task_id.clone(),
            requester: task.requester.clone(),
            kind: task.auction_kind,
            reserve_price: task.reserve_price,
            max_price: task.max_price,
            min_reputation: task.min_reputation,
            required_capabilities: task.required_capabilities.clone(),
            duration: task.auction_duration,
            execution_timeout,
            candidates,
            min_bidders: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuctionConfig {
    pub default_duration: Duration,
    pub sweep_interval: Duration,
    pub min_bidders: usize,
    /// Receiving this many bids closes the auction immediately.
    pub max_bids: usize,
    pub max_invited: usize,
    /// How long terminal auctions stay queryable.
    pub retention: Duration,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            min_bidders: 3,
            max_bids: 50,
            max_invited: 50,
            retention: Duration::from_secs(300),
        }
    }
}

/// What one expiry sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub resolved: Vec<(AuctionId, AuctionStatus)>,
    pub purged: usize,
}

struct AuctionSlot {
    auction: Mutex<TaskAuction>,
    status_tx: watch::Sender<AuctionStatus>,
    deadline: Instant,
}

/// Owns every auction round from invitation to award.
///
/// Each auction sits behind its own lock; the map lock is only held long
/// enough to find or insert a slot. Invites are broadcast after the auction
/// is stored and outside every lock.
pub struct AuctionCoordinator {
    auctions: RwLock<HashMap<AuctionId, Arc<AuctionSlot>>>,
    transport: Arc<dyn MeshTransport>,
    config: AuctionConfig,
}

impl AuctionCoordinator {
    pub fn new(transport: Arc<dyn MeshTransport>, config: AuctionConfig) -> Self {
        Self {
            auctions: RwLock::new(HashMap::new()),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &AuctionConfig {
        &self.config
    }

    pub async fn create_auction(&self, spec: AuctionSpec) -> Result<AuctionId, AuctionError> {
        let duration = spec.duration.unwrap_or(self.config.default_duration);
        let min_bidders = spec.min_bidders.unwrap_or(self.config.min_bidders).max(1);
        validate_spec(&spec, duration, min_bidders, self.config.max_bids)?;

        let mut seen = BTreeSet::new();
        let invited: Vec<WorkerId> = spec
            .candidates
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .take(self.config.max_invited)
            .cloned()
            .collect();
        if invited.is_empty() {
            debug!(task_id = %spec.task_id, "Auction has no candidates to invite");
            return Err(AuctionError::NoEligibleWorkers);
        }

        let window = chrono::Duration::from_std(duration)
            .map_err(|e| AuctionError::InvalidSpec(format!("duration out of range: {}", e)))?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let auction = TaskAuction {
            id: id.clone(),
            task_id: spec.task_id.clone(),
            requester: spec.requester.clone(),
            kind: spec.kind,
            status: AuctionStatus::Open,
            reserve_price: spec.reserve_price,
            max_price: spec.max_price,
            min_reputation: spec.min_reputation,
            created_at: now,
            expires_at: now + window,
            execution_timeout: spec.execution_timeout,
            invited: invited.iter().cloned().collect(),
            bids: Vec::new(),
            winning_bid: None,
            final_price: None,
            closed_at: None,
            max_bids: self.config.max_bids,
            min_bidders,
            next_sequence: 0,
        };
        let invite = AuctionInvite {
            auction_id: id.clone(),
            task_id: spec.task_id.clone(),
            requester: spec.requester.clone(),
            required_capabilities: spec.required_capabilities.clone(),
            kind: spec.kind,
            max_price: spec.max_price,
            reserve_price: spec.reserve_price,
            min_reputation: spec.min_reputation,
            expires_at: auction.expires_at,
        };

        let (status_tx, _) = watch::channel(AuctionStatus::Open);
        let slot = Arc::new(AuctionSlot {
            auction: Mutex::new(auction),
            status_tx,
            deadline: Instant::now() + duration,
        });
        self.auctions.write().await.insert(id.clone(), slot);
        metrics::record_auction_created();
        info!(
            auction_id = %id,
            task_id = %spec.task_id,
            kind = spec.kind.as_str(),
            invited = invited.len(),
            max_price = spec.max_price,
            reserve_price = spec.reserve_price,
            "Auction opened"
        );

        if let Err(e) = self.transport.broadcast_invite(&invited, &invite).await {
            warn!(auction_id = %id, error = %e, "Failed to broadcast auction invite; canceling");
            // the auction was inserted above and nothing else closes it this early
            let _ = self.cancel_auction(&id).await;
            return Err(AuctionError::Transport(e.to_string()));
        }
        Ok(id)
    }

    pub async fn submit_bid(&self, auction_id: &str, bid: BidSubmission) -> Result<BidAck, AuctionError> {
        let worker_id = bid.worker_id.clone();
        let result = self.submit_bid_inner(auction_id, bid).await;
        match &result {
            Ok(ack) => {
                metrics::record_bid_accepted();
                debug!(
                    auction_id,
                    worker_id = %ack.worker_id,
                    sequence = ack.sequence,
                    score = ack.composite_score,
                    "Bid accepted"
                );
            }
            Err(e) if e.is_validation() => {
                metrics::record_bid_rejected(e.kind());
                debug!(auction_id, worker_id = %worker_id, error = %e, "Malformed bid rejected");
            }
            Err(e) => {
                metrics::record_bid_rejected(e.kind());
                warn!(auction_id, worker_id = %worker_id, error = %e, "Bid rejected");
            }
        }
        result
    }

    async fn submit_bid_inner(&self, auction_id: &str, bid: BidSubmission) -> Result<BidAck, AuctionError> {
        let slot = self.slot(auction_id).await?;
        let mut auction = slot.auction.lock().await;
        let now = Utc::now();

        match auction.status {
            AuctionStatus::Open => {}
            AuctionStatus::Expired => return Err(AuctionError::AuctionExpired(auction_id.to_string())),
            status => {
                return Err(AuctionError::AuctionClosed {
                    id: auction_id.to_string(),
                    status,
                })
            }
        }
        if now > auction.expires_at {
            // the sweep or a waiter resolves it
            return Err(AuctionError::AuctionExpired(auction_id.to_string()));
        }
        if !auction.invited.contains(&bid.worker_id) {
            return Err(AuctionError::InvalidBid(format!(
                "{} was not invited",
                bid.worker_id
            )));
        }
        if auction.bids.iter().any(|b| b.worker_id == bid.worker_id) {
            return Err(AuctionError::InvalidBid(format!(
                "{} already bid",
                bid.worker_id
            )));
        }
        if bid.reputation < auction.min_reputation {
            return Err(AuctionError::BelowReputationFloor {
                worker_id: bid.worker_id,
                reputation: bid.reputation,
                minimum: auction.min_reputation,
            });
        }
        if bid.price == 0 {
            return Err(AuctionError::InvalidBid("price must be positive".into()));
        }
        if bid.price > auction.max_price {
            return Err(AuctionError::InvalidBid(format!(
                "price {} above maximum {}",
                bid.price, auction.max_price
            )));
        }

        let score = composite_score(
            bid.price,
            auction.max_price,
            bid.reputation,
            bid.quality,
            bid.estimated_duration,
            auction.execution_timeout,
        );
        let sequence = auction.next_sequence;
        auction.next_sequence += 1;
        auction.bids.push(Bid {
            auction_id: auction_id.to_string(),
            worker_id: bid.worker_id.clone(),
            price: bid.price,
            estimated_duration: bid.estimated_duration,
            reputation: bid.reputation,
            quality: bid.quality,
            submitted_at: now,
            sequence,
            composite_score: score,
        });

        if auction.bids.len() >= auction.max_bids {
            resolve_locked(&slot, &mut auction, now, "bid limit reached");
        }

        Ok(BidAck {
            auction_id: auction_id.to_string(),
            worker_id: bid.worker_id,
            sequence,
            composite_score: score,
            status: auction.status,
        })
    }

    /// Snapshot of the auction including every bid received so far.
    pub async fn get_auction_status(&self, auction_id: &str) -> Result<TaskAuction, AuctionError> {
        let slot = self.slot(auction_id).await?;
        let auction = slot.auction.lock().await.clone();
        Ok(auction)
    }

    /// The most recent auction held for `task_id`, if it is still retained.
    pub async fn auction_for_task(&self, task_id: &str) -> Option<TaskAuction> {
        let slots: Vec<Arc<AuctionSlot>> = self.auctions.read().await.values().cloned().collect();
        let mut latest: Option<TaskAuction> = None;
        for slot in slots {
            let auction = slot.auction.lock().await;
            if auction.task_id != task_id {
                continue;
            }
            if latest.as_ref().map_or(true, |l| auction.created_at > l.created_at) {
                latest = Some(auction.clone());
            }
        }
        latest
    }

    pub async fn cancel_auction(&self, auction_id: &str) -> Result<TaskAuction, AuctionError> {
        let slot = self.slot(auction_id).await?;
        let mut auction = slot.auction.lock().await;
        if auction.status != AuctionStatus::Open {
            return Err(AuctionError::AuctionClosed {
                id: auction_id.to_string(),
                status: auction.status,
            });
        }
        auction.status = AuctionStatus::Canceled;
        auction.closed_at = Some(Utc::now());
        slot.status_tx.send_replace(AuctionStatus::Canceled);
        metrics::record_auction_outcome(AuctionStatus::Canceled.as_str(), None);
        info!(auction_id, bids = auction.bids.len(), "Auction canceled");
        Ok(auction.clone())
    }

    /// Waits until the auction reaches a terminal status.
    ///
    /// If the window elapses before the sweep gets to it, the auction is
    /// resolved here.
    pub async fn await_resolution(&self, auction_id: &str) -> Result<TaskAuction, AuctionError> {
        let slot = self.slot(auction_id).await?;
        let mut rx = slot.status_tx.subscribe();

        tokio::select! {
            _ = wait_terminal(&mut rx) => {}
            _ = tokio::time::sleep_until(slot.deadline) => {
                let mut auction = slot.auction.lock().await;
                resolve_locked(&slot, &mut auction, Utc::now(), "window elapsed");
            }
        }

        let auction = slot.auction.lock().await.clone();
        Ok(auction)
    }

    /// Resolves every open auction whose window ended by `now` and drops
    /// terminal auctions older than the retention period.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> SweepReport {
        let slots: Vec<(AuctionId, Arc<AuctionSlot>)> = self
            .auctions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let retention = chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::zero());

        let mut report = SweepReport::default();
        let mut purge = Vec::new();
        for (id, slot) in slots {
            let mut auction = slot.auction.lock().await;
            if auction.status == AuctionStatus::Open && auction.expires_at <= now {
                resolve_locked(&slot, &mut auction, now, "window elapsed");
                report.resolved.push((id, auction.status));
            } else if auction.status.is_terminal() {
                if let Some(closed_at) = auction.closed_at {
                    if now.signed_duration_since(closed_at) >= retention {
                        purge.push(id);
                    }
                }
            }
        }

        if !purge.is_empty() {
            let mut auctions = self.auctions.write().await;
            for id in &purge {
                auctions.remove(id);
            }
            report.purged = purge.len();
        }
        if !report.resolved.is_empty() || report.purged > 0 {
            debug!(resolved = report.resolved.len(), purged = report.purged, "Auction sweep finished");
        }
        report
    }

    pub async fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Spawns the expiry sweep. Stop it with [`PeriodicTask::shutdown`].
    pub fn spawn_sweeper(self: Arc<Self>) -> PeriodicTask {
        let interval = self.config.sweep_interval;
        PeriodicTask::spawn("auction-sweeper", interval, move || {
            let coordinator = self.clone();
            async move {
                coordinator.sweep_expired().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.auctions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.auctions.read().await.is_empty()
    }

    async fn slot(&self, auction_id: &str) -> Result<Arc<AuctionSlot>, AuctionError> {
        self.auctions
            .read()
            .await
            .get(auction_id)
            .cloned()
            .ok_or_else(|| AuctionError::NotFound(auction_id.to_string()))
    }
}

fn validate_spec(
    spec: &AuctionSpec,
    duration: Duration,
    min_bidders: usize,
    max_bids: usize,
) -> Result<(), AuctionError> {
    if duration.is_zero() {
        return Err(AuctionError::InvalidSpec("duration must be positive".into()));
    }
    if spec.max_price == 0 {
        return Err(AuctionError::InvalidSpec("max price must be positive".into()));
    }
    if spec.max_price < spec.reserve_price {
        return Err(AuctionError::InvalidSpec(format!(
            "max price {} below reserve {}",
            spec.max_price, spec.reserve_price
        )));
    }
    if min_bidders > max_bids {
        return Err(AuctionError::InvalidSpec(format!(
            "min bidders {} exceeds bid limit {}",
            min_bidders, max_bids
        )));
    }
    Ok(())
}

async fn wait_terminal(rx: &mut watch::Receiver<AuctionStatus>) {
    loop {
        if rx.borrow_and_update().is_terminal() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Closes an open auction and computes its outcome. No-op otherwise.
fn resolve_locked(slot: &AuctionSlot, auction: &mut TaskAuction, now: DateTime<Utc>, reason: &str) {
    if auction.status != AuctionStatus::Open {
        return;
    }
    auction.status = AuctionStatus::Closed;
    auction.closed_at = Some(now);
    debug!(auction_id = %auction.id, bids = auction.bids.len(), reason, "Auction closed");

    let received = auction.bids.len();
    let mut clearing = None;
    auction.status = if received == 0 {
        AuctionStatus::Expired
    } else if received < auction.min_bidders {
        AuctionStatus::InsufficientBidders
    } else {
        match select_winner(&auction.bids).cloned() {
            Some(winner) => {
                let price = clearing_price(auction.kind, &winner, &auction.bids, auction.reserve_price);
                clearing = Some((price, winner.composite_score));
                auction.winning_bid = Some(winner);
                auction.final_price = Some(price);
                AuctionStatus::Awarded
            }
            None => AuctionStatus::Expired,
        }
    };

    slot.status_tx.send_replace(auction.status);
    metrics::record_auction_outcome(auction.status.as_str(), clearing);
    match auction.award() {
        Some((winner, price)) => info!(
            auction_id = %auction.id,
            task_id = %auction.task_id,
            winner = %winner.worker_id,
            bid_price = winner.price,
            clearing_price = price,
            bids = received,
            "Auction awarded"
        ),
        None => info!(
            auction_id = %auction.id,
            task_id = %auction.task_id,
            status = auction.status.as_str(),
            bids = received,
            required = auction.min_bidders,
            "Auction resolved without award"
        ),
    }
}

/// Highest composite score wins; ties go to the earliest bid.
pub fn select_winner(bids: &[Bid]) -> Option<&Bid> {
    bids.iter().min_by(|a, b| {
        b.composite_score
            .total_cmp(&a.composite_score)
            .then_with(|| a.submitted_at.cmp(&b.submitted_at))
            .then_with(|| a.sequence.cmp(&b.sequence))
    })
}

/// Price the winner pays under each auction kind.
pub fn clearing_price(kind: AuctionKind, winner: &Bid, bids: &[Bid], reserve: TokenAmount) -> TokenAmount {
    match kind {
        AuctionKind::FirstPrice => winner.price,
        AuctionKind::SecondPrice => {
            let mut prices: Vec<TokenAmount> = bids.iter().map(|b| b.price).collect();
            prices.sort_unstable_by(|a, b| b.cmp(a));
            match prices.get(1) {
                Some(second) => *second,
                None if reserve > 0 => reserve,
                None => winner.price,
            }
        }
        AuctionKind::Reserve => winner.price.max(reserve),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingTransport {
        fail: AtomicBool,
        sent: std::sync::Mutex<Vec<(Vec<WorkerId>, AuctionInvite)>>,
    }

    #[async_trait::async_trait]
    impl MeshTransport for RecordingTransport {
        async fn broadcast_invite(&self, workers: &[WorkerId], invite: &AuctionInvite) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("mesh unreachable"));
            }
            self.sent.lock().unwrap().push((workers.to_vec(), invite.clone()));
            Ok(())
        }
    }

    fn spec(candidates: &[&str]) -> AuctionSpec {
        let task = TaskSpec::new("task-1", "alice", ["gpu"], 100);
        AuctionSpec::from_task(
            &task,
            candidates.iter().map(|c| c.to_string()).collect(),
            Duration::from_secs(60),
        )
    }

    fn bid(worker: &str, price: TokenAmount, reputation: f64) -> BidSubmission {
        BidSubmission {
            worker_id: worker.to_string(),
            price,
            estimated_duration: Duration::from_secs(30),
            reputation,
            quality: 80.0,
        }
    }

    fn coordinator(config: AuctionConfig) -> (Arc<RecordingTransport>, AuctionCoordinator) {
        let transport = Arc::new(RecordingTransport::default());
        (transport.clone(), AuctionCoordinator::new(transport, config))
    }

    fn stored_bid(worker: &str, price: TokenAmount, score: f64, sequence: u64) -> Bid {
        Bid {
            auction_id: "a".into(),
            worker_id: worker.into(),
            price,
            estimated_duration: Duration::from_secs(1),
            reputation: 50.0,
            quality: 50.0,
            submitted_at: Utc::now(),
            sequence,
            composite_score: score,
        }
    }

    #[test]
    fn clearing_price_per_kind() {
        let bids = vec![
            stored_bid("a", 50, 0.9, 0),
            stored_bid("b", 45, 0.8, 1),
            stored_bid("c", 40, 0.7, 2),
        ];
        let winner = &bids[0];
        assert_eq!(clearing_price(AuctionKind::FirstPrice, winner, &bids, 0), 50);
        assert_eq!(clearing_price(AuctionKind::SecondPrice, winner, &bids, 0), 45);
        assert_eq!(clearing_price(AuctionKind::Reserve, winner, &bids, 60), 60);
        assert_eq!(clearing_price(AuctionKind::Reserve, winner, &bids, 10), 50);

        let single = vec![stored_bid("a", 50, 0.9, 0)];
        assert_eq!(clearing_price(AuctionKind::SecondPrice, &single[0], &single, 20), 20);
        assert_eq!(clearing_price(AuctionKind::SecondPrice, &single[0], &single, 0), 50);
    }

    #[test]
    fn score_ties_go_to_the_earliest_bid() {
        let mut first = stored_bid("late-id-but-first", 50, 0.5, 0);
        let mut second = stored_bid("a-second", 50, 0.5, 1);
        second.submitted_at = first.submitted_at;
        assert_eq!(select_winner(&[second.clone(), first.clone()]).unwrap().worker_id, first.worker_id);

        first.submitted_at = second.submitted_at + chrono::Duration::milliseconds(5);
        assert_eq!(select_winner(&[first, second.clone()]).unwrap().worker_id, second.worker_id);
    }

    #[tokio::test]
    async fn create_validates_spec() {
        let (_, coord) = coordinator(AuctionConfig::default());

        let mut bad = spec(&["w1"]);
        bad.reserve_price = 200;
        assert!(matches!(coord.create_auction(bad).await, Err(AuctionError::InvalidSpec(_))));

        let mut zero = spec(&["w1"]);
        zero.duration = Some(Duration::ZERO);
        assert!(matches!(coord.create_auction(zero).await, Err(AuctionError::InvalidSpec(_))));

        assert_eq!(coord.create_auction(spec(&[])).await, Err(AuctionError::NoEligibleWorkers));
        assert!(coord.is_empty().await);
    }

    #[tokio::test]
    async fn invites_are_capped_and_deduplicated() {
        let (transport, coord) = coordinator(AuctionConfig {
            max_invited: 2,
            ..AuctionConfig::default()
        });
        let id = coord.create_auction(spec(&["w1", "w1", "w2", "w3"])).await.unwrap();

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec!["w1".to_string(), "w2".to_string()]);
        assert_eq!(sent[0].1.auction_id, id);
    }

    #[tokio::test]
    async fn broadcast_failure_cancels_the_auction() {
        let (transport, coord) = coordinator(AuctionConfig::default());
        transport.fail.store(true, Ordering::SeqCst);
        let err = coord.create_auction(spec(&["w1"])).await.unwrap_err();
        assert!(matches!(err, AuctionError::Transport(_)));
    }

    #[tokio::test]
    async fn bid_validation() {
        let (_, coord) = coordinator(AuctionConfig::default());
        let mut s = spec(&["w1", "w2", "w3"]);
        s.min_reputation = 40.0;
        let id = coord.create_auction(s).await.unwrap();

        assert!(matches!(coord.submit_bid(&id, bid("stranger", 10, 90.0)).await, Err(AuctionError::InvalidBid(_))));
        assert!(matches!(
            coord.submit_bid(&id, bid("w1", 10, 39.0)).await,
            Err(AuctionError::BelowReputationFloor { .. })
        ));
        assert!(matches!(coord.submit_bid(&id, bid("w1", 101, 90.0)).await, Err(AuctionError::InvalidBid(_))));
        assert!(matches!(coord.submit_bid(&id, bid("w1", 0, 90.0)).await, Err(AuctionError::InvalidBid(_))));

        let ack = coord.submit_bid(&id, bid("w1", 100, 90.0)).await.unwrap();
        assert_eq!(ack.sequence, 0);
        assert_eq!(ack.status, AuctionStatus::Open);
        assert!(matches!(coord.submit_bid(&id, bid("w1", 90, 90.0)).await, Err(AuctionError::InvalidBid(_))));
        assert_eq!(coord.submit_bid(&id, bid("w2", 90, 90.0)).await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn reaching_max_bids_awards_immediately() {
        let (_, coord) = coordinator(AuctionConfig {
            max_bids: 3,
            ..AuctionConfig::default()
        });
        let id = coord.create_auction(spec(&["w1", "w2", "w3", "w4"])).await.unwrap();
        coord.submit_bid(&id, bid("w1", 60, 50.0)).await.unwrap();
        coord.submit_bid(&id, bid("w2", 30, 50.0)).await.unwrap();
        let ack = coord.submit_bid(&id, bid("w3", 90, 50.0)).await.unwrap();
        assert_eq!(ack.status, AuctionStatus::Awarded);

        let auction = coord.get_auction_status(&id).await.unwrap();
        let (winner, price) = auction.award().unwrap();
        assert_eq!(winner.worker_id, "w2");
        assert_eq!(price, 60);

        let late = coord.submit_bid(&id, bid("w4", 10, 50.0)).await;
        assert!(matches!(late, Err(AuctionError::AuctionClosed { status: AuctionStatus::Awarded, .. })));
    }

    #[tokio::test]
    async fn canceled_auction_rejects_bids() {
        let (_, coord) = coordinator(AuctionConfig::default());
        let id = coord.create_auction(spec(&["w1"])).await.unwrap();
        coord.cancel_auction(&id).await.unwrap();

        let err = coord.submit_bid(&id, bid("w1", 10, 50.0)).await.unwrap_err();
        assert_eq!(
            err,
            AuctionError::AuctionClosed {
                id: id.clone(),
                status: AuctionStatus::Canceled
            }
        );
        assert!(coord.cancel_auction(&id).await.is_err());
    }

    #[tokio::test]
    async fn sweep_expires_silent_auctions_and_purges_after_retention() {
        let (_, coord) = coordinator(AuctionConfig::default());
        let id = coord.create_auction(spec(&["w1"])).await.unwrap();

        let report = coord.sweep_expired_at(Utc::now()).await;
        assert!(report.resolved.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(31);
        let report = coord.sweep_expired_at(later).await;
        assert_eq!(report.resolved, vec![(id.clone(), AuctionStatus::Expired)]);
        assert_eq!(
            coord.submit_bid(&id, bid("w1", 10, 50.0)).await,
            Err(AuctionError::AuctionExpired(id.clone()))
        );

        let report = coord.sweep_expired_at(later + chrono::Duration::seconds(301)).await;
        assert_eq!(report.purged, 1);
        assert!(matches!(coord.get_auction_status(&id).await, Err(AuctionError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn await_resolution_resolves_at_the_deadline() {
        let (_, coord) = coordinator(AuctionConfig {
            min_bidders: 1,
            ..AuctionConfig::default()
        });
        let id = coord.create_auction(spec(&["w1", "w2"])).await.unwrap();
        coord.submit_bid(&id, bid("w1", 40, 70.0)).await.unwrap();

        let auction = coord.await_resolution(&id).await.unwrap();
        assert_eq!(auction.status, AuctionStatus::Awarded);
        // single second-price bid without a reserve pays its own price
        assert_eq!(auction.final_price, Some(40));
    }

    #[tokio::test]
    async fn rejections_split_malformed_from_refused() {
        let (_, coord) = coordinator(AuctionConfig::default());
        let mut s = spec(&["w1", "w2"]);
        s.min_reputation = 40.0;
        let id = coord.create_auction(s).await.unwrap();

        for err in [
            coord.submit_bid(&id, bid("stranger", 10, 90.0)).await.unwrap_err(),
            coord.submit_bid(&id, bid("w1", 0, 90.0)).await.unwrap_err(),
            coord.submit_bid(&id, bid("w1", 101, 90.0)).await.unwrap_err(),
            coord.submit_bid("missing", bid("w1", 10, 90.0)).await.unwrap_err(),
        ] {
            assert!(err.is_validation(), "{:?} should be a validation error", err);
        }

        let floor = coord.submit_bid(&id, bid("w1", 10, 39.0)).await.unwrap_err();
        assert!(!floor.is_validation());
        assert_eq!(floor.kind(), "below_reputation_floor");

        coord.cancel_auction(&id).await.unwrap();
        let closed = coord.submit_bid(&id, bid("w2", 10, 90.0)).await.unwrap_err();
        assert!(!closed.is_validation());
    }

    #[tokio::test]
    async fn auction_for_task_returns_the_latest_round() {
        let (_, coord) = coordinator(AuctionConfig::default());
        assert!(coord.auction_for_task("task-1").await.is_none());

        let first = coord.create_auction(spec(&["w1"])).await.unwrap();
        coord.cancel_auction(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = coord.create_auction(spec(&["w2"])).await.unwrap();

        let found = coord.auction_for_task("task-1").await.unwrap();
        assert_eq!(found.id, second);
        assert_eq!(found.status, AuctionStatus::Open);
        assert!(coord.auction_for_task("task-2").await.is_none());
    }
}
