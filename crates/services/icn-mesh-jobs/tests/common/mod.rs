#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use icn_mesh_jobs::{
    ExecutionClient, InMemoryReputationClient, MarketConfig, Marketplace, MarketplaceDeps,
};
use icn_types::{ExecutionReport, TaskSpec, TokenAmount, WorkerId, WorkerRecord};
use planetary_mesh::{AuctionInvite, LivenessProbe, MeshTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const CAPABILITY: &str = "vision-analysis";

/// Forwards invites to the simulated bidders.
pub struct SimTransport {
    tx: mpsc::UnboundedSender<(Vec<WorkerId>, AuctionInvite)>,
}

#[async_trait]
impl MeshTransport for SimTransport {
    async fn broadcast_invite(&self, workers: &[WorkerId], invite: &AuctionInvite) -> Result<()> {
        self.tx
            .send((workers.to_vec(), invite.clone()))
            .map_err(|_| anyhow!("bidders are gone"))
    }
}

pub struct StaticProbe;

#[async_trait]
impl LivenessProbe for StaticProbe {
    async fn probe(&self, _worker: &WorkerId) -> Result<Duration> {
        Ok(Duration::from_millis(20))
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Duration),
    Fail(f64),
    Crash,
    Hang,
}

pub struct ScriptedExecutor {
    behavior: Mutex<Behavior>,
    pub calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl ExecutionClient for ScriptedExecutor {
    async fn execute(&self, task: &TaskSpec, worker: &WorkerId) -> Result<ExecutionReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            Behavior::Succeed(d) => Ok(ExecutionReport::success(task.task_id.clone(), worker.clone(), d)),
            Behavior::Fail(progress) => Ok(ExecutionReport::failure(
                task.task_id.clone(),
                worker.clone(),
                Duration::from_secs(2),
                progress,
            )),
            Behavior::Crash => Err(anyhow!("worker process crashed")),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err(anyhow!("hung executor woke up"))
            }
        }
    }
}

pub struct Harness {
    pub market: Arc<Marketplace>,
    pub reputation: Arc<InMemoryReputationClient>,
    pub executor: Arc<ScriptedExecutor>,
    bids: Arc<Mutex<HashMap<WorkerId, (TokenAmount, Duration)>>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(MarketConfig {
            ledger_verify_after_mutation: true,
            ..MarketConfig::default()
        })
        .await
    }

    pub async fn with_config(config: MarketConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reputation = Arc::new(InMemoryReputationClient::new());
        let executor = Arc::new(ScriptedExecutor {
            behavior: Mutex::new(Behavior::Succeed(Duration::from_secs(5))),
            calls: AtomicUsize::new(0),
        });
        let deps = MarketplaceDeps {
            transport: Arc::new(SimTransport { tx }),
            probe: Arc::new(StaticProbe),
            executor: executor.clone(),
            reputation: reputation.clone(),
            ledger_store: None,
        };
        let market = Arc::new(Marketplace::new(config, deps).await.unwrap());
        let bids: Arc<Mutex<HashMap<WorkerId, (TokenAmount, Duration)>>> = Arc::default();

        let bidder_market = market.clone();
        let bidder_script = bids.clone();
        tokio::spawn(async move {
            while let Some((workers, invite)) = rx.recv().await {
                for worker in workers {
                    let script = bidder_script.lock().unwrap().get(&worker).cloned();
                    if let Some((price, estimate)) = script {
                        let _ = bidder_market
                            .submit_bid(&invite.auction_id, &worker, price, estimate)
                            .await;
                    }
                }
            }
        });

        Self {
            market,
            reputation,
            executor,
            bids,
        }
    }

    /// Registers a worker that answers every invite with `price`.
    pub async fn bidder(&self, id: &str, reputation: f64, price: TokenAmount) {
        self.silent_worker(id, reputation).await;
        self.bids
            .lock()
            .unwrap()
            .insert(id.to_string(), (price, Duration::from_secs(10)));
    }

    /// Registers a worker that never bids.
    pub async fn silent_worker(&self, id: &str, reputation: f64) {
        self.reputation.set_score(id, reputation).await;
        self.market
            .register_worker(WorkerRecord::new(id, [CAPABILITY]).with_quality(80.0))
            .await
            .unwrap();
    }
}

pub fn vision_task(id: &str) -> TaskSpec {
    TaskSpec::new(id, "requester", [CAPABILITY], 500)
}
