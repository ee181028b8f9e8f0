//! In-process stand-ins for the mesh, the execution service and the
//! reputation service, driven by a seeded RNG.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use icn_mesh_jobs::{ExecutionClient, Marketplace};
use icn_types::{ExecutionReport, TaskSpec, TokenAmount, WorkerId};
use planetary_mesh::{AuctionInvite, LivenessProbe, MeshProtocolMessage, MeshTransport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Hands invites to the simulated bidders.
pub struct SimTransport {
    tx: mpsc::UnboundedSender<MeshProtocolMessage>,
}

impl SimTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeshProtocolMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MeshTransport for SimTransport {
    async fn broadcast_invite(&self, workers: &[WorkerId], invite: &AuctionInvite) -> Result<()> {
        self.tx
            .send(MeshProtocolMessage::AuctionInviteV1 {
                recipients: workers.to_vec(),
                invite: invite.clone(),
            })
            .map_err(|_| anyhow!("simulated mesh is down"))
    }
}

/// Answers every probe with a per-worker base latency plus jitter.
pub struct SimProbe {
    rng: Mutex<StdRng>,
    base_latency_ms: Mutex<HashMap<WorkerId, u64>>,
}

impl SimProbe {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed ^ 0x9e37_79b9)),
            base_latency_ms: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_latency(&self, worker: &str, ms: u64) {
        if let Ok(mut map) = self.base_latency_ms.lock() {
            map.insert(worker.to_string(), ms);
        }
    }
}

#[async_trait]
impl LivenessProbe for SimProbe {
    async fn probe(&self, worker: &WorkerId) -> Result<Duration> {
        let base = self
            .base_latency_ms
            .lock()
            .map_err(|_| anyhow!("probe state poisoned"))?
            .get(worker)
            .copied()
            .ok_or_else(|| anyhow!("unknown worker {}", worker))?;
        let jitter = self
            .rng
            .lock()
            .map_err(|_| anyhow!("probe rng poisoned"))?
            .gen_range(0..=base / 4 + 1);
        Ok(Duration::from_millis(base + jitter))
    }
}

/// Fails a configurable share of executions.
pub struct SimExecutor {
    rng: Mutex<StdRng>,
    failure_rate: f64,
}

impl SimExecutor {
    pub fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed.wrapping_add(1))),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl ExecutionClient for SimExecutor {
    async fn execute(&self, task: &TaskSpec, worker: &WorkerId) -> Result<ExecutionReport> {
        let (failed, progress, secs) = {
            let mut rng = self.rng.lock().map_err(|_| anyhow!("executor rng poisoned"))?;
            (
                rng.gen_bool(self.failure_rate),
                rng.gen_range(0.0..1.0),
                rng.gen_range(5..240u64),
            )
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let duration = Duration::from_secs(secs);
        debug!(task_id = %task.task_id, worker_id = %worker, failed, "Simulated execution finished");
        if failed {
            Ok(ExecutionReport::failure(task.task_id.clone(), worker.clone(), duration, progress))
        } else {
            Ok(ExecutionReport::success(task.task_id.clone(), worker.clone(), duration))
        }
    }
}

/// Price range a simulated worker quotes in, as fractions of the task's max price.
#[derive(Debug, Clone, Copy)]
pub struct BidProfile {
    pub floor: f64,
    pub ceiling: f64,
    /// Chance of answering an invite at all.
    pub participation: f64,
}

/// Answers invites on behalf of the simulated workers until the transport closes.
pub fn spawn_bidders(
    market: Arc<Marketplace>,
    mut invites: mpsc::UnboundedReceiver<MeshProtocolMessage>,
    profiles: HashMap<WorkerId, BidProfile>,
    seed: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(31));
        while let Some(message) = invites.recv().await {
            let MeshProtocolMessage::AuctionInviteV1 { recipients, invite } = message;
            for worker in recipients {
                let Some(profile) = profiles.get(&worker) else {
                    continue;
                };
                if !rng.gen_bool(profile.participation) {
                    continue;
                }
                let share = rng.gen_range(profile.floor..=profile.ceiling);
                let price = ((invite.max_price as f64) * share).round().max(1.0) as TokenAmount;
                let estimate = Duration::from_secs(rng.gen_range(10..200));
                if let Err(e) = market
                    .submit_bid(&invite.auction_id, &worker, price.min(invite.max_price), estimate)
                    .await
                {
                    debug!(worker_id = %worker, error = %e, "Simulated bid rejected");
                }
            }
        }
    })
}
