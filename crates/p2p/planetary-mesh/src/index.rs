use chrono::Utc;
use icn_types::{normalize_percent, DiscoveryQuery, WorkerId, WorkerRecord, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::DiscoveryError;

/// Weights of the discovery match score.
const W_REPUTATION: f64 = 0.30;
const W_QUALITY: f64 = 0.25;
const W_IDLE: f64 = 0.20;
const W_RESPONSE: f64 = 0.15;
const W_REGION: f64 = 0.10;

/// Region component for a worker outside the preferred region.
const REGION_MISMATCH_SCORE: f64 = 0.5;

pub const DEFAULT_REFERENCE_RESPONSE_MS: f64 = 100.0;

/// A discovery hit together with its match score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedWorker {
    pub record: WorkerRecord,
    pub score: f64,
}

/// Status transition applied by a health or load update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: WorkerStatus,
    pub to: WorkerStatus,
}

#[derive(Default)]
struct IndexState {
    workers: HashMap<WorkerId, WorkerRecord>,
    by_capability: HashMap<String, HashSet<WorkerId>>,
}

impl IndexState {
    fn unlink(&mut self, record: &WorkerRecord) {
        for cap in &record.capabilities {
            if let Some(set) = self.by_capability.get_mut(cap) {
                set.remove(&record.id);
                if set.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
    }

    fn link(&mut self, record: &WorkerRecord) {
        for cap in &record.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(record.id.clone());
        }
    }

    fn status_counts(&self) -> HashMap<WorkerStatus, usize> {
        let mut counts = HashMap::new();
        for worker in self.workers.values() {
            *counts.entry(worker.status).or_insert(0) += 1;
        }
        counts
    }

    fn publish_counts(&self) {
        let online = self
            .status_counts()
            .get(&WorkerStatus::Online)
            .copied()
            .unwrap_or(0);
        metrics::set_worker_counts(self.workers.len(), online);
    }

    /// Ids holding every required capability. The smallest posting set drives the scan.
    fn intersect(&self, required: &[&String]) -> Vec<&WorkerId> {
        let mut sets = Vec::with_capacity(required.len());
        for cap in required {
            match self.by_capability.get(*cap) {
                Some(set) => sets.push(set),
                None => return Vec::new(),
            }
        }
        if sets.is_empty() {
            return Vec::new();
        }
        sets.sort_by_key(|s| s.len());
        let smallest: &HashSet<WorkerId> = sets[0];
        let rest = &sets[1..];
        smallest
            .iter()
            .filter(|id| rest.iter().all(|s| s.contains(*id)))
            .collect()
    }
}

/// Inverted index from capability tag to registered workers.
///
/// Queries share a read lock and never wait on each other; registration,
/// status and load updates take the write lock for the duration of an
/// in-memory update only.
pub struct CapabilityIndex {
    state: RwLock<IndexState>,
    reference_response_ms: f64,
}

impl Default for CapabilityIndex {
    fn default() -> Self {
        Self::new(DEFAULT_REFERENCE_RESPONSE_MS)
    }
}

impl CapabilityIndex {
    /// `reference_response_ms` is the response time that scores 0.5 on the
    /// response component.
    pub fn new(reference_response_ms: f64) -> Self {
        let reference_response_ms = if reference_response_ms > 0.0 {
            reference_response_ms
        } else {
            DEFAULT_REFERENCE_RESPONSE_MS
        };
        Self {
            state: RwLock::new(IndexState::default()),
            reference_response_ms,
        }
    }

    /// Adds a worker, replacing any previous record with the same id.
    pub async fn register(&self, record: WorkerRecord) -> Result<(), DiscoveryError> {
        if record.id.is_empty() {
            return Err(DiscoveryError::InvalidRecord("worker id is empty".into()));
        }
        if record.capabilities.is_empty() {
            return Err(DiscoveryError::InvalidRecord(format!(
                "worker {} advertises no capabilities",
                record.id
            )));
        }
        let mut record = record;
        record.capacity = record.capacity.max(1);

        let mut state = self.state.write().await;
        if let Some(old) = state.workers.remove(&record.id) {
            state.unlink(&old);
        }
        state.link(&record);
        info!(
            worker_id = %record.id,
            capabilities = ?record.capabilities,
            region = ?record.region,
            "Worker registered"
        );
        state.workers.insert(record.id.clone(), record);
        state.publish_counts();
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<WorkerRecord, DiscoveryError> {
        let mut state = self.state.write().await;
        let record = state
            .workers
            .remove(id)
            .ok_or_else(|| DiscoveryError::WorkerNotFound(id.to_string()))?;
        state.unlink(&record);
        state.publish_counts();
        info!(worker_id = %id, "Worker unregistered");
        Ok(record)
    }

    /// Operator-driven status change, e.g. entering or leaving maintenance.
    pub async fn update_status(&self, id: &str, status: WorkerStatus) -> Result<(), DiscoveryError> {
        let mut state = self.state.write().await;
        let record = state
            .workers
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::WorkerNotFound(id.to_string()))?;
        let from = record.status;
        record.status = status;
        if status == WorkerStatus::Online {
            record.consecutive_failures = 0;
        }
        state.publish_counts();
        if from != status {
            info!(worker_id = %id, from = from.as_str(), to = status.as_str(), "Worker status updated");
        }
        Ok(())
    }

    /// Adjusts a worker's load by `delta`, saturating at zero. Returns the new load.
    ///
    /// An online worker at capacity becomes busy; a busy worker below
    /// capacity comes back online. Offline and maintenance are left alone.
    pub async fn update_load(&self, id: &str, delta: i64) -> Result<u32, DiscoveryError> {
        let mut state = self.state.write().await;
        let record = state
            .workers
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::WorkerNotFound(id.to_string()))?;
        let load = (record.load as i64 + delta).clamp(0, u32::MAX as i64) as u32;
        record.load = load;
        let from = record.status;
        match record.status {
            WorkerStatus::Online if load >= record.capacity => record.status = WorkerStatus::Busy,
            WorkerStatus::Busy if load < record.capacity => record.status = WorkerStatus::Online,
            _ => {}
        }
        let to = record.status;
        state.publish_counts();
        if from != to {
            debug!(worker_id = %id, load, from = from.as_str(), to = to.as_str(), "Load changed worker status");
        }
        Ok(load)
    }

    /// Refreshes the reputation snapshot supplied by the reputation service.
    pub async fn update_reputation(&self, id: &str, reputation: f64) -> Result<(), DiscoveryError> {
        let mut state = self.state.write().await;
        let record = state
            .workers
            .get_mut(id)
            .ok_or_else(|| DiscoveryError::WorkerNotFound(id.to_string()))?;
        record.reputation = reputation;
        Ok(())
    }

    /// Applies a successful probe: resets the failure counter, folds `rtt`
    /// into the moving average and brings an offline worker back.
    pub async fn record_probe_success(
        &self,
        id: &str,
        rtt: Duration,
        alpha: f64,
    ) -> Option<StatusChange> {
        let mut state = self.state.write().await;
        let record = state.workers.get_mut(id)?;
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        record.avg_response_ms = if record.avg_response_ms <= 0.0 {
            rtt_ms
        } else {
            alpha * rtt_ms + (1.0 - alpha) * record.avg_response_ms
        };
        record.consecutive_failures = 0;
        record.last_seen = Utc::now();

        let from = record.status;
        if from == WorkerStatus::Offline {
            record.status = if record.load >= record.capacity {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Online
            };
        }
        let change = (from != record.status).then_some(StatusChange {
            from,
            to: record.status,
        });
        if change.is_some() {
            info!(worker_id = %id, avg_response_ms = record.avg_response_ms, "Worker back online");
            state.publish_counts();
        }
        change
    }

    /// Applies a failed probe; after `max_failures` in a row the worker goes offline.
    pub async fn record_probe_failure(&self, id: &str, max_failures: u32) -> Option<StatusChange> {
        let mut state = self.state.write().await;
        let record = state.workers.get_mut(id)?;
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        let from = record.status;
        if record.consecutive_failures >= max_failures && from.accepts_work() {
            record.status = WorkerStatus::Offline;
            warn!(
                worker_id = %id,
                failures = record.consecutive_failures,
                "Worker marked offline after consecutive probe failures"
            );
            state.publish_counts();
            return Some(StatusChange {
                from,
                to: WorkerStatus::Offline,
            });
        }
        None
    }

    pub async fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.state.read().await.workers.get(id).cloned()
    }

    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        self.state.read().await.workers.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.workers.is_empty()
    }

    /// Number of registered workers in each status. Absent statuses have no entry.
    pub async fn status_counts(&self) -> HashMap<WorkerStatus, usize> {
        self.state.read().await.status_counts()
    }

    /// Ranked workers that hold every requested capability and pass the filters.
    ///
    /// Ordering is by score, then lower response time, then id. An empty
    /// result is not an error.
    pub async fn query(&self, query: &DiscoveryQuery) -> Result<Vec<RankedWorker>, DiscoveryError> {
        let started = Instant::now();
        let result = self.query_inner(query).await;
        metrics::observe_query(started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    async fn query_inner(&self, query: &DiscoveryQuery) -> Result<Vec<RankedWorker>, DiscoveryError> {
        validate_query(query)?;
        let required: Vec<&String> = query.capabilities.iter().collect();

        let state = self.state.read().await;
        let mut ranked: Vec<RankedWorker> = state
            .intersect(&required)
            .into_iter()
            .filter_map(|id| state.workers.get(id))
            .filter(|w| passes_filters(w, query))
            .map(|w| RankedWorker {
                score: self.match_score(w, query.preferred_region.as_deref()),
                record: w.clone(),
            })
            .collect();
        drop(state);

        ranked.sort_by(compare_ranked);
        ranked.truncate(query.limit);
        debug!(
            capabilities = ?query.capabilities,
            matches = ranked.len(),
            "Discovery query served"
        );
        Ok(ranked)
    }

    /// 0.30 reputation + 0.25 quality + 0.20 idle capacity + 0.15 response + 0.10 region.
    pub fn match_score(&self, worker: &WorkerRecord, preferred_region: Option<&str>) -> f64 {
        let reputation = normalize_percent(worker.reputation);
        let quality = normalize_percent(worker.quality);
        let idle = (1.0 - worker.utilization()).clamp(0.0, 1.0);
        let response = 1.0 / (1.0 + worker.avg_response_ms.max(0.0) / self.reference_response_ms);
        let region = match preferred_region {
            None => 1.0,
            Some(pref) if worker.region.as_deref() == Some(pref) => 1.0,
            Some(_) => REGION_MISMATCH_SCORE,
        };
        W_REPUTATION * reputation
            + W_QUALITY * quality
            + W_IDLE * idle
            + W_RESPONSE * response
            + W_REGION * region
    }
}

fn validate_query(query: &DiscoveryQuery) -> Result<(), DiscoveryError> {
    if query.capabilities.is_empty() {
        return Err(DiscoveryError::InvalidQuery(
            "at least one capability is required".into(),
        ));
    }
    if query.capabilities.iter().any(|c| c.trim().is_empty()) {
        return Err(DiscoveryError::InvalidQuery("blank capability tag".into()));
    }
    if query.limit == 0 {
        return Err(DiscoveryError::InvalidQuery("limit must be positive".into()));
    }
    if !(0.0..=1.0).contains(&query.max_utilization) {
        return Err(DiscoveryError::InvalidQuery(format!(
            "max_utilization {} outside [0, 1]",
            query.max_utilization
        )));
    }
    Ok(())
}

fn passes_filters(worker: &WorkerRecord, query: &DiscoveryQuery) -> bool {
    worker.status.accepts_work()
        && worker.reputation >= query.min_reputation
        && worker.quality >= query.min_quality
        && worker.utilization() <= query.max_utilization
        && query
            .max_response_time_ms
            .map_or(true, |max| worker.avg_response_ms <= max)
}

fn compare_ranked(a: &RankedWorker, b: &RankedWorker) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.record.avg_response_ms.total_cmp(&b.record.avg_response_ms))
        .then_with(|| a.record.id.cmp(&b.record.id))
}
