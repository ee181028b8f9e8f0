use futures::future::join_all;
use icn_types::{PeriodicTask, WorkerId, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::index::CapabilityIndex;
use crate::metrics;
use crate::protocol::LivenessProbe;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before a worker is marked offline.
    pub max_failures: u32,
    /// Weight of the newest sample in the response-time average.
    pub ema_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_failures: 3,
            ema_alpha: 0.3,
        }
    }
}

/// Outcome of one probing round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub healthy: usize,
    pub failed: usize,
    pub demoted: Vec<WorkerId>,
    pub restored: Vec<WorkerId>,
}

/// Periodically probes every registered worker and feeds the results back
/// into the capability index.
///
/// Probes run concurrently and outside any index lock; each result is
/// applied afterwards in its own short write.
pub struct HealthMonitor {
    index: Arc<CapabilityIndex>,
    probe: Arc<dyn LivenessProbe>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(index: Arc<CapabilityIndex>, probe: Arc<dyn LivenessProbe>, config: HealthConfig) -> Self {
        Self { index, probe, config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Runs a single probing round over the current worker set.
    pub async fn check_all(&self) -> HealthReport {
        let ids = self.index.worker_ids().await;
        let probes = ids.iter().map(|id| {
            let probe = self.probe.clone();
            let timeout = self.config.probe_timeout;
            async move {
                match tokio::time::timeout(timeout, probe.probe(id)).await {
                    Ok(Ok(rtt)) => Ok(rtt),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("probe timed out after {:?}", timeout)),
                }
            }
        });
        let results = join_all(probes).await;

        let mut report = HealthReport {
            probed: ids.len(),
            ..Default::default()
        };
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(rtt) => {
                    metrics::probe_success_inc();
                    report.healthy += 1;
                    if let Some(change) = self
                        .index
                        .record_probe_success(id, rtt, self.config.ema_alpha)
                        .await
                    {
                        if change.from == WorkerStatus::Offline {
                            report.restored.push(id.clone());
                        }
                    }
                }
                Err(reason) => {
                    metrics::probe_failure_inc();
                    report.failed += 1;
                    debug!(worker_id = %id, %reason, "Liveness probe failed");
                    if let Some(change) = self
                        .index
                        .record_probe_failure(id, self.config.max_failures)
                        .await
                    {
                        if change.to == WorkerStatus::Offline {
                            metrics::worker_demoted_inc();
                            report.demoted.push(id.clone());
                        }
                    }
                }
            }
        }

        if !report.demoted.is_empty() || !report.restored.is_empty() {
            info!(
                probed = report.probed,
                demoted = ?report.demoted,
                restored = ?report.restored,
                "Health check round changed worker status"
            );
        }
        report
    }

    /// Spawns the probing loop. Stop it with [`PeriodicTask::shutdown`].
    pub fn spawn(self: Arc<Self>) -> PeriodicTask {
        let interval = self.config.interval;
        PeriodicTask::spawn("health-monitor", interval, move || {
            let monitor = self.clone();
            async move {
                monitor.check_all().await;
            }
        })
    }
}
