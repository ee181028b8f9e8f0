use chrono::{DateTime, Utc};
use icn_economics::{ChannelId, EscrowLedger, EscrowReceipt, LedgerResult};
use icn_types::{
    ExecutionOutcome, ExecutionReport, PeriodicTask, ReputationReason, ReputationUpdate, TaskId,
    TokenAmount, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::reputation_client::ReputationClient;

/// How a failed execution is penalized.
///
/// Undecided: whether the penalty should scale with the work completed.
/// `Flat` is the default until that is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePenaltyPolicy {
    /// Always apply `failure_delta`.
    #[default]
    #[serde(rename = "flat")]
    Flat,
    /// Scale `failure_delta` by the fraction of work left undone.
    #[serde(rename = "proportional")]
    ProportionalToProgress,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub success_delta: f64,
    pub efficiency_bonus: f64,
    /// Fraction of the execution timeout under which a run earns the bonus.
    pub efficiency_threshold: f64,
    pub failure_delta: f64,
    pub failure_policy: FailurePenaltyPolicy,
    pub close_channel_after_settle: bool,
    /// Escrows held longer than this are refunded by the watchdog.
    pub escrow_max_hold: Duration,
    pub watchdog_interval: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            success_delta: 1.0,
            efficiency_bonus: 0.5,
            efficiency_threshold: 0.5,
            failure_delta: -2.0,
            failure_policy: FailurePenaltyPolicy::Flat,
            close_channel_after_settle: true,
            escrow_max_hold: Duration::from_secs(900),
            watchdog_interval: Duration::from_secs(30),
        }
    }
}

/// A funded escrow waiting for an execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowHandle {
    pub channel_id: ChannelId,
    pub task_id: TaskId,
    pub payer: String,
    pub payee: WorkerId,
    pub amount: TokenAmount,
}

/// What came back from the execution collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementInput {
    Completed(ExecutionReport),
    TimedOut,
    ExecutorError(String),
}

impl SettlementInput {
    pub fn outcome(&self) -> ExecutionOutcome {
        match self {
            SettlementInput::Completed(report) => report.outcome,
            SettlementInput::TimedOut | SettlementInput::ExecutorError(_) => ExecutionOutcome::Failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub receipt: EscrowReceipt,
    pub reputation_delta: f64,
    /// False when the reputation collaborator rejected the update or it was skipped.
    pub reputation_recorded: bool,
    /// Amount returned to the payer account when the channel was closed.
    pub refunded: TokenAmount,
    pub channel_closed: bool,
}

/// Turns auction awards into escrows and execution results into payments.
pub struct SettlementCoordinator {
    ledger: Arc<EscrowLedger>,
    reputation: Arc<dyn ReputationClient>,
    config: SettlementConfig,
}

impl SettlementCoordinator {
    pub fn new(
        ledger: Arc<EscrowLedger>,
        reputation: Arc<dyn ReputationClient>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            reputation,
            config,
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Opens a channel funded with `amount` and locks all of it for `task_id`.
    ///
    /// If the lock fails the channel is closed again, refunding the payer.
    pub async fn open_escrow(
        &self,
        payer: &str,
        payee: &str,
        amount: TokenAmount,
        task_id: &str,
        auction_ref: Option<&str>,
    ) -> LedgerResult<EscrowHandle> {
        let channel_id = self.ledger.open_channel(payer, payee, amount, auction_ref).await?;

        if let Err(e) = self.ledger.lock_escrow(&channel_id, task_id, amount).await {
            warn!(%channel_id, task_id, error = %e, "Escrow lock failed; closing channel");
            if let Err(close_err) = self.ledger.close_channel(&channel_id).await {
                error!(%channel_id, error = %close_err, "Failed to roll back channel after lock failure");
            }
            return Err(e);
        }

        info!(%channel_id, task_id, payer, payee, amount, "Escrow funded");
        Ok(EscrowHandle {
            channel_id,
            task_id: task_id.to_string(),
            payer: payer.to_string(),
            payee: payee.to_string(),
            amount,
        })
    }

    /// Releases or refunds the escrow and reports the outcome to the
    /// reputation service.
    ///
    /// The ledger decides the outcome: if the watchdog already refunded this
    /// escrow, the stored refund receipt is used and no second reputation
    /// update is sent.
    pub async fn settle(
        &self,
        handle: &EscrowHandle,
        input: SettlementInput,
        execution_timeout: Duration,
    ) -> LedgerResult<Settlement> {
        let requested = input.outcome();
        let receipt = self
            .ledger
            .release_escrow(&handle.channel_id, &handle.task_id, requested)
            .await?;

        let (reputation_delta, reputation_recorded) = if receipt.outcome == requested {
            let (delta, reason) = self.reputation_delta(&handle.task_id, &input, execution_timeout);
            let recorded = self.push_reputation(&handle.payee, delta, reason).await;
            (delta, recorded)
        } else {
            warn!(
                channel_id = %handle.channel_id,
                task_id = %handle.task_id,
                requested = requested.as_str(),
                released = receipt.outcome.as_str(),
                "Escrow was settled before the execution result arrived"
            );
            (self.config.failure_delta, false)
        };

        let (refunded, channel_closed) = self.maybe_close(&handle.channel_id).await;

        info!(
            channel_id = %handle.channel_id,
            task_id = %handle.task_id,
            worker_id = %handle.payee,
            outcome = receipt.outcome.as_str(),
            amount = receipt.amount,
            reputation_delta,
            refunded,
            "Escrow settled"
        );
        Ok(Settlement {
            receipt,
            reputation_delta,
            reputation_recorded,
            refunded,
            channel_closed,
        })
    }

    /// Reputation delta and reason for an execution result.
    pub fn reputation_delta(
        &self,
        task_id: &str,
        input: &SettlementInput,
        execution_timeout: Duration,
    ) -> (f64, ReputationReason) {
        let cfg = &self.config;
        match input {
            SettlementInput::Completed(report) if report.outcome == ExecutionOutcome::Success => {
                let threshold = execution_timeout.mul_f64(cfg.efficiency_threshold.clamp(0.0, 1.0));
                let efficient = report.duration < threshold;
                let delta = if efficient {
                    cfg.success_delta + cfg.efficiency_bonus
                } else {
                    cfg.success_delta
                };
                (
                    delta,
                    ReputationReason::TaskCompleted {
                        task_id: task_id.to_string(),
                        duration_ms: report.duration.as_millis() as u64,
                        efficient,
                    },
                )
            }
            SettlementInput::Completed(report) => (
                self.failure_penalty(report.progress),
                ReputationReason::TaskFailed {
                    task_id: task_id.to_string(),
                    progress: report.progress,
                },
            ),
            SettlementInput::ExecutorError(_) => (
                self.failure_penalty(0.0),
                ReputationReason::TaskFailed {
                    task_id: task_id.to_string(),
                    progress: 0.0,
                },
            ),
            SettlementInput::TimedOut => (
                cfg.failure_delta,
                ReputationReason::TaskTimedOut {
                    task_id: task_id.to_string(),
                },
            ),
        }
    }

    fn failure_penalty(&self, progress: f64) -> f64 {
        match self.config.failure_policy {
            FailurePenaltyPolicy::Flat => self.config.failure_delta,
            FailurePenaltyPolicy::ProportionalToProgress => {
                self.config.failure_delta * (1.0 - progress.clamp(0.0, 1.0))
            }
        }
    }

    async fn push_reputation(&self, worker: &str, delta: f64, reason: ReputationReason) -> bool {
        let update = ReputationUpdate::new(worker, delta, reason);
        match self.reputation.update_score(&update).await {
            Ok(()) => {
                metrics::record_reputation_update(true);
                debug!(worker_id = worker, delta, reason = update.reason.label(), "Reputation update recorded");
                true
            }
            Err(e) => {
                metrics::record_reputation_update(false);
                warn!(worker_id = worker, delta, error = %e, "Failed to record reputation update");
                false
            }
        }
    }

    /// Runs after the escrow is already released, so a failure here only
    /// leaves the channel open; the payout stands.
    async fn maybe_close(&self, channel_id: &str) -> (TokenAmount, bool) {
        if !self.config.close_channel_after_settle {
            return (0, false);
        }
        match self.ledger.channel(channel_id).await {
            Some(ch) if ch.is_closed() => return (0, true),
            _ => {}
        }
        match self.ledger.close_channel(channel_id).await {
            Ok(refunded) => (refunded, true),
            Err(e) if e.is_fatal() => {
                error!(channel_id, error = %e, "Failed to close channel after settlement");
                (0, false)
            }
            Err(e) => {
                warn!(channel_id, error = %e, "Channel left open after settlement");
                (0, false)
            }
        }
    }

    /// Refunds every escrow locked for longer than the maximum hold.
    pub async fn sweep_stale_escrows_at(&self, now: DateTime<Utc>) -> Vec<EscrowReceipt> {
        let stale = self.ledger.expired_escrows(now, self.config.escrow_max_hold).await;
        let mut refunded = Vec::with_capacity(stale.len());
        for (channel_id, task_id) in stale {
            let receipt = match self
                .ledger
                .release_escrow(&channel_id, &task_id, ExecutionOutcome::Failure)
                .await
            {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(%channel_id, %task_id, error = %e, "Watchdog could not refund stale escrow");
                    continue;
                }
            };
            metrics::record_watchdog_refund();
            warn!(%channel_id, %task_id, amount = receipt.amount, "Escrow exceeded maximum hold; refunded");

            if receipt.outcome == ExecutionOutcome::Failure {
                if let Some(ch) = self.ledger.channel(&channel_id).await {
                    let reason = ReputationReason::TaskTimedOut {
                        task_id: task_id.clone(),
                    };
                    self.push_reputation(&ch.payee, self.config.failure_delta, reason).await;
                }
            }
            self.maybe_close(&channel_id).await;
            refunded.push(receipt);
        }
        refunded
    }

    pub async fn sweep_stale_escrows(&self) -> Vec<EscrowReceipt> {
        self.sweep_stale_escrows_at(Utc::now()).await
    }

    /// Spawns the escrow-hold watchdog. Stop it with [`PeriodicTask::shutdown`].
    pub fn spawn_watchdog(self: Arc<Self>) -> PeriodicTask {
        let interval = self.config.watchdog_interval;
        PeriodicTask::spawn("escrow-watchdog", interval, move || {
            let coordinator = self.clone();
            async move {
                coordinator.sweep_stale_escrows().await;
            }
        })
    }
}
