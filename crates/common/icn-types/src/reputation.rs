use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::TaskId;
use crate::mesh::WorkerId;

/// Why a reputation delta was issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReputationReason {
    TaskCompleted {
        task_id: TaskId,
        duration_ms: u64,
        /// Finished under the efficiency threshold.
        efficient: bool,
    },
    TaskFailed {
        task_id: TaskId,
        progress: f64,
    },
    TaskTimedOut {
        task_id: TaskId,
    },
}

impl ReputationReason {
    pub fn task_id(&self) -> &str {
        match self {
            ReputationReason::TaskCompleted { task_id, .. }
            | ReputationReason::TaskFailed { task_id, .. }
            | ReputationReason::TaskTimedOut { task_id } => task_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReputationReason::TaskCompleted { .. } => "completed",
            ReputationReason::TaskFailed { .. } => "failed",
            ReputationReason::TaskTimedOut { .. } => "timed_out",
        }
    }
}

/// A delta pushed to the reputation service after settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationUpdate {
    pub worker_id: WorkerId,
    pub delta: f64,
    pub reason: ReputationReason,
    pub issued_at: DateTime<Utc>,
}

impl ReputationUpdate {
    pub fn new(worker_id: impl Into<WorkerId>, delta: f64, reason: ReputationReason) -> Self {
        Self {
            worker_id: worker_id.into(),
            delta,
            reason,
            issued_at: Utc::now(),
        }
    }
}

/// Maps a score on the 0-100 scale to `[0, 1]`.
pub fn normalize_percent(score: f64) -> f64 {
    (score / 100.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_percent_clamps_out_of_range_scores() {
        assert_eq!(normalize_percent(50.0), 0.5);
        assert_eq!(normalize_percent(-5.0), 0.0);
        assert_eq!(normalize_percent(140.0), 1.0);
    }
}
