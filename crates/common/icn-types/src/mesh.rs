use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable identifier of a worker node in the mesh.
pub type WorkerId = String;

/// Liveness state of a worker as seen by the marketplace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Busy,
    Offline,
    /// Set by an operator. Health probes never override it.
    Maintenance,
}

impl WorkerStatus {
    /// Whether a worker in this state may be offered work.
    pub fn accepts_work(&self) -> bool {
        matches!(self, WorkerStatus::Online | WorkerStatus::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Maintenance => "maintenance",
        }
    }
}

/// A worker advertised to the capability index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Capability tags, e.g. `"vision-analysis"` or `"gpu"`.
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    /// Tasks currently running on the worker.
    pub load: u32,
    /// Tasks the worker can run concurrently. Always at least 1.
    pub capacity: u32,
    pub last_seen: DateTime<Utc>,
    /// Exponential moving average of probe round-trip time, in milliseconds.
    pub avg_response_ms: f64,
    pub consecutive_failures: u32,
    pub region: Option<String>,
    /// Reputation snapshot (0-100) supplied by the reputation service.
    pub reputation: f64,
    /// Quality score (0-100) advertised for the worker.
    pub quality: f64,
}

impl WorkerRecord {
    pub const DEFAULT_CAPACITY: u32 = 10;
    pub const DEFAULT_QUALITY: f64 = 80.0;

    pub fn new<I, S>(id: impl Into<WorkerId>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: WorkerStatus::Online,
            load: 0,
            capacity: Self::DEFAULT_CAPACITY,
            last_seen: Utc::now(),
            avg_response_ms: 0.0,
            consecutive_failures: 0,
            region: None,
            reputation: 0.0,
            quality: Self::DEFAULT_QUALITY,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_reputation(mut self, reputation: f64) -> Self {
        self.reputation = reputation;
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_response_time(mut self, avg_response_ms: f64) -> Self {
        self.avg_response_ms = avg_response_ms;
        self
    }

    /// Fraction of capacity in use, `load / capacity`.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.load as f64 / self.capacity as f64
    }
}

/// Discovery request against the capability index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryQuery {
    /// Every listed capability must be present on a match.
    pub capabilities: BTreeSet<String>,
    pub min_reputation: f64,
    pub min_quality: f64,
    pub max_response_time_ms: Option<f64>,
    pub max_utilization: f64,
    pub preferred_region: Option<String>,
    pub limit: usize,
}

impl DiscoveryQuery {
    pub const DEFAULT_MAX_UTILIZATION: f64 = 0.8;
    pub const DEFAULT_LIMIT: usize = 10;

    pub fn for_capabilities<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            min_reputation: 0.0,
            min_quality: 0.0,
            max_response_time_ms: None,
            max_utilization: Self::DEFAULT_MAX_UTILIZATION,
            preferred_region: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn min_reputation(mut self, min: f64) -> Self {
        self.min_reputation = min;
        self
    }

    pub fn min_quality(mut self, min: f64) -> Self {
        self.min_quality = min;
        self
    }

    pub fn max_response_time_ms(mut self, max: f64) -> Self {
        self.max_response_time_ms = Some(max);
        self
    }

    pub fn max_utilization(mut self, max: f64) -> Self {
        self.max_utilization = max;
        self
    }

    pub fn prefer_region(mut self, region: impl Into<String>) -> Self {
        self.preferred_region = Some(region.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}
