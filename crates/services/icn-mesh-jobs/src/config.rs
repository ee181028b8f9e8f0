use config::{Config, Environment, File};
use icn_economics::LedgerConfig;
use planetary_mesh::HealthConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::auction::AuctionConfig;
use crate::error::MarketError;
use crate::settlement::{FailurePenaltyPolicy, SettlementConfig};

/// Prefix of environment overrides, e.g. `MARKET_AUCTION_MIN_BIDDERS=3`.
pub const ENV_PREFIX: &str = "MARKET";

/// Every tunable of the marketplace.
///
/// Layered as built-in defaults, then an optional TOML file, then
/// `MARKET_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub health_check_interval_secs: u64,
    pub health_probe_timeout_ms: u64,
    pub health_max_failures: u32,
    pub health_ema_alpha: f64,

    pub discovery_default_limit: usize,
    pub discovery_default_max_utilization: f64,
    pub discovery_reference_response_ms: f64,

    pub auction_default_duration_secs: u64,
    pub auction_sweep_interval_secs: u64,
    pub auction_min_bidders: usize,
    pub auction_max_bids: usize,
    pub auction_max_invited: usize,
    pub auction_retention_secs: u64,

    pub execution_timeout_secs: u64,
    pub escrow_max_hold_secs: u64,
    pub escrow_watchdog_interval_secs: u64,
    pub settlement_close_channel_after_settle: bool,

    pub reputation_success_delta: f64,
    pub reputation_efficiency_bonus: f64,
    /// Fraction of the execution timeout under which a run counts as efficient.
    pub reputation_efficiency_threshold: f64,
    pub reputation_failure_delta: f64,
    pub reputation_failure_policy: FailurePenaltyPolicy,
    pub reputation_service_url: String,
    pub reputation_cache_ttl_secs: u64,

    pub ledger_verify_after_mutation: bool,
    /// Directory of the sled ledger store. In-memory when unset.
    pub ledger_store_path: Option<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            health_probe_timeout_ms: 5_000,
            health_max_failures: 3,
            health_ema_alpha: 0.3,
            discovery_default_limit: 10,
            discovery_default_max_utilization: 0.8,
            discovery_reference_response_ms: 100.0,
            auction_default_duration_secs: 30,
            auction_sweep_interval_secs: 10,
            auction_min_bidders: 3,
            auction_max_bids: 50,
            auction_max_invited: 50,
            auction_retention_secs: 300,
            execution_timeout_secs: 300,
            escrow_max_hold_secs: 900,
            escrow_watchdog_interval_secs: 30,
            settlement_close_channel_after_settle: true,
            reputation_success_delta: 1.0,
            reputation_efficiency_bonus: 0.5,
            reputation_efficiency_threshold: 0.5,
            reputation_failure_delta: -2.0,
            reputation_failure_policy: FailurePenaltyPolicy::default(),
            reputation_service_url: "http://localhost:8081".to_string(),
            reputation_cache_ttl_secs: 60,
            ledger_verify_after_mutation: cfg!(debug_assertions),
            ledger_store_path: None,
        }
    }
}

impl MarketConfig {
    /// Loads defaults, then `path` if it exists, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, MarketError> {
        let mut builder = Config::builder().add_source(Config::try_from(&MarketConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let cfg: MarketConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        tracing::debug!(?cfg, "Marketplace configuration loaded");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        let fail = |msg: String| Err(MarketError::Config(msg));
        if !(0.0..=1.0).contains(&self.health_ema_alpha) || self.health_ema_alpha == 0.0 {
            return fail(format!("health_ema_alpha must be in (0, 1], got {}", self.health_ema_alpha));
        }
        if self.health_max_failures == 0 {
            return fail("health_max_failures must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.discovery_default_max_utilization) {
            return fail(format!(
                "discovery_default_max_utilization must be in [0, 1], got {}",
                self.discovery_default_max_utilization
            ));
        }
        if self.discovery_default_limit == 0 {
            return fail("discovery_default_limit must be at least 1".into());
        }
        if self.discovery_reference_response_ms <= 0.0 {
            return fail("discovery_reference_response_ms must be positive".into());
        }
        if self.auction_default_duration_secs == 0 {
            return fail("auction_default_duration_secs must be positive".into());
        }
        if self.auction_min_bidders == 0 || self.auction_min_bidders > self.auction_max_bids {
            return fail(format!(
                "auction_min_bidders must be in 1..={}, got {}",
                self.auction_max_bids, self.auction_min_bidders
            ));
        }
        if self.auction_max_invited < self.auction_min_bidders {
            return fail("auction_max_invited must be at least auction_min_bidders".into());
        }
        if self.execution_timeout_secs == 0 {
            return fail("execution_timeout_secs must be positive".into());
        }
        // the watchdog must not refund escrows whose execution may still finish
        if self.escrow_max_hold_secs <= self.execution_timeout_secs {
            return fail(format!(
                "escrow_max_hold_secs ({}) must exceed execution_timeout_secs ({})",
                self.escrow_max_hold_secs, self.execution_timeout_secs
            ));
        }
        if self.reputation_failure_delta > 0.0 {
            return fail("reputation_failure_delta must not be positive".into());
        }
        for (name, secs) in [
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("auction_sweep_interval_secs", self.auction_sweep_interval_secs),
            ("escrow_watchdog_interval_secs", self.escrow_watchdog_interval_secs),
        ] {
            if secs == 0 {
                return fail(format!("{} must be positive", name));
            }
        }
        Ok(())
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health_check_interval_secs),
            probe_timeout: Duration::from_millis(self.health_probe_timeout_ms),
            max_failures: self.health_max_failures,
            ema_alpha: self.health_ema_alpha,
        }
    }

    pub fn auction(&self) -> AuctionConfig {
        AuctionConfig {
            default_duration: Duration::from_secs(self.auction_default_duration_secs),
            sweep_interval: Duration::from_secs(self.auction_sweep_interval_secs),
            min_bidders: self.auction_min_bidders,
            max_bids: self.auction_max_bids,
            max_invited: self.auction_max_invited,
            retention: Duration::from_secs(self.auction_retention_secs),
        }
    }

    pub fn settlement(&self) -> SettlementConfig {
        SettlementConfig {
            success_delta: self.reputation_success_delta,
            efficiency_bonus: self.reputation_efficiency_bonus,
            efficiency_threshold: self.reputation_efficiency_threshold,
            failure_delta: self.reputation_failure_delta,
            failure_policy: self.reputation_failure_policy,
            close_channel_after_settle: self.settlement_close_channel_after_settle,
            escrow_max_hold: Duration::from_secs(self.escrow_max_hold_secs),
            watchdog_interval: Duration::from_secs(self.escrow_watchdog_interval_secs),
        }
    }

    pub fn ledger(&self) -> LedgerConfig {
        LedgerConfig {
            verify_after_mutation: self.ledger_verify_after_mutation,
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}
