use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

// Auctions
static AUCTIONS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("auctions_created_total", "Number of auctions opened")
        .expect("Failed to create auctions_created_total metric");
    register_metric(&counter);
    counter
});

static AUCTIONS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("auctions_open", "Number of auctions currently accepting bids")
        .expect("Failed to create auctions_open metric");
    register_metric(&gauge);
    gauge
});

static BIDS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("auction_bids_received_total", "Number of bids accepted")
        .expect("Failed to create auction_bids_received_total metric");
    register_metric(&counter);
    counter
});

static BIDS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("auction_bids_rejected_total", "Number of bids rejected, by reason"),
        &["reason"], // "invalid_bid", "closed", "expired", ...
    )
    .expect("Failed to create auction_bids_rejected_total metric");
    register_metric(&counter);
    counter
});

static AUCTION_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("auction_outcomes_total", "Resolved auctions, by terminal status"),
        &["outcome"], // "awarded", "insufficient_bidders", "expired", "canceled"
    )
    .expect("Failed to create auction_outcomes_total metric");
    register_metric(&counter);
    counter
});

static CLEARING_PRICE: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new("auction_clearing_price", "Distribution of winning clearing prices")
            .buckets(prometheus::exponential_buckets(1.0, 4.0, 12).unwrap_or_default()),
    )
    .expect("Failed to create auction_clearing_price metric");
    register_metric(&histogram);
    histogram
});

static BID_SCORE_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new("auction_winning_bid_score", "Distribution of winning composite scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )
    .expect("Failed to create auction_winning_bid_score metric");
    register_metric(&histogram);
    histogram
});

// Allocation flow
static ALLOCATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("marketplace_allocations_total", "Allocation attempts, by final result"),
        &["result"], // "settled", "refunded", "not_allocated", "error"
    )
    .expect("Failed to create marketplace_allocations_total metric");
    register_metric(&counter);
    counter
});

static REPUTATION_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("marketplace_reputation_updates_total", "Reputation deltas pushed, by status"),
        &["status"],
    )
    .expect("Failed to create marketplace_reputation_updates_total metric");
    register_metric(&counter);
    counter
});

static ESCROW_WATCHDOG_REFUNDS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "settlement_watchdog_refunds_total",
        "Escrows refunded because they were held past the maximum hold time",
    )
    .expect("Failed to create settlement_watchdog_refunds_total metric");
    register_metric(&counter);
    counter
});

// Reputation cache
static REPUTATION_QUERY_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "mesh_reputation_query_count",
        "Number of reputation service queries made",
    )
    .expect("Failed to create reputation_query_count metric");
    register_metric(&counter);
    counter
});

static REPUTATION_CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "mesh_reputation_cache_hits",
        "Number of reputation score cache hits",
    )
    .expect("Failed to create reputation_cache_hits metric");
    register_metric(&counter);
    counter
});

static REPUTATION_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "mesh_reputation_cache_size",
        "Number of entries in the reputation score cache",
    )
    .expect("Failed to create reputation_cache_size metric");
    register_metric(&gauge);
    gauge
});

/// Registers a metric with the process-wide registry so it shows up next to
/// the discovery and ledger metrics.
fn register_metric<M: prometheus::core::Collector + Clone + 'static>(metric: &M) {
    if let Err(e) = prometheus::register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "Failed to register metric");
    }
}

pub fn record_auction_created() {
    AUCTIONS_CREATED.inc();
    AUCTIONS_OPEN.inc();
}

pub fn record_bid_accepted() {
    BIDS_RECEIVED.inc();
}

pub fn record_bid_rejected(reason: &str) {
    BIDS_REJECTED.with_label_values(&[reason]).inc();
}

/// Record a terminal auction status; `clearing` carries price and score when awarded.
pub fn record_auction_outcome(outcome: &str, clearing: Option<(u64, f64)>) {
    AUCTIONS_OPEN.dec();
    AUCTION_OUTCOMES.with_label_values(&[outcome]).inc();
    if let Some((price, score)) = clearing {
        CLEARING_PRICE.observe(price as f64);
        BID_SCORE_HISTOGRAM.observe(score);
    }
}

pub fn record_allocation(result: &str) {
    ALLOCATIONS.with_label_values(&[result]).inc();
}

pub fn record_reputation_update(ok: bool) {
    let status = if ok { "success" } else { "error" };
    REPUTATION_UPDATES.with_label_values(&[status]).inc();
}

pub fn record_watchdog_refund() {
    ESCROW_WATCHDOG_REFUNDS.inc();
}

pub fn record_reputation_query() {
    REPUTATION_QUERY_COUNT.inc();
}

pub fn record_reputation_cache_hit() {
    REPUTATION_CACHE_HITS.inc();
}

pub fn update_reputation_cache_size(size: usize) {
    REPUTATION_CACHE_SIZE.set(size as i64);
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
