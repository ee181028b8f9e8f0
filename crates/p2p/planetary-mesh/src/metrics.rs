use lazy_static::lazy_static;
use prometheus::{
    opts, register_counter, register_counter_vec, register_histogram, register_int_gauge, Counter,
    CounterVec, Histogram, IntGauge,
};

const LABEL_RESULT: &str = "result"; // "success" or "failure"

// --- Worker population ---
lazy_static! {
    pub static ref MESH_WORKERS_REGISTERED: IntGauge = register_int_gauge!(
        opts!("mesh_workers_registered", "Number of workers currently registered in the capability index.")
    ).unwrap();

    pub static ref MESH_WORKERS_ONLINE: IntGauge = register_int_gauge!(
        opts!("mesh_workers_online", "Number of registered workers in the online state.")
    ).unwrap();
}

// --- Discovery ---
lazy_static! {
    pub static ref MESH_DISCOVERY_QUERY_SECONDS: Histogram = register_histogram!(
        "mesh_discovery_query_seconds",
        "Histogram of capability index query latency.",
        // 10us .. 50ms
        vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]
    ).unwrap();

    pub static ref MESH_DISCOVERY_QUERIES_TOTAL: CounterVec = register_counter_vec!(
        opts!("mesh_discovery_queries_total", "Total discovery queries, labeled by result."),
        &[LABEL_RESULT]
    ).unwrap();
}

// --- Health probing ---
lazy_static! {
    pub static ref MESH_HEALTH_PROBES_TOTAL: CounterVec = register_counter_vec!(
        opts!("mesh_health_probes_total", "Total liveness probes sent, labeled by result."),
        &[LABEL_RESULT]
    ).unwrap();

    pub static ref MESH_HEALTH_PROBE_FAILURES_TOTAL: Counter = register_counter!(
        opts!("mesh_health_probe_failures_total", "Total failed or timed-out liveness probes.")
    ).unwrap();

    pub static ref MESH_WORKERS_DEMOTED_TOTAL: Counter = register_counter!(
        opts!("mesh_workers_demoted_total", "Workers moved offline after consecutive probe failures.")
    ).unwrap();
}

// --- Helper Functions to Record Metrics ---

#[inline]
pub fn set_worker_counts(registered: usize, online: usize) {
    MESH_WORKERS_REGISTERED.set(registered as i64);
    MESH_WORKERS_ONLINE.set(online as i64);
}

#[inline]
pub fn observe_query(seconds: f64, success: bool) {
    MESH_DISCOVERY_QUERY_SECONDS.observe(seconds);
    let result = if success { "success" } else { "failure" };
    MESH_DISCOVERY_QUERIES_TOTAL.with_label_values(&[result]).inc();
}

#[inline]
pub fn probe_success_inc() {
    MESH_HEALTH_PROBES_TOTAL.with_label_values(&["success"]).inc();
}

#[inline]
pub fn probe_failure_inc() {
    MESH_HEALTH_PROBES_TOTAL.with_label_values(&["failure"]).inc();
    MESH_HEALTH_PROBE_FAILURES_TOTAL.inc();
}

#[inline]
pub fn worker_demoted_inc() {
    MESH_WORKERS_DEMOTED_TOTAL.inc();
}
