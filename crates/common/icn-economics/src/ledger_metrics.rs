use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

lazy_static! {
    // Channels
    pub static ref LEDGER_CHANNELS_OPENED_TOTAL: IntCounter = register_int_counter!(
        "ledger_channels_opened_total",
        "Total number of payment channels opened"
    ).unwrap();

    pub static ref LEDGER_CHANNELS_CLOSED_TOTAL: IntCounter = register_int_counter!(
        "ledger_channels_closed_total",
        "Total number of payment channels closed"
    ).unwrap();

    pub static ref LEDGER_OPEN_CHANNELS: IntGauge = register_int_gauge!(
        "ledger_open_channels",
        "Number of payment channels not yet closed"
    ).unwrap();

    // Escrow flows
    pub static ref LEDGER_ESCROW_LOCKED_AMOUNT_TOTAL: IntCounter = register_int_counter!(
        "ledger_escrow_locked_amount_total",
        "Total amount moved into escrow"
    ).unwrap();

    pub static ref LEDGER_ESCROW_RELEASED_AMOUNT_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_escrow_released_amount_total",
        "Total amount released from escrow, by outcome",
        &["outcome"]
    ).unwrap();

    // Must stay at zero.
    pub static ref LEDGER_INVARIANT_VIOLATIONS_TOTAL: IntCounter = register_int_counter!(
        "ledger_invariant_violations_total",
        "Ledger invariant violations detected"
    ).unwrap();

    // Operations
    pub static ref LEDGER_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_operations_total",
        "Total number of ledger operations",
        &["operation", "status"]
    ).unwrap();

    pub static ref LEDGER_STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_store_errors_total",
        "Errors raised by the ledger persistence backend",
        &["store", "operation", "error_type"]
    ).unwrap();
}

#[inline]
pub fn record_operation<T, E>(operation: &str, result: &Result<T, E>) {
    let status = if result.is_ok() { "success" } else { "error" };
    LEDGER_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

#[inline]
pub fn store_error(store: &str, operation: &str, error_type: &str) {
    LEDGER_STORE_ERRORS_TOTAL
        .with_label_values(&[store, operation, error_type])
        .inc();
}
