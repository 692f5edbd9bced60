//! Named observability hooks.
//!
//! Counters, gauges and the processing-duration histogram are emitted through
//! the `metrics` facade; the Prometheus recorder installed in `main` renders
//! them at `GET /metrics`. Transport beyond that is out of scope.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const ORDERS_RECEIVED_TOTAL: &str = "orders_received_total";
pub const ORDERS_PROCESSED_TOTAL: &str = "orders_processed_total";
pub const ORDERS_FAILED_TOTAL: &str = "orders_failed_total";
pub const DUPLICATE_ORDERS_TOTAL: &str = "duplicate_orders_total";
pub const ORDERS_PENDING: &str = "orders_pending";
pub const RETRY_QUEUE_SIZE: &str = "retry_queue_size";
pub const ORDER_PROCESSING_DURATION_SECONDS: &str = "order_processing_duration_seconds";

/// Register help text for every exported metric. Call once at startup, after
/// the recorder is installed.
pub fn describe() {
    describe_counter!(
        ORDERS_RECEIVED_TOTAL,
        "Trade events accepted by the ingest endpoint, duplicates included"
    );
    describe_counter!(
        ORDERS_PROCESSED_TOTAL,
        "Events acknowledged done by a consumer"
    );
    describe_counter!(
        ORDERS_FAILED_TOTAL,
        "Events that reached the retry bound and went fallow"
    );
    describe_counter!(
        DUPLICATE_ORDERS_TOTAL,
        "Ingest requests resolved to an already-stored event via the dedup key"
    );
    describe_gauge!(ORDERS_PENDING, "Pending events awaiting a consumer");
    describe_gauge!(
        RETRY_QUEUE_SIZE,
        "Pending events whose next_retry_at lies in the future"
    );
    describe_histogram!(
        ORDER_PROCESSING_DURATION_SECONDS,
        "Seconds from broker insert to consumer acknowledgement"
    );
}

pub fn order_received() {
    counter!(ORDERS_RECEIVED_TOTAL, 1);
}

pub fn order_processed() {
    counter!(ORDERS_PROCESSED_TOTAL, 1);
}

pub fn orders_failed(n: u64) {
    if n > 0 {
        counter!(ORDERS_FAILED_TOTAL, n);
    }
}

pub fn duplicate_order() {
    counter!(DUPLICATE_ORDERS_TOTAL, 1);
}

pub fn queue_gauges(pending: u64, retrying: u64) {
    gauge!(ORDERS_PENDING, pending as f64);
    gauge!(RETRY_QUEUE_SIZE, retrying as f64);
}

pub fn processing_duration(seconds: f64) {
    histogram!(ORDER_PROCESSING_DURATION_SECONDS, seconds);
}
