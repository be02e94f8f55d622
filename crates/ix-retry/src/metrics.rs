//! Prometheus-style metrics emitted by the retry coordinator
//!
//! Recorded through the `metrics` facade; nothing is exported unless the host
//! process installs a recorder.

use metrics::{counter, gauge};

pub const DOCUMENTS_DELIVERED: &str = "ix_retry_documents_delivered_total";
pub const DOCUMENTS_QUEUED: &str = "ix_retry_documents_queued_total";
pub const DOCUMENTS_DROPPED: &str = "ix_retry_documents_dropped_total";
pub const OUTAGE_MODE: &str = "ix_retry_outage_mode";
pub const QUEUE_DEPTH: &str = "ix_retry_queue_depth";

pub fn record_delivered(destination: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(DOCUMENTS_DELIVERED, "destination" => destination.to_string()).increment(count as u64);
}

pub fn record_queued(destination: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(DOCUMENTS_QUEUED, "destination" => destination.to_string()).increment(count as u64);
}

pub fn record_dropped(destination: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(DOCUMENTS_DROPPED, "destination" => destination.to_string()).increment(count as u64);
}

pub fn set_outage_mode(outage: bool) {
    gauge!(OUTAGE_MODE).set(if outage { 1.0 } else { 0.0 });
}

pub fn set_queue_depth(destination: &str, depth: usize) {
    gauge!(QUEUE_DEPTH, "destination" => destination.to_string()).set(depth as f64);
}
