// aqlink Collector - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the collector.
//!
//! Discard, unknown-field and queue-drop figures mirror the dispatcher's own
//! counters. They are set from a [`DispatchStats`] snapshot after every loop
//! pass, so they are exported as gauges without a `_total` suffix.

use aqlink_gateway::{CanonicalRecord, ConnectionState, ConnectionStatus, DispatchStats};
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter_vec, Encoder, Gauge, GaugeVec,
    IntCounterVec, TextEncoder,
};

lazy_static! {
    // ============================================================
    // Records
    // ============================================================

    /// Records emitted, by project.
    pub static ref RECORDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "aqlink_records_total",
        "Canonical records emitted",
        &["project"]
    ).unwrap();

    /// Envelopes discarded, by reason.
    pub static ref DISCARDED: GaugeVec = register_gauge_vec!(
        "aqlink_discarded",
        "Envelopes discarded by the dispatcher",
        &["reason"]
    ).unwrap();

    /// Unknown fields dropped from records.
    pub static ref UNKNOWN_FIELDS: Gauge = register_gauge!(
        "aqlink_unknown_fields",
        "Measurement fields dropped as unknown"
    ).unwrap();

    /// Timestamp of the last record emitted.
    pub static ref LAST_RECORD_TIMESTAMP: Gauge = register_gauge!(
        "aqlink_last_record_timestamp_seconds",
        "Unix time of the most recent record"
    ).unwrap();

    // ============================================================
    // Ingestion
    // ============================================================

    pub static ref QUEUE_LENGTH: Gauge = register_gauge!(
        "aqlink_queue_length",
        "Envelopes waiting in the ingestion queue"
    ).unwrap();

    pub static ref QUEUE_DROPPED: Gauge = register_gauge!(
        "aqlink_queue_dropped",
        "Envelopes dropped because the ingestion queue was full"
    ).unwrap();

    pub static ref CACHE_ENTRIES: Gauge = register_gauge!(
        "aqlink_cache_entries",
        "Kits held in the identity cache"
    ).unwrap();

    // ============================================================
    // Brokers
    // ============================================================

    /// Connection state per broker.
    /// Values: 0 = Disconnected, 1 = Connecting, 2 = Connected, 3 = Backoff, 4 = Retired
    pub static ref BROKER_STATE: GaugeVec = register_gauge_vec!(
        "aqlink_broker_state",
        "Broker connection state (0=Disconnected, 1=Connecting, 2=Connected, 3=Backoff, 4=Retired)",
        &["broker"]
    ).unwrap();

    pub static ref BROKER_RESTARTS: GaugeVec = register_gauge_vec!(
        "aqlink_broker_restarts",
        "Connect attempts made by the broker worker",
        &["broker"]
    ).unwrap();
}

fn state_value(state: ConnectionState) -> f64 {
    match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Backoff => 3.0,
        ConnectionState::Retired => 4.0,
    }
}

/// Count one emitted record.
pub fn record_emitted(record: &CanonicalRecord) {
    RECORDS_TOTAL
        .with_label_values(&[record.kit.project.as_str()])
        .inc();
    LAST_RECORD_TIMESTAMP.set(record.timestamp as f64);
}

/// Bring dispatcher gauges up to date.
pub fn update_dispatch(stats: &DispatchStats, queue_len: usize, queue_dropped: u64, cache_entries: usize) {
    for (reason, count) in [
        ("malformed", stats.malformed),
        ("decode_error", stats.decode_errors),
        ("unregistered", stats.unregistered),
        ("inactive", stats.inactive),
        ("invalid", stats.invalid),
    ] {
        DISCARDED
            .with_label_values(&[reason])
            .set(count as f64);
    }
    UNKNOWN_FIELDS.set(stats.unknown_fields as f64);
    QUEUE_LENGTH.set(queue_len as f64);
    QUEUE_DROPPED.set(queue_dropped as f64);
    CACHE_ENTRIES.set(cache_entries as f64);
}

/// Bring broker gauges up to date.
pub fn update_brokers(statuses: &[ConnectionStatus]) {
    for status in statuses {
        BROKER_STATE
            .with_label_values(&[status.endpoint.as_str()])
            .set(state_value(status.state));
        BROKER_RESTARTS
            .with_label_values(&[status.endpoint.as_str()])
            .set(status.restart_count as f64);
    }
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
