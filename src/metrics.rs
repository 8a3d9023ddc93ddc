//! Prometheus metrics for the stream health core
//!
//! Registered against the default registry; the process exposes them through
//! whatever scrape endpoint it already serves.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// Events run through the reducer pipeline, by event type
    pub static ref EVENTS_HANDLED: IntCounterVec = register_int_counter_vec!(
        "stream_health_events_handled_total",
        "Events ingested and reduced, by event type",
        &["event_type"]
    )
    .unwrap();

    /// Ingestion-path events skipped without reduction
    pub static ref EVENTS_SKIPPED: IntCounterVec = register_int_counter_vec!(
        "stream_health_events_skipped_total",
        "Events skipped on the ingestion path, by reason",
        &["reason"]
    )
    .unwrap();

    /// Broker messages that failed to decode
    pub static ref DECODE_FAILURES: IntCounter = register_int_counter!(
        "stream_health_decode_failures_total",
        "Broker messages skipped because they failed to decode"
    )
    .unwrap();

    /// Consumer reconnection attempts after transport failures
    pub static ref CONSUMER_RECONNECTS: IntCounter = register_int_counter!(
        "stream_health_consumer_reconnects_total",
        "Reconnections to the broker after a transport failure"
    )
    .unwrap();

    /// Subscriptions removed from the fanout, by reason
    pub static ref SUBSCRIBERS_DROPPED: IntCounterVec = register_int_counter_vec!(
        "stream_health_subscribers_dropped_total",
        "Subscriptions removed from the fanout, by reason",
        &["reason"]
    )
    .unwrap();

    /// Currently registered live subscriptions
    pub static ref ACTIVE_SUBSCRIPTIONS: IntGauge = register_int_gauge!(
        "stream_health_active_subscriptions",
        "Currently registered live event subscriptions"
    )
    .unwrap();
}
