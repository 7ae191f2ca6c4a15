//! Watch engine metrics, registered with the default prometheus registry on
//! first access.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Number of watch loops currently running
    pub static ref WATCHES_ACTIVE: IntGauge = register_int_gauge!(
        "consul_watches_active",
        "number of blocking query loops currently running"
    ).unwrap();

    /// Count of watch loops started
    pub static ref WATCHES_STARTED: IntCounter = register_int_counter!(
        "consul_watches_started",
        "count of blocking query loops started"
    ).unwrap();

    /// Count of distinct values delivered to subscribers
    pub static ref WATCH_DELIVERIES: IntCounter = register_int_counter!(
        "consul_watch_deliveries",
        "count of distinct values delivered by watch loops"
    ).unwrap();

    /// Count of responses whose index moved but content did not
    pub static ref WATCH_DUPLICATES_SUPPRESSED: IntCounter = register_int_counter!(
        "consul_watch_duplicates_suppressed",
        "count of blocking query responses suppressed because content was unchanged"
    ).unwrap();

    /// Count of failed blocking queries
    pub static ref WATCH_QUERY_FAILURES: IntCounter = register_int_counter!(
        "consul_watch_query_failures",
        "count of blocking queries that failed and were retried"
    ).unwrap();

    /// Count of values emitted after a debounce quiet period
    pub static ref DEBOUNCE_EMISSIONS: IntCounter = register_int_counter!(
        "consul_debounce_emissions",
        "count of values emitted by debounced streams"
    ).unwrap();
}
