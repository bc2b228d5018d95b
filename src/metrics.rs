//! Prometheus metrics. All recording goes through the helpers below, which
//! compile to nothing when the `metrics` feature is off.

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::data_types::Operation;

pub const HTTP_REQUESTS: &str = "http_requests";
pub const RECORD_OPERATIONS: &str = "petrel_record_operations_total";
pub const REALTIME_PUBLISHED: &str = "petrel_realtime_events_published_total";
pub const REALTIME_DELIVERED: &str = "petrel_realtime_events_delivered_total";
pub const REALTIME_DROPPED: &str = "petrel_realtime_subscriptions_dropped_total";
pub const REALTIME_SUBSCRIPTIONS: &str = "petrel_realtime_subscriptions_current";

#[cfg(feature = "metrics")]
pub fn describe() {
    describe_counter!(HTTP_REQUESTS, "Counter tracking HTTP request statistics");
    describe_counter!(
        RECORD_OPERATIONS,
        "Record operations by table, operation and outcome"
    );
    describe_counter!(REALTIME_PUBLISHED, "Change events handed to the realtime bus");
    describe_counter!(
        REALTIME_DELIVERED,
        "Change events enqueued for a realtime subscriber"
    );
    describe_counter!(
        REALTIME_DROPPED,
        "Realtime subscriptions closed by the server"
    );
    describe_gauge!(REALTIME_SUBSCRIPTIONS, "Live realtime subscriptions");
}

#[allow(unused_variables)]
pub fn http_request(route: &'static str, status: u16) {
    #[cfg(feature = "metrics")]
    counter!(HTTP_REQUESTS, "route" => route, "status" => status.to_string()).increment(1);
}

#[allow(unused_variables)]
pub fn record_operation(table: &str, operation: Operation, outcome: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(
        RECORD_OPERATIONS,
        "table" => table.to_string(),
        "operation" => operation.as_ref().to_string(),
        "outcome" => outcome,
    )
    .increment(1);
}

#[allow(unused_variables)]
pub fn event_published(table: &str) {
    #[cfg(feature = "metrics")]
    counter!(REALTIME_PUBLISHED, "table" => table.to_string()).increment(1);
}

#[allow(unused_variables)]
pub fn event_delivered(table: &str) {
    #[cfg(feature = "metrics")]
    counter!(REALTIME_DELIVERED, "table" => table.to_string()).increment(1);
}

#[allow(unused_variables)]
pub fn subscription_dropped(table: &str, reason: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(REALTIME_DROPPED, "table" => table.to_string(), "reason" => reason).increment(1);
}

#[allow(unused_variables)]
pub fn subscriptions_changed(delta: i64) {
    #[cfg(feature = "metrics")]
    {
        let gauge = gauge!(REALTIME_SUBSCRIPTIONS);
        if delta >= 0 {
            gauge.increment(delta as f64);
        } else {
            gauge.decrement(delta.unsigned_abs() as f64);
        }
    }
}
