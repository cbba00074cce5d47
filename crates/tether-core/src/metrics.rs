//! Instrumentation points for the hub.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding binary installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
    pub const USERS_ONLINE: &str = "tether_users_online";
    pub const PRESENCE_TRANSITIONS_TOTAL: &str = "tether_presence_transitions_total";
    pub const MESSAGES_DELIVERED_TOTAL: &str = "tether_messages_delivered_total";
    pub const MESSAGES_DROPPED_TOTAL: &str = "tether_messages_dropped_total";
    pub const RELAY_MESSAGES_TOTAL: &str = "tether_relay_messages_total";
    pub const BROKER_ERRORS_TOTAL: &str = "tether_broker_errors_total";
    pub const PRESENCE_ERRORS_TOTAL: &str = "tether_presence_errors_total";
    pub const EFFECTS_DROPPED_TOTAL: &str = "tether_effects_dropped_total";
}

/// Describe every hub metric.
pub fn describe() {
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Live connections registered in the hub");
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one live local connection");
    metrics::describe_counter!(
        names::PRESENCE_TRANSITIONS_TOTAL,
        "Online/offline transitions emitted by this process"
    );
    metrics::describe_counter!(
        names::MESSAGES_DELIVERED_TOTAL,
        "Messages queued onto connection outbound queues"
    );
    metrics::describe_counter!(
        names::MESSAGES_DROPPED_TOTAL,
        "Messages dropped because an outbound queue was full or closed"
    );
    metrics::describe_counter!(
        names::RELAY_MESSAGES_TOTAL,
        "Envelopes received from the broker topic"
    );
    metrics::describe_counter!(names::BROKER_ERRORS_TOTAL, "Broker publish/receive failures");
    metrics::describe_counter!(names::PRESENCE_ERRORS_TOTAL, "Presence store failures");
    metrics::describe_counter!(
        names::EFFECTS_DROPPED_TOTAL,
        "Presence writes and broker publishes skipped because the effects queue was backlogged"
    );
}

/// Publish registry sizes.
pub fn set_registry_size(users: usize, connections: usize) {
    gauge!(names::USERS_ONLINE).set(users as f64);
    gauge!(names::CONNECTIONS_ACTIVE).set(connections as f64);
}

pub fn record_presence_transition(status: &'static str) {
    counter!(names::PRESENCE_TRANSITIONS_TOTAL, "status" => status).increment(1);
}

pub fn record_delivered(count: usize) {
    counter!(names::MESSAGES_DELIVERED_TOTAL).increment(count as u64);
}

pub fn record_dropped(reason: &'static str) {
    counter!(names::MESSAGES_DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_relay(outcome: &'static str) {
    counter!(names::RELAY_MESSAGES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_broker_error(operation: &'static str) {
    counter!(names::BROKER_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_presence_error(operation: &'static str) {
    counter!(names::PRESENCE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_effect_dropped(effect: &'static str) {
    counter!(names::EFFECTS_DROPPED_TOTAL, "effect" => effect).increment(1);
}
