//! Metric name constants recorded by the broker.
//!
//! The broker only emits through the `metrics` facade; the server installs
//! the Prometheus recorder and renders `/metrics`.

/// Live connections (gauge, labels: kind).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Connections accepted (counter, labels: kind).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connection lifetime in seconds (histogram, labels: kind).
pub const CONNECTION_DURATION_SECONDS: &str = "relay_connection_duration_seconds";
/// Adapter identity changes (counter).
pub const ADAPTER_REKEYS_TOTAL: &str = "relay_adapter_rekeys_total";
/// Events delivered to a Processor (counter).
pub const EVENTS_ROUTED_TOTAL: &str = "relay_events_routed_total";
/// Events parked in the message cache (counter).
pub const EVENTS_CACHED_TOTAL: &str = "relay_events_cached_total";
/// Cached events dropped to make room (counter).
pub const CACHE_EVICTIONS_TOTAL: &str = "relay_cache_evictions_total";
/// Failed writes to a Processor during delivery (counter).
pub const DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
/// Events routed by a rule whose target was offline (counter).
pub const RULE_TARGET_OFFLINE_TOTAL: &str = "relay_rule_target_offline_total";
/// Processor API calls completed (counter, labels: outcome).
pub const API_CALLS_TOTAL: &str = "relay_api_calls_total";
/// Processor API call round trip in seconds (histogram).
pub const API_CALL_DURATION_SECONDS: &str = "relay_api_call_duration_seconds";
/// Replies that arrived with no pending request (counter).
pub const CORRELATION_MISSES_TOTAL: &str = "relay_correlation_misses_total";
