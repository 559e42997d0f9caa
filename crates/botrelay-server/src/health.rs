//! `/health` endpoint.

use std::time::Instant;

use botrelay_broker::BrokerSnapshot;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Connected Adapters.
    pub adapters: usize,
    /// Connected Processors.
    pub processors: usize,
    /// API calls waiting for a reply.
    pub pending_requests: usize,
    /// Events waiting for a Processor.
    pub cached_messages: usize,
}

/// Build a health response from a broker snapshot.
pub fn health_check(start_time: Instant, snapshot: &BrokerSnapshot) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        adapters: snapshot.adapters,
        processors: snapshot.processors,
        pending_requests: snapshot.pending_requests,
        cached_messages: snapshot.cached_messages,
    }
}
