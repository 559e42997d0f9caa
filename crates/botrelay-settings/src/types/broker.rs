//! Broker tuning and routing rule settings.

use botrelay_core::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Correlation, health, cache, and delivery tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Deadline for Processor → Adapter API calls.
    pub api_timeout_secs: u64,
    /// Deadline for broker-internal probes (`get_login_info`).
    pub probe_timeout_secs: u64,
    /// Whether to probe Adapters that connect without an `X-Self-ID` header.
    pub probe_login_info: bool,
    /// Maximum events held while no Processor is available.
    pub cache_capacity: usize,
    /// Samples kept per latency window.
    pub latency_window: usize,
    /// A Processor heard from within this many seconds is healthy.
    pub healthy_heartbeat_secs: u64,
    /// A Processor connected within this many seconds is healthy.
    pub healthy_grace_secs: u64,
    /// Delivery retry budget after a Processor write fails.
    pub delivery_retry: RetryPolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            api_timeout_secs: 30,
            probe_timeout_secs: 10,
            probe_login_info: true,
            cache_capacity: 1000,
            latency_window: 20,
            healthy_heartbeat_secs: 60,
            healthy_grace_secs: 10,
            delivery_retry: RetryPolicy::default(),
        }
    }
}

/// One routing rule: subject pattern → Processor identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEntry {
    /// `user_<id>`, `group_<id>`, `bot_<id>`, a bare id, or a `*` pattern.
    pub pattern: String,
    /// Target Processor identity.
    pub target: String,
}

/// Routing rules loaded at startup, in evaluation order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSettings {
    /// Rules in insertion order (wildcards are scanned in this order).
    pub rules: Vec<RuleEntry>,
}
