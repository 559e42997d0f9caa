//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Each type implements
//! [`Default`] with production values, and `#[serde(default)]` allows
//! partial JSON: missing fields get their default during deserialization.

mod broker;
mod server;

pub use broker::*;
pub use server::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the relay.
///
/// ```json
/// {
///   "server": { "port": 6700 },
///   "broker": { "cacheCapacity": 500 },
///   "routing": { "rules": [{ "pattern": "group_100", "target": "10.0.0.5:41000" }] }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Ping cadence and read deadlines.
    pub heartbeat: HeartbeatSettings,
    /// Broker tuning.
    pub broker: BrokerSettings,
    /// Initial routing rules.
    pub routing: RoutingSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.broker.cache_capacity == 0, "broker.cacheCapacity must be > 0"),
            (self.broker.latency_window == 0, "broker.latencyWindow must be > 0"),
            (self.broker.api_timeout_secs == 0, "broker.apiTimeoutSecs must be > 0"),
            (self.broker.probe_timeout_secs == 0, "broker.probeTimeoutSecs must be > 0"),
            (self.heartbeat.ping_interval_secs == 0, "heartbeat.pingIntervalSecs must be > 0"),
            (
                self.heartbeat.adapter_read_timeout_secs <= self.heartbeat.ping_interval_secs,
                "heartbeat.adapterReadTimeoutSecs must exceed pingIntervalSecs",
            ),
            (
                self.heartbeat.processor_read_timeout_secs <= self.heartbeat.ping_interval_secs,
                "heartbeat.processorReadTimeoutSecs must exceed pingIntervalSecs",
            ),
            (
                self.server.adapter_path == self.server.processor_path,
                "server.adapterPath and server.processorPath must differ",
            ),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, message)) => Err(SettingsError::InvalidValue((*message).to_string())),
            None => Ok(()),
        }
    }
}

impl HeartbeatSettings {
    /// Ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Adapter read deadline as a [`Duration`].
    pub fn adapter_read_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_read_timeout_secs)
    }

    /// Processor read deadline as a [`Duration`].
    pub fn processor_read_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_read_timeout_secs)
    }
}

impl BrokerSettings {
    /// API call deadline as a [`Duration`].
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Probe deadline as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_match_broker_contract() {
        let s = RelaySettings::default();
        assert_eq!(s.heartbeat.ping_interval_secs, 30);
        assert_eq!(s.heartbeat.adapter_read_timeout_secs, 120);
        assert_eq!(s.heartbeat.processor_read_timeout_secs, 60);
        assert_eq!(s.broker.api_timeout_secs, 30);
        assert_eq!(s.broker.probe_timeout_secs, 10);
        assert_eq!(s.broker.cache_capacity, 1000);
        assert_eq!(s.broker.latency_window, 20);
        assert_eq!(s.broker.healthy_heartbeat_secs, 60);
        assert_eq!(s.broker.healthy_grace_secs, 10);
        assert_eq!(s.broker.delivery_retry.max_retries, 3);
        assert!(s.routing.rules.is_empty());
    }

    #[test]
    fn defaults_are_valid() {
        assert!(RelaySettings::default().validate().is_ok());
    }

    #[test]
    fn zero_cache_is_rejected() {
        let mut s = RelaySettings::default();
        s.broker.cache_capacity = 0;
        let err = s.validate().unwrap_err();
        assert_matches!(err, SettingsError::InvalidValue(ref m) if m.contains("cacheCapacity"));
    }

    #[test]
    fn read_timeout_must_exceed_ping_interval() {
        let mut s = RelaySettings::default();
        s.heartbeat.processor_read_timeout_secs = 30;
        assert!(s.validate().is_err());
    }

    #[test]
    fn same_paths_are_rejected() {
        let mut s = RelaySettings::default();
        s.server.processor_path = s.server.adapter_path.clone();
        assert!(s.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"server":{"port":6700},"broker":{"cacheCapacity":5}}"#)
                .unwrap();
        assert_eq!(s.server.port, 6700);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.broker.cache_capacity, 5);
        assert_eq!(s.broker.latency_window, 20);
    }

    #[test]
    fn rules_keep_order() {
        let s: RelaySettings = serde_json::from_str(
            r#"{"routing":{"rules":[
                {"pattern":"group_*","target":"p1"},
                {"pattern":"user_1","target":"p2"}
            ]}}"#,
        )
        .unwrap();
        assert_eq!(s.routing.rules[0].pattern, "group_*");
        assert_eq!(s.routing.rules[1].target, "p2");
    }

    #[test]
    fn durations() {
        let s = RelaySettings::default();
        assert_eq!(s.heartbeat.ping_interval(), Duration::from_secs(30));
        assert_eq!(s.broker.api_timeout(), Duration::from_secs(30));
        assert_eq!(s.broker.probe_timeout(), Duration::from_secs(10));
    }
}
