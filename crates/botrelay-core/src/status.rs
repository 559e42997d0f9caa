//! Synthesized reply vocabulary.
//!
//! When the broker cannot obtain a real reply for a Processor's API call it
//! answers on the Adapter's behalf. Each failure has a stable `retcode` so
//! Processors can branch on it without parsing `msg`.

use serde_json::Value;

use crate::event::Event;

/// Status string carried by every synthesized failure.
pub const STATUS_FAILED: &str = "failed";

/// Retcode: no Adapter was connected to take the call.
pub const RETCODE_NO_TARGET: i64 = 503;
/// Retcode: every candidate Adapter rejected the write.
pub const RETCODE_FORWARD_FAILED: i64 = 502;
/// Retcode: no reply arrived before the deadline.
pub const RETCODE_TIMEOUT: i64 = 504;

/// Why the broker answered a call itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No target Adapter available.
    NoTarget,
    /// Forwarding to the Adapter failed.
    ForwardFailed,
    /// The Adapter did not reply in time.
    Timeout,
}

impl FailureKind {
    /// Stable numeric code.
    #[must_use]
    pub fn retcode(self) -> i64 {
        match self {
            Self::NoTarget => RETCODE_NO_TARGET,
            Self::ForwardFailed => RETCODE_FORWARD_FAILED,
            Self::Timeout => RETCODE_TIMEOUT,
        }
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::NoTarget => "no target available",
            Self::ForwardFailed => "forward failed",
            Self::Timeout => "request timeout",
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NoTarget => "no_target",
            Self::ForwardFailed => "forward_failed",
            Self::Timeout => "timeout",
        }
    }

    /// Build the reply frame, carrying `echo` through unchanged.
    #[must_use]
    pub fn reply(self, echo: Option<Value>) -> Event {
        Event {
            status: Some(Value::from(STATUS_FAILED)),
            retcode: Some(self.retcode()),
            msg: Some(self.message().to_owned()),
            echo,
            ..Event::default()
        }
    }

    /// Recognize a synthesized failure from its retcode.
    #[must_use]
    pub fn from_reply(reply: &Event) -> Option<Self> {
        if reply.status_str() != Some(STATUS_FAILED) {
            return None;
        }
        match reply.retcode? {
            RETCODE_NO_TARGET => Some(Self::NoTarget),
            RETCODE_FORWARD_FAILED => Some(Self::ForwardFailed),
            RETCODE_TIMEOUT => Some(Self::Timeout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retcodes_are_distinct() {
        let codes = [
            FailureKind::NoTarget.retcode(),
            FailureKind::ForwardFailed.retcode(),
            FailureKind::Timeout.retcode(),
        ];
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
        assert_ne!(codes[0], codes[2]);
    }

    #[test]
    fn reply_shape() {
        let reply = FailureKind::Timeout.reply(Some(json!("req-1")));
        let value: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["retcode"], 504);
        assert_eq!(value["msg"], "request timeout");
        assert_eq!(value["echo"], "req-1");
        assert!(value.get("post_type").is_none());
    }

    #[test]
    fn from_reply_recognizes_each_kind() {
        for kind in [
            FailureKind::NoTarget,
            FailureKind::ForwardFailed,
            FailureKind::Timeout,
        ] {
            assert_eq!(FailureKind::from_reply(&kind.reply(None)), Some(kind));
        }
    }

    #[test]
    fn from_reply_ignores_real_failures() {
        let reply = Event {
            status: Some("failed".into()),
            retcode: Some(100),
            ..Event::default()
        };
        assert_eq!(FailureKind::from_reply(&reply), None);

        let ok = Event {
            status: Some("ok".into()),
            retcode: Some(RETCODE_TIMEOUT),
            ..Event::default()
        };
        assert_eq!(FailureKind::from_reply(&ok), None);
    }
}
