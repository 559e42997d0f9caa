//! Typed OneBot-style wire payload.
//!
//! The broker only inspects a handful of fields. Those are named and typed
//! here; everything else rides along in [`Event::extra`] and is written back
//! out untouched.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::Result;
use crate::ids::AdapterId;

/// A JSON frame exchanged with Adapters or Processors.
///
/// The same shape covers inbound platform events, outbound API calls
/// (`action` + `params`) and API responses (`status` + `retcode` + `data`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// `message`, `notice`, `request` or `meta_event`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_type: Option<String>,
    /// `private` or `group` for message events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    /// Sender id, always carried as a string.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    /// Group id, always carried as a string.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_id: Option<String>,
    /// Adapter (bot account) id, always carried as a string.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub self_id: Option<String>,
    /// Unix timestamp in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    /// Platform tag of the originating Adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// API action name for outbound calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// API call parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Correlation id. Any JSON value on the caller side; a broker token on the wire to Adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
    /// API response code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retcode: Option<i64>,
    /// API response status (`ok`, `async`, `failed`). Heartbeat meta-events
    /// reuse the key for an object, so any JSON value is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    /// Human-readable response message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// API response data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Fields the broker does not inspect.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Parse a frame from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize the frame to JSON text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this frame is an API call (`action` present).
    pub fn is_api_call(&self) -> bool {
        self.action.as_deref().is_some_and(|a| !a.is_empty())
    }

    /// Whether this frame is an API response: no `post_type`, and a string
    /// `status` or a `retcode`.
    pub fn is_response(&self) -> bool {
        self.post_type.is_none() && (self.status_str().is_some() || self.retcode.is_some())
    }

    /// The `status` value as a string, if it is one.
    pub fn status_str(&self) -> Option<&str> {
        self.status.as_ref().and_then(Value::as_str)
    }

    /// The `echo` value as a string, if it is one.
    pub fn echo_str(&self) -> Option<&str> {
        self.echo.as_ref().and_then(Value::as_str)
    }

    /// A string or numeric field from `params`, stringified.
    pub fn param_id(&self, key: &str) -> Option<String> {
        self.params.as_ref()?.get(key).and_then(id_string)
    }

    /// The Adapter an API call explicitly addresses, top-level first.
    pub fn target_self_id(&self) -> Option<String> {
        self.self_id
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| self.param_id("self_id"))
    }

    /// Fill the fields Processors rely on.
    ///
    /// API responses only get their ids stringified (already done by
    /// deserialization); platform events also get `time`, `post_type`,
    /// `platform` and `self_id` defaults.
    pub fn normalize(&mut self, adapter: &AdapterId, platform: &str) {
        if self.is_response() {
            return;
        }
        if self.time.is_none() {
            self.time = Some(chrono::Utc::now().timestamp());
        }
        if self.post_type.is_none() {
            self.post_type = Some("message".to_owned());
        }
        if self.platform.as_deref().is_none_or(str::is_empty) {
            self.platform = Some(platform.to_owned());
        }
        if self.self_id.as_deref().is_none_or(str::is_empty) {
            self.self_id = Some(adapter.to_string());
        }
    }
}

/// Stringify a JSON id: strings pass through, integers are formatted.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_are_stringified() {
        let event = Event::from_json(
            r#"{"post_type":"message","user_id":12345,"group_id":678,"self_id":"999"}"#,
        )
        .unwrap();
        assert_eq!(event.user_id.as_deref(), Some("12345"));
        assert_eq!(event.group_id.as_deref(), Some("678"));
        assert_eq!(event.self_id.as_deref(), Some("999"));
    }

    #[test]
    fn null_ids_become_none() {
        let event = Event::from_json(r#"{"user_id":null,"group_id":""}"#).unwrap();
        assert!(event.user_id.is_none());
        assert!(event.group_id.is_none());
    }

    #[test]
    fn unknown_fields_pass_through() {
        let text = r#"{"post_type":"message","raw_message":"hi","sender":{"nickname":"n"}}"#;
        let event = Event::from_json(text).unwrap();
        assert_eq!(event.extra["raw_message"], "hi");
        let out: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(out["sender"]["nickname"], "n");
        assert_eq!(out["raw_message"], "hi");
    }

    #[test]
    fn echo_keeps_arbitrary_json() {
        let event = Event::from_json(r#"{"action":"send_msg","echo":{"seq":7}}"#).unwrap();
        assert_eq!(event.echo, Some(json!({"seq": 7})));
        assert!(event.echo_str().is_none());
    }

    #[test]
    fn api_call_and_response_detection() {
        let call = Event::from_json(r#"{"action":"send_msg","params":{}}"#).unwrap();
        assert!(call.is_api_call());
        assert!(!call.is_response());

        let resp = Event::from_json(r#"{"status":"ok","retcode":0,"data":null}"#).unwrap();
        assert!(resp.is_response());
        assert!(!resp.is_api_call());
    }

    #[test]
    fn heartbeat_meta_event_is_not_a_response() {
        let heartbeat = Event::from_json(
            r#"{"time":1700000000,"self_id":10001,"post_type":"meta_event","meta_event_type":"heartbeat","status":{"online":true,"good":true},"interval":5000}"#,
        )
        .unwrap();
        assert!(!heartbeat.is_response());
        assert!(heartbeat.status_str().is_none());
        assert_eq!(heartbeat.status, Some(json!({"online": true, "good": true})));
        assert_eq!(heartbeat.self_id.as_deref(), Some("10001"));
        assert_eq!(heartbeat.extra["interval"], 5000);
    }

    #[test]
    fn normalize_fills_defaults() {
        let mut event = Event::from_json(r#"{"user_id":1}"#).unwrap();
        event.normalize(&AdapterId::from("10001"), "qq");
        assert_eq!(event.post_type.as_deref(), Some("message"));
        assert_eq!(event.platform.as_deref(), Some("qq"));
        assert_eq!(event.self_id.as_deref(), Some("10001"));
        assert!(event.time.is_some());
    }

    #[test]
    fn normalize_keeps_existing_values() {
        let mut event =
            Event::from_json(r#"{"post_type":"notice","self_id":5,"time":42,"platform":"tg"}"#)
                .unwrap();
        event.normalize(&AdapterId::from("other"), "qq");
        assert_eq!(event.post_type.as_deref(), Some("notice"));
        assert_eq!(event.self_id.as_deref(), Some("5"));
        assert_eq!(event.time, Some(42));
        assert_eq!(event.platform.as_deref(), Some("tg"));
    }

    #[test]
    fn normalize_leaves_responses_alone() {
        let mut resp = Event::from_json(r#"{"status":"ok","retcode":0}"#).unwrap();
        resp.normalize(&AdapterId::from("10001"), "qq");
        assert!(resp.post_type.is_none());
        assert!(resp.self_id.is_none());
    }

    #[test]
    fn target_self_id_prefers_top_level() {
        let call =
            Event::from_json(r#"{"action":"x","self_id":1,"params":{"self_id":2}}"#).unwrap();
        assert_eq!(call.target_self_id().as_deref(), Some("1"));

        let nested = Event::from_json(r#"{"action":"x","params":{"self_id":2}}"#).unwrap();
        assert_eq!(nested.target_self_id().as_deref(), Some("2"));
    }

    #[test]
    fn param_id_stringifies_numbers() {
        let call = Event::from_json(r#"{"action":"send_msg","params":{"group_id":55}}"#).unwrap();
        assert_eq!(call.param_id("group_id").as_deref(), Some("55"));
        assert!(call.param_id("user_id").is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(Event::from_json("{not json").is_err());
        assert!(Event::from_json("").is_err());
    }
}
