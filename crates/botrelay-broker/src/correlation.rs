//! Request/response correlation table.
//!
//! Each outstanding request owns a single-slot channel keyed by a
//! broker-minted [`RequestToken`]. Removing the entry from the map is the
//! linearization point: whichever of reply or expiry removes it first
//! decides the outcome, and the other becomes a no-op.

use std::collections::HashMap;
use std::time::Duration;

use botrelay_core::{Event, FailureKind, RequestToken};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::CORRELATION_MISSES_TOTAL;

struct Pending {
    tx: oneshot::Sender<Event>,
    sent_at: Instant,
    original_echo: Option<Value>,
}

/// Result of [`CorrelationTable::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The waiter received the payload.
    Delivered {
        /// Time since the request was registered.
        rtt: Duration,
    },
    /// No request is waiting on this token.
    Missing,
}

/// An entry removed by [`CorrelationTable::expire`].
#[derive(Clone, Debug, PartialEq)]
pub struct Expired {
    /// The caller's `echo`, for the synthesized reply.
    pub original_echo: Option<Value>,
    /// How long the request waited.
    pub waited: Duration,
}

/// Pending requests keyed by token.
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<RequestToken, Pending>>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before its frame is written.
    ///
    /// `original_echo` is put back on whatever payload resolves the token.
    pub fn register(&self, token: RequestToken, original_echo: Option<Value>) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(
            token,
            Pending {
                tx,
                sent_at: Instant::now(),
                original_echo,
            },
        );
        rx
    }

    /// Hand `payload` to the request waiting on `token`.
    ///
    /// A missing token (late reply, foreign echo) is logged and discarded.
    pub fn resolve(&self, token: &str, mut payload: Event) -> Resolution {
        let Some(pending) = self.pending.lock().remove(token) else {
            debug!(token, "no pending request for reply, discarding");
            counter!(CORRELATION_MISSES_TOTAL).increment(1);
            return Resolution::Missing;
        };
        let rtt = pending.sent_at.elapsed();
        payload.echo = pending.original_echo;
        // The waiter may already be gone during shutdown.
        let _ = pending.tx.send(payload);
        Resolution::Delivered { rtt }
    }

    /// Remove a request without delivering anything.
    ///
    /// Returns `None` if a reply already claimed the token.
    pub fn expire(&self, token: &str) -> Option<Expired> {
        let pending = self.pending.lock().remove(token)?;
        Some(Expired {
            original_echo: pending.original_echo,
            waited: pending.sent_at.elapsed(),
        })
    }

    /// Wait for the reply to `token`, synthesizing a timeout after `deadline`.
    ///
    /// Exactly one payload comes back: the resolved reply (its `echo`
    /// restored) or a timeout failure carrying the original `echo`.
    pub async fn wait(&self, token: &RequestToken, mut rx: oneshot::Receiver<Event>, deadline: Duration) -> Event {
        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) | Err(_) => match self.expire(token) {
                Some(expired) => {
                    debug!(token = %token, waited_ms = expired.waited.as_millis(), "request timed out");
                    FailureKind::Timeout.reply(expired.original_echo)
                }
                // A reply claimed the entry between the deadline and expire.
                None => match rx.await {
                    Ok(reply) => reply,
                    Err(_) => FailureKind::Timeout.reply(None),
                },
            },
        }
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use botrelay_core::status::RETCODE_TIMEOUT;
    use serde_json::json;
    use std::sync::Arc;

    fn ok_reply() -> Event {
        Event {
            status: Some("ok".into()),
            retcode: Some(0),
            echo: Some(json!("wire-token")),
            ..Event::default()
        }
    }

    #[tokio::test]
    async fn resolve_delivers_and_restores_echo() {
        let table = CorrelationTable::new();
        let token = RequestToken::mint("p1");
        let rx = table.register(token.clone(), Some(json!({"seq": 1})));
        assert_eq!(table.len(), 1);

        assert_matches!(table.resolve(&token, ok_reply()), Resolution::Delivered { .. });
        let reply = rx.await.unwrap();
        assert_eq!(reply.echo, Some(json!({"seq": 1})));
        assert!(table.is_empty());
    }

    #[test]
    fn resolve_unknown_token_is_missing() {
        let table = CorrelationTable::new();
        assert_eq!(table.resolve("nobody|1|1", ok_reply()), Resolution::Missing);
    }

    #[test]
    fn second_resolve_is_missing() {
        let table = CorrelationTable::new();
        let token = RequestToken::mint("p1");
        let _rx = table.register(token.clone(), None);
        assert_matches!(table.resolve(&token, ok_reply()), Resolution::Delivered { .. });
        assert_eq!(table.resolve(&token, ok_reply()), Resolution::Missing);
    }

    #[test]
    fn expire_after_resolve_is_none() {
        let table = CorrelationTable::new();
        let token = RequestToken::mint("p1");
        let _rx = table.register(token.clone(), Some(json!("e")));
        let _ = table.resolve(&token, ok_reply());
        assert!(table.expire(&token).is_none());
    }

    #[test]
    fn expire_returns_original_echo() {
        let table = CorrelationTable::new();
        let token = RequestToken::mint("p1");
        let _rx = table.register(token.clone(), Some(json!("e")));
        let expired = table.expire(&token).unwrap();
        assert_eq!(expired.original_echo, Some(json!("e")));
        assert_eq!(table.resolve(&token, ok_reply()), Resolution::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_once_and_discards_late_reply() {
        let table = CorrelationTable::new();
        let token = RequestToken::mint("p1");
        let rx = table.register(token.clone(), Some(json!("caller-echo")));

        let reply = table.wait(&token, rx, Duration::from_secs(30)).await;
        assert_eq!(reply.retcode, Some(RETCODE_TIMEOUT));
        assert_eq!(reply.status_str(), Some("failed"));
        assert_eq!(reply.echo, Some(json!("caller-echo")));
        assert!(table.is_empty());

        assert_eq!(table.resolve(&token, ok_reply()), Resolution::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_reply_before_deadline() {
        let table = Arc::new(CorrelationTable::new());
        let token = RequestToken::mint("p1");
        let rx = table.register(token.clone(), Some(json!(7)));

        let resolver = {
            let table = table.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                table.resolve(&token, ok_reply())
            })
        };

        let reply = table.wait(&token, rx, Duration::from_secs(30)).await;
        assert_eq!(reply.status_str(), Some("ok"));
        assert_eq!(reply.echo, Some(json!(7)));
        assert_matches!(resolver.await.unwrap(), Resolution::Delivered { rtt } if rtt >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn every_token_resolves_exactly_once_under_races() {
        let table = Arc::new(CorrelationTable::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let token = RequestToken::mint("p1");
            let rx = table.register(token.clone(), None);
            let racer = {
                let table = table.clone();
                let token = token.clone();
                tokio::spawn(async move { table.resolve(&token, ok_reply()) })
            };
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let reply = table.wait(&token, rx, Duration::from_millis(1)).await;
                let resolved = racer.await.unwrap();
                // Either the racer delivered (reply is ok) or expiry won (racer missed).
                match resolved {
                    Resolution::Delivered { .. } => assert_eq!(reply.status_str(), Some("ok")),
                    Resolution::Missing => assert_eq!(reply.retcode, Some(RETCODE_TIMEOUT)),
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(table.is_empty());
    }
}
