//! Relay shutdown: stop accepting, cancel every broker connection, then
//! wait a bounded time for the serve task.

use std::sync::Arc;
use std::time::Duration;

use botrelay_broker::Broker;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What was still in flight when shutdown finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The serve task exited before the deadline.
    pub drained: bool,
    /// Connections still registered.
    pub open_connections: usize,
    /// API calls that never got a reply.
    pub pending_requests: usize,
    /// Cached events that never reached a Processor.
    pub discarded_events: usize,
}

/// Owns the listener's stop signal and the broker it fronts.
pub struct ShutdownCoordinator {
    listener: CancellationToken,
    broker: Arc<Broker>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Coordinator for `broker`.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            listener: CancellationToken::new(),
            broker,
            serve_task: Mutex::new(None),
        }
    }

    /// Resolves once the listener should stop accepting.
    pub(crate) fn listener_token(&self) -> CancellationToken {
        self.listener.clone()
    }

    /// Remember the serve task so [`Self::drain`] can await it.
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.serve_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop accepting and cancel every live connection. Idempotent.
    pub fn trigger(&self) {
        self.listener.cancel();
        self.broker.shutdown();
    }

    /// Whether [`Self::trigger`] has run.
    pub fn is_shutting_down(&self) -> bool {
        self.listener.is_cancelled()
    }

    /// Trigger, then wait up to `timeout` for the serve task to exit.
    pub async fn drain(&self, timeout: Duration) -> ShutdownReport {
        self.trigger();
        let task = self.serve_task.lock().take();
        let drained = match task {
            Some(handle) => {
                info!(timeout_secs = timeout.as_secs(), "waiting for listener to stop");
                matches!(tokio::time::timeout(timeout, handle).await, Ok(Ok(())))
            }
            None => true,
        };

        let snapshot = self.broker.snapshot();
        let report = ShutdownReport {
            drained,
            open_connections: snapshot.adapters + snapshot.processors,
            pending_requests: snapshot.pending_requests,
            discarded_events: snapshot.cached_messages,
        };
        if !drained {
            warn!("listener did not stop within {timeout:?}");
        }
        if report.discarded_events > 0 {
            warn!(events = report.discarded_events, "cached events discarded at shutdown");
        }
        info!(
            open_connections = report.open_connections,
            pending_requests = report.pending_requests,
            "shutdown finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botrelay_broker::link::Peer;
    use botrelay_broker::{BrokerConfig, ChannelSink, RoutingRules};
    use botrelay_core::Event;

    fn coordinator() -> ShutdownCoordinator {
        ShutdownCoordinator::new(Broker::new(BrokerConfig::default(), RoutingRules::new()))
    }

    #[tokio::test]
    async fn trigger_cancels_listener_and_connections() {
        let coord = coordinator();
        let (sink, _rx) = ChannelSink::pair();
        let processor = coord.broker.connect_processor("10.0.0.9:1", Box::new(sink));
        let token = coord.listener_token();

        coord.trigger();
        coord.trigger();
        assert!(coord.is_shutting_down());
        assert!(token.is_cancelled());
        assert!(coord.broker.is_shutting_down());
        assert!(processor.link().cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_serve_task() {
        let coord = coordinator();
        let token = coord.listener_token();
        coord.track(tokio::spawn(async move { token.cancelled().await }));

        let report = coord.drain(Duration::from_secs(1)).await;
        assert!(report.drained);
        assert_eq!(report.open_connections, 0);
    }

    #[tokio::test]
    async fn drain_without_listener_is_immediate() {
        let report = coordinator().drain(Duration::from_millis(10)).await;
        assert!(report.drained);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_serve_task_is_reported() {
        let coord = coordinator();
        coord.track(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        }));
        let report = coord.drain(Duration::from_millis(100)).await;
        assert!(!report.drained);
    }

    #[tokio::test]
    async fn undelivered_events_are_counted() {
        let coord = coordinator();
        let event = Event {
            post_type: Some("notice".into()),
            ..Event::default()
        };
        let _ = coord.broker.route_event(event, None).await;

        let report = coord.drain(Duration::from_millis(10)).await;
        assert_eq!(report.discarded_events, 1);
        assert_eq!(report.pending_requests, 0);
    }
}
