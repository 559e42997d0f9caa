//! Per-connection read loops.
//!
//! The transport hands over a stream of [`Inbound`] frames; these loops own
//! it until the peer closes, the read deadline passes, or the connection is
//! cancelled, then tear the connection down.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, instrument};

use crate::broker::Broker;
use crate::connection::{AdapterConnection, ProcessorConnection};
use crate::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::link::{Inbound, Link, Peer};

/// Why a read loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// The peer sent a Close frame.
    PeerClosed,
    /// The frame stream ended.
    StreamEnded,
    /// Nothing arrived within the read deadline.
    ReadTimeout,
    /// The connection was cancelled (shutdown, displacement, failed write).
    Cancelled,
}

impl EndReason {
    /// Short label for logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::StreamEnded => "stream_ended",
            Self::ReadTimeout => "read_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Drive an Adapter connection to completion.
#[instrument(skip_all, fields(remote = conn.link().remote()))]
pub async fn drive_adapter<S>(broker: Arc<Broker>, conn: Arc<AdapterConnection>, mut frames: S) -> EndReason
where
    S: Stream<Item = Inbound> + Unpin,
{
    let heartbeat = spawn_heartbeat(conn.clone(), broker.config().ping_interval);
    let deadline = broker.config().adapter_read_timeout;
    let reason = loop {
        match next_text(conn.link(), &mut frames, deadline).await {
            Ok(text) => broker.handle_adapter_frame(&conn, &text).await,
            Err(reason) => break reason,
        }
    };
    debug!(adapter_id = %conn.id(), reason = reason.label(), "adapter read loop ended");
    let _ = broker.disconnect_adapter(&conn).await;
    let _ = heartbeat.await;
    reason
}

/// Drive a Processor connection to completion.
#[instrument(skip_all, fields(processor_id = %conn.id()))]
pub async fn drive_processor<S>(broker: Arc<Broker>, conn: Arc<ProcessorConnection>, mut frames: S) -> EndReason
where
    S: Stream<Item = Inbound> + Unpin,
{
    let heartbeat = spawn_heartbeat(conn.clone(), broker.config().ping_interval);
    let deadline = broker.config().processor_read_timeout;
    let reason = loop {
        match next_text(conn.link(), &mut frames, deadline).await {
            Ok(text) => broker.handle_processor_frame(&conn, &text),
            Err(reason) => break reason,
        }
    };
    debug!(reason = reason.label(), "processor read loop ended");
    let _ = broker.disconnect_processor(&conn).await;
    let _ = heartbeat.await;
    reason
}

/// Run the ping loop; a failed ping cancels the connection so the read
/// loop stops too.
fn spawn_heartbeat<P: Peer>(peer: Arc<P>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if run_heartbeat(peer.clone(), interval).await == HeartbeatResult::SendFailed {
            peer.link().cancel_token().cancel();
        }
    })
}

/// Next text frame, refreshing liveness on every frame seen.
async fn next_text<S>(link: &Link, frames: &mut S, deadline: Duration) -> Result<String, EndReason>
where
    S: Stream<Item = Inbound> + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = link.cancel_token().cancelled() => return Err(EndReason::Cancelled),
            next = time::timeout(deadline, frames.next()) => match next {
                Err(_) => return Err(EndReason::ReadTimeout),
                Ok(None) => return Err(EndReason::StreamEnded),
                Ok(Some(frame)) => frame,
            },
        };
        link.mark_alive();
        match frame {
            Inbound::Text(text) => return Ok(text),
            Inbound::Ping | Inbound::Pong => {}
            Inbound::Close => return Err(EndReason::PeerClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AdapterHints, BrokerConfig};
    use crate::link::{ChannelSink, Outbound};
    use crate::routing::RoutingRules;
    use futures::channel::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn broker() -> Arc<Broker> {
        Broker::new(
            BrokerConfig {
                probe_login_info: false,
                ..BrokerConfig::default()
            },
            RoutingRules::new(),
        )
    }

    async fn adapter(broker: &Arc<Broker>) -> (Arc<AdapterConnection>, UnboundedReceiver<Outbound>) {
        let (sink, rx) = ChannelSink::pair();
        let hints = AdapterHints {
            self_id: Some("10001".into()),
            platform: None,
        };
        (broker.connect_adapter("10.0.0.1:1", hints, Box::new(sink)).await, rx)
    }

    #[tokio::test]
    async fn close_frame_ends_adapter_loop() {
        let broker = broker();
        let (conn, _rx) = adapter(&broker).await;
        let (tx, frames) = mpsc::unbounded();
        tx.unbounded_send(Inbound::Pong).unwrap();
        tx.unbounded_send(Inbound::Close).unwrap();

        let reason = drive_adapter(broker.clone(), conn.clone(), frames).await;
        assert_eq!(reason, EndReason::PeerClosed);
        assert_eq!(broker.registry().stats().adapters, 0);
        assert!(!conn.link().lifecycle().is_open());
    }

    #[tokio::test]
    async fn text_frames_reach_the_broker() {
        let broker = broker();
        let (conn, _rx) = adapter(&broker).await;
        let (tx, frames) = mpsc::unbounded();
        tx.unbounded_send(Inbound::Text(r#"{"group_id":5}"#.into())).unwrap();
        drop(tx);

        let reason = drive_adapter(broker.clone(), conn.clone(), frames).await;
        assert_eq!(reason, EndReason::StreamEnded);
        assert_eq!(conn.received_count(), 1);
        assert_eq!(broker.cache().len(), 1);
        assert_eq!(broker.contacts().adapter_for_group("5").as_deref(), Some("10001"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_processor_hits_read_deadline() {
        let broker = broker();
        let (sink, mut rx) = ChannelSink::pair();
        let conn = broker.connect_processor("10.0.0.9:1", Box::new(sink));
        let (_tx, frames) = mpsc::unbounded::<Inbound>();

        let reason = drive_processor(broker.clone(), conn, frames).await;
        assert_eq!(reason, EndReason::ReadTimeout);
        assert_eq!(broker.registry().stats().processors, 0);

        let mut pings = 0;
        while let Ok(frame) = rx.try_recv() {
            if frame == Outbound::Ping {
                pings += 1;
            }
        }
        assert!(pings >= 1, "heartbeat should have pinged before the deadline");
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_processor_alive() {
        let broker = broker();
        let (sink, _rx) = ChannelSink::pair();
        let conn = broker.connect_processor("10.0.0.9:1", Box::new(sink));
        let (tx, frames) = mpsc::unbounded();

        let driver = tokio::spawn(drive_processor(broker.clone(), conn.clone(), frames));
        for _ in 0..4 {
            time::sleep(Duration::from_secs(50)).await;
            tx.unbounded_send(Inbound::Pong).unwrap();
        }
        assert_eq!(broker.registry().stats().processors, 1);

        broker.shutdown();
        assert_eq!(driver.await.unwrap(), EndReason::Cancelled);
        assert_eq!(broker.registry().stats().processors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_cancels_connection() {
        let broker = broker();
        let (sink, rx) = ChannelSink::pair();
        let conn = broker.connect_processor("10.0.0.9:1", Box::new(sink));
        drop(rx);
        let (_tx, frames) = mpsc::unbounded::<Inbound>();

        let reason = drive_processor(broker.clone(), conn, frames).await;
        assert_eq!(reason, EndReason::Cancelled);
    }

    #[tokio::test]
    async fn processor_api_call_is_forwarded() {
        let broker = broker();
        let (_adapter, mut adapter_rx) = adapter(&broker).await;
        let (sink, _rx) = ChannelSink::pair();
        let conn = broker.connect_processor("10.0.0.9:1", Box::new(sink));
        let (tx, frames) = mpsc::unbounded();
        tx.unbounded_send(Inbound::Text(r#"{"action":"get_status","echo":"e"}"#.into()))
            .unwrap();

        let driver = tokio::spawn(drive_processor(broker.clone(), conn, frames));
        let frame = time::timeout(Duration::from_secs(1), adapter_rx.recv()).await.unwrap();
        assert!(matches!(frame, Some(Outbound::Text(text)) if text.contains("get_status")));
        drop(tx);
        assert_eq!(driver.await.unwrap(), EndReason::StreamEnded);
    }
}
