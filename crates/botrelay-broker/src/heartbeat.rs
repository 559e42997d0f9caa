//! Server-initiated ping loop.
//!
//! Liveness itself is judged by the read deadline in the connection driver;
//! this loop only keeps traffic flowing so idle peers answer with pongs.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::debug;

use crate::link::Peer;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// A ping could not be written; the connection should be torn down.
    SendFailed,
    /// The connection's cancel token fired.
    Cancelled,
}

/// Ping `peer` every `interval` until a write fails or the peer is cancelled.
pub async fn run_heartbeat<P: Peer>(peer: Arc<P>, interval: Duration) -> HeartbeatResult {
    let cancel = peer.link().cancel_token().clone();
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = peer.link().send_ping().await {
                    debug!(peer = %peer.label(), %err, "ping failed, stopping heartbeat");
                    return HeartbeatResult::SendFailed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
