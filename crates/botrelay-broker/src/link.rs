//! Transport seam and per-connection link state.
//!
//! The broker never touches a WebSocket directly. The server hands it a
//! [`FrameSink`] for writes and a stream of [`Inbound`] frames for reads,
//! which keeps every broker flow testable with in-memory channels.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use botrelay_core::{Event, LinkError, RelayError};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), LinkError>;
    /// Write a Ping control frame.
    async fn send_ping(&mut self) -> Result<(), LinkError>;
    /// Send a Close frame and release the transport.
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// A frame read from a connection, already stripped of transport detail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// UTF-8 payload (binary frames are decoded by the transport).
    Text(String),
    /// Peer-initiated ping.
    Ping,
    /// Reply to one of our pings.
    Pong,
    /// Peer asked to close.
    Close,
}

/// Frame captured by a [`ChannelSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Ping frame.
    Ping,
    /// Close frame.
    Close,
}

/// [`FrameSink`] backed by an unbounded channel.
///
/// Writes fail with [`LinkError::Closed`] once the receiver is dropped,
/// which is how tests simulate a dead peer.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes its frames.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, frame: Outbound) -> Result<(), LinkError> {
        self.tx.send(frame).map_err(|_| LinkError::Closed)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), LinkError> {
        self.push(Outbound::Text(text))
    }

    async fn send_ping(&mut self) -> Result<(), LinkError> {
        self.push(Outbound::Ping)
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.push(Outbound::Close)
    }
}

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Upgraded, not yet registered.
    Connecting = 0,
    /// Registered and routable.
    Established = 1,
    /// Cleanup in progress.
    Closing = 2,
    /// Cleanup finished.
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Established,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomic [`ConnState`] cell.
///
/// Entering `Closing` is a compare-and-swap, so exactly one caller wins
/// the right to run cleanup.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Default for Lifecycle {
    fn default() -> Self {
        Self(AtomicU8::new(ConnState::Connecting as u8))
    }
}

impl Lifecycle {
    /// Current state.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Connecting → Established`. Returns `false` if already past it.
    pub fn establish(&self) -> bool {
        self.transition(ConnState::Connecting, ConnState::Established)
    }

    /// Move to `Closing` from any open state. Only the first caller gets `true`.
    pub fn begin_close(&self) -> bool {
        self.transition(ConnState::Established, ConnState::Closing)
            || self.transition(ConnState::Connecting, ConnState::Closing)
    }

    /// `Closing → Closed`.
    pub fn finish_close(&self) {
        let _ = self.transition(ConnState::Closing, ConnState::Closed);
    }

    /// Whether writes are still allowed.
    pub fn is_open(&self) -> bool {
        matches!(self.state(), ConnState::Connecting | ConnState::Established)
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// State shared by every connection regardless of role.
pub struct Link {
    remote: String,
    connected_at: Instant,
    last_heartbeat: Mutex<Option<Instant>>,
    sink: AsyncMutex<Box<dyn FrameSink>>,
    lifecycle: Lifecycle,
    cancel: CancellationToken,
}

impl Link {
    /// Wrap a sink. `cancel` ends the connection's read and heartbeat loops.
    pub fn new(remote: impl Into<String>, sink: Box<dyn FrameSink>, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            remote: remote.into(),
            connected_at: now,
            last_heartbeat: Mutex::new(None),
            sink: AsyncMutex::new(sink),
            lifecycle: Lifecycle::default(),
            cancel,
        }
    }

    /// Remote socket address.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Write one text frame under the connection's send lock.
    pub async fn send_text(&self, text: String) -> Result<(), LinkError> {
        if !self.lifecycle.is_open() {
            return Err(LinkError::Closed);
        }
        self.sink.lock().await.send_text(text).await
    }

    /// Serialize and write an event.
    pub async fn send_event(&self, event: &Event) -> Result<(), RelayError> {
        let text = event.to_json()?;
        Ok(self.send_text(text).await?)
    }

    /// Write a Ping frame.
    pub async fn send_ping(&self) -> Result<(), LinkError> {
        if !self.lifecycle.is_open() {
            return Err(LinkError::Closed);
        }
        self.sink.lock().await.send_ping().await
    }

    /// Close the transport. Errors are irrelevant at this point.
    pub(crate) async fn close_sink(&self) {
        let _ = self.sink.lock().await.close().await;
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn mark_alive(&self) {
        *self.last_heartbeat.lock() = Some(Instant::now());
    }

    /// Time since the last inbound frame, `None` until the first one.
    pub fn last_heartbeat_elapsed(&self) -> Option<Duration> {
        self.last_heartbeat.lock().map(|at| at.elapsed())
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Lifecycle cell.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Token cancelled when the connection must stop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A registered connection of either role.
pub trait Peer: Send + Sync + 'static {
    /// Shared link state.
    fn link(&self) -> &Link;
    /// Identity for logs.
    fn label(&self) -> String;
}
