//! Adapter and Processor connection state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use botrelay_core::{AdapterId, ProcessorId};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::link::{Link, Peer};

/// Liveness thresholds for Processors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Healthy if any frame arrived within this window.
    pub heartbeat_window: Duration,
    /// Healthy regardless of heartbeats for this long after connecting.
    pub connect_grace: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            heartbeat_window: Duration::from_secs(60),
            connect_grace: Duration::from_secs(10),
        }
    }
}

/// A connected Adapter (bot).
pub struct AdapterConnection {
    link: Link,
    id: RwLock<AdapterId>,
    rekeyed: AtomicBool,
    platform: String,
    sent: AtomicU64,
    received: AtomicU64,
}

impl AdapterConnection {
    /// Create a connection. `durable` marks an identity that may not be rekeyed.
    pub fn new(link: Link, id: AdapterId, platform: impl Into<String>, durable: bool) -> Self {
        Self {
            link,
            id: RwLock::new(id),
            rekeyed: AtomicBool::new(durable),
            platform: platform.into(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    /// Current registry identity.
    pub fn id(&self) -> AdapterId {
        self.id.read().clone()
    }

    /// Platform tag.
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Whether the identity is final.
    pub fn is_durable(&self) -> bool {
        self.rekeyed.load(Ordering::Acquire)
    }

    /// Claim the one allowed rekey. Only the first caller gets `true`.
    pub(crate) fn claim_rekey(&self) -> bool {
        self.rekeyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_id(&self, id: AdapterId) {
        *self.id.write() = id;
    }

    /// Count a frame written to the Adapter.
    pub fn record_sent(&self) {
        let _ = self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a frame read from the Adapter.
    pub fn record_received(&self) {
        let _ = self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames written so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames read so far.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AdapterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConnection")
            .field("id", &self.id())
            .field("remote", &self.link.remote())
            .field("durable", &self.is_durable())
            .finish_non_exhaustive()
    }
}

impl Peer for AdapterConnection {
    fn link(&self) -> &Link {
        &self.link
    }

    fn label(&self) -> String {
        self.id().into_inner()
    }
}

/// Bounded sliding window of latency samples with a running sum.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
    sum: Duration,
}

impl LatencyWindow {
    /// Create an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: Duration::ZERO,
        }
    }

    /// Add a sample, dropping the oldest when full.
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(oldest);
            }
        }
        self.samples.push_back(sample);
        self.sum = self.sum.saturating_add(sample);
    }

    /// Mean of the current samples, `None` when empty.
    pub fn average(&self) -> Option<Duration> {
        let n = u32::try_from(self.samples.len()).ok().filter(|n| *n > 0)?;
        Some(self.sum / n)
    }

    /// Samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
struct LatencyStats {
    rtt: LatencyWindow,
    processing: LatencyWindow,
}

/// A connected Processor (worker).
pub struct ProcessorConnection {
    link: Link,
    id: ProcessorId,
    handled: AtomicU64,
    latency: Mutex<LatencyStats>,
    last_dispatch: Mutex<Option<Instant>>,
}

impl ProcessorConnection {
    /// Create a connection keeping `window` samples per latency series.
    pub fn new(link: Link, id: ProcessorId, window: usize) -> Self {
        Self {
            link,
            id,
            handled: AtomicU64::new(0),
            latency: Mutex::new(LatencyStats {
                rtt: LatencyWindow::new(window),
                processing: LatencyWindow::new(window),
            }),
            last_dispatch: Mutex::new(None),
        }
    }

    /// Identity (remote address at connect time).
    pub fn id(&self) -> &ProcessorId {
        &self.id
    }

    /// Events delivered so far.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Count a successful delivery and stamp it for processing-time measurement.
    pub fn record_delivery(&self) {
        let _ = self.handled.fetch_add(1, Ordering::Relaxed);
        *self.last_dispatch.lock() = Some(Instant::now());
    }

    /// Consume the last delivery stamp, returning the time since it.
    pub fn take_dispatch_elapsed(&self) -> Option<Duration> {
        self.last_dispatch.lock().take().map(|at| at.elapsed())
    }

    /// Record an API round trip attributed to this Processor.
    pub fn record_rtt(&self, sample: Duration) {
        self.latency.lock().rtt.record(sample);
    }

    /// Record the time from delivery to the Processor's next API call.
    pub fn record_processing(&self, sample: Duration) {
        self.latency.lock().processing.record(sample);
    }

    /// Average API round trip.
    pub fn avg_rtt(&self) -> Option<Duration> {
        self.latency.lock().rtt.average()
    }

    /// Average processing time.
    pub fn avg_processing(&self) -> Option<Duration> {
        self.latency.lock().processing.average()
    }

    /// Heard from recently, or still inside the connect grace period.
    ///
    /// A Processor that has never sent a frame is healthy only during the grace.
    pub fn is_healthy(&self, policy: &HealthPolicy) -> bool {
        self.link
            .last_heartbeat_elapsed()
            .is_some_and(|elapsed| elapsed < policy.heartbeat_window)
            || self.link.age() < policy.connect_grace
    }
}

impl std::fmt::Debug for ProcessorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorConnection")
            .field("id", &self.id)
            .field("handled", &self.handled())
            .finish_non_exhaustive()
    }
}

impl Peer for ProcessorConnection {
    fn link(&self) -> &Link {
        &self.link
    }

    fn label(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::link::{ChannelSink, Outbound};

    pub(crate) fn adapter(id: &str) -> (Arc<AdapterConnection>, mpsc::UnboundedReceiver<Outbound>) {
        let (sink, rx) = ChannelSink::pair();
        let link = Link::new(id, Box::new(sink), CancellationToken::new());
        (
            Arc::new(AdapterConnection::new(link, AdapterId::from(id), "qq", false)),
            rx,
        )
    }

    pub(crate) fn processor(id: &str) -> (Arc<ProcessorConnection>, mpsc::UnboundedReceiver<Outbound>) {
        let (sink, rx) = ChannelSink::pair();
        let link = Link::new(id, Box::new(sink), CancellationToken::new());
        (
            Arc::new(ProcessorConnection::new(link, ProcessorId::from(id), 20)),
            rx,
        )
    }
}
