//! Bounded FIFO of events that found no Processor.

use std::collections::VecDeque;

use botrelay_core::{AdapterId, Event};
use parking_lot::Mutex;
use tokio::time::Instant;

/// An undeliverable event with the context needed to route it again.
#[derive(Clone, Debug)]
pub struct CachedMessage {
    /// The normalized event.
    pub event: Event,
    /// Adapter it came from, if any.
    pub source: Option<AdapterId>,
    /// When it was parked.
    pub cached_at: Instant,
}

impl CachedMessage {
    /// Wrap an event, stamping it now.
    pub fn new(event: Event, source: Option<AdapterId>) -> Self {
        Self {
            event,
            source,
            cached_at: Instant::now(),
        }
    }
}

/// Bounded message cache; the oldest entry is dropped when full.
pub struct MessageCache {
    queue: Mutex<VecDeque<CachedMessage>>,
    capacity: usize,
}

impl MessageCache {
    /// Create a cache holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a message, returning the evicted one if the cache was full.
    pub fn push(&self, message: CachedMessage) -> Option<CachedMessage> {
        let mut queue = self.queue.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(message);
        evicted
    }

    /// Take everything, leaving the cache empty. Concurrent callers split
    /// the contents; no message is returned twice.
    pub fn drain(&self) -> Vec<CachedMessage> {
        std::mem::take(&mut *self.queue.lock()).into()
    }

    /// Messages currently held.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
