//! Live connection registry.
//!
//! One read/write lock covers both populations. Adapters are keyed by their
//! current identity; Processors live in a list in connect order. Removal
//! always compares the connection itself, not just its identity, so cleanup
//! of an old socket can never evict a newer one that took over its key.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use botrelay_core::AdapterId;
use metrics::{counter, gauge};
use parking_lot::RwLock;

use crate::connection::{AdapterConnection, HealthPolicy, ProcessorConnection};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL};

/// Which population a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Platform bridge.
    Adapter,
    /// Business-logic worker.
    Processor,
}

impl ConnectionKind {
    /// Metric/log label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Adapter => "adapter",
            Self::Processor => "processor",
        }
    }
}

/// Point-in-time registry counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live Adapters.
    pub adapters: usize,
    /// Live Processors.
    pub processors: usize,
    /// Adapters ever registered.
    pub total_adapter_connects: u64,
    /// Processors ever registered.
    pub total_processor_connects: u64,
}

/// Outcome of [`ConnectionRegistry::rekey_adapter`].
#[derive(Debug)]
pub enum Rekey {
    /// Identity changed.
    Moved {
        /// Identity before the move.
        old: AdapterId,
        /// Connection that previously held the new identity, if any.
        displaced: Option<Arc<AdapterConnection>>,
    },
    /// The new identity equals the current one; it is now durable.
    Unchanged,
    /// The identity was already durable.
    AlreadyDurable,
    /// The connection is no longer registered.
    NotRegistered,
}

#[derive(Default)]
struct Inner {
    adapters: HashMap<AdapterId, Arc<AdapterConnection>>,
    processors: Vec<Arc<ProcessorConnection>>,
}

/// Registry of live Adapter and Processor connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    total_adapter_connects: AtomicU64,
    total_processor_connects: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an Adapter under its current identity.
    ///
    /// Returns the connection that previously held that identity, which the
    /// caller must close.
    pub fn register_adapter(&self, conn: Arc<AdapterConnection>) -> Option<Arc<AdapterConnection>> {
        let displaced = {
            let mut inner = self.inner.write();
            let displaced = inner.adapters.insert(conn.id(), conn);
            publish_counts(&inner);
            displaced
        };
        let _ = self.total_adapter_connects.fetch_add(1, Ordering::Relaxed);
        counter!(CONNECTIONS_TOTAL, "kind" => ConnectionKind::Adapter.label()).increment(1);
        displaced
    }

    /// Append a Processor to the live list.
    pub fn register_processor(&self, conn: Arc<ProcessorConnection>) {
        {
            let mut inner = self.inner.write();
            inner.processors.push(conn);
            publish_counts(&inner);
        }
        let _ = self.total_processor_connects.fetch_add(1, Ordering::Relaxed);
        counter!(CONNECTIONS_TOTAL, "kind" => ConnectionKind::Processor.label()).increment(1);
    }

    /// Remove an Adapter if it is still the one registered under its identity.
    pub fn unregister_adapter(&self, conn: &Arc<AdapterConnection>) -> bool {
        let mut inner = self.inner.write();
        let id = conn.id();
        let owned = inner
            .adapters
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, conn));
        if owned {
            let _ = inner.adapters.remove(&id);
            publish_counts(&inner);
        }
        owned
    }

    /// Remove a Processor from the live list.
    pub fn unregister_processor(&self, conn: &Arc<ProcessorConnection>) -> bool {
        let mut inner = self.inner.write();
        let before = inner.processors.len();
        inner.processors.retain(|p| !Arc::ptr_eq(p, conn));
        let removed = inner.processors.len() != before;
        if removed {
            publish_counts(&inner);
        }
        removed
    }

    /// Look up an Adapter by identity.
    pub fn find_adapter(&self, id: &str) -> Option<Arc<AdapterConnection>> {
        self.inner.read().adapters.get(id).cloned()
    }

    /// Look up a Processor by identity.
    pub fn find_processor(&self, id: &str) -> Option<Arc<ProcessorConnection>> {
        self.inner
            .read()
            .processors
            .iter()
            .find(|p| p.id().as_str() == id)
            .cloned()
    }

    /// Any Adapter other than `exclude`, lowest identity first.
    pub fn any_adapter(&self, exclude: Option<&Arc<AdapterConnection>>) -> Option<Arc<AdapterConnection>> {
        let inner = self.inner.read();
        inner
            .adapters
            .iter()
            .filter(|(_, conn)| exclude.is_none_or(|ex| !Arc::ptr_eq(conn, ex)))
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, conn)| conn.clone())
    }

    /// All live Adapters.
    pub fn adapters(&self) -> Vec<Arc<AdapterConnection>> {
        self.inner.read().adapters.values().cloned().collect()
    }

    /// All live Processors in connect order.
    pub fn processors(&self) -> Vec<Arc<ProcessorConnection>> {
        self.inner.read().processors.clone()
    }

    /// Live Processors passing the health predicate, in connect order.
    pub fn healthy_processors(&self, policy: &HealthPolicy) -> Vec<Arc<ProcessorConnection>> {
        self.inner
            .read()
            .processors
            .iter()
            .filter(|p| p.is_healthy(policy))
            .cloned()
            .collect()
    }

    /// Move an Adapter to its durable identity.
    ///
    /// Delete and insert happen under one write lock, so a concurrent lookup
    /// sees the connection under either the old or the new key, never
    /// neither. Each connection may be rekeyed at most once.
    pub fn rekey_adapter(&self, conn: &Arc<AdapterConnection>, new_id: AdapterId) -> Rekey {
        let mut inner = self.inner.write();
        let old = conn.id();
        let registered = inner
            .adapters
            .get(&old)
            .is_some_and(|current| Arc::ptr_eq(current, conn));
        if !registered {
            return Rekey::NotRegistered;
        }
        if !conn.claim_rekey() {
            return Rekey::AlreadyDurable;
        }
        if old == new_id {
            return Rekey::Unchanged;
        }

        let _ = inner.adapters.remove(&old);
        conn.set_id(new_id.clone());
        let displaced = inner.adapters.insert(new_id, conn.clone());
        publish_counts(&inner);
        Rekey::Moved { old, displaced }
    }

    /// Snapshot of connection counts.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            adapters: inner.adapters.len(),
            processors: inner.processors.len(),
            total_adapter_connects: self.total_adapter_connects.load(Ordering::Relaxed),
            total_processor_connects: self.total_processor_connects.load(Ordering::Relaxed),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn publish_counts(inner: &Inner) {
    gauge!(CONNECTIONS_ACTIVE, "kind" => ConnectionKind::Adapter.label())
        .set(inner.adapters.len() as f64);
    gauge!(CONNECTIONS_ACTIVE, "kind" => ConnectionKind::Processor.label())
        .set(inner.processors.len() as f64);
}
