//! Broker façade.
//!
//! Owns every shared structure and implements the two end-to-end flows:
//! Adapter events routed to Processors, and Processor API calls forwarded
//! to Adapters with their replies correlated back.

use std::sync::Arc;
use std::time::Duration;

use botrelay_core::constants::{BROKER_ISSUER, DEFAULT_PLATFORM};
use botrelay_core::event::id_string;
use botrelay_core::ids::issuer_of;
use botrelay_core::{AdapterId, Event, FailureKind, ProcessorId, RequestToken, Result, RetryPolicy};
use botrelay_settings::RelaySettings;
use metrics::{counter, histogram};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::balancer::LoadBalancer;
use crate::cache::{CachedMessage, MessageCache};
use crate::connection::{AdapterConnection, HealthPolicy, ProcessorConnection};
use crate::contacts::ContactCache;
use crate::correlation::{CorrelationTable, Resolution};
use crate::link::{FrameSink, Link, Peer};
use crate::metrics::{
    ADAPTER_REKEYS_TOTAL, API_CALL_DURATION_SECONDS, API_CALLS_TOTAL, CACHE_EVICTIONS_TOTAL,
    CONNECTION_DURATION_SECONDS, DELIVERY_FAILURES_TOTAL, EVENTS_CACHED_TOTAL, EVENTS_ROUTED_TOTAL,
    RULE_TARGET_OFFLINE_TOTAL,
};
use crate::registry::{ConnectionKind, ConnectionRegistry, Rekey};
use crate::routing::{RouteDecision, RoutingRules};

/// Upper bound on sending a Close frame during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Action sent to Adapters that connect without announcing an identity.
const LOGIN_INFO_ACTION: &str = "get_login_info";

/// Runtime tuning derived from [`RelaySettings`].
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Deadline for Processor → Adapter API calls.
    pub api_timeout: Duration,
    /// Deadline for identity probes.
    pub probe_timeout: Duration,
    /// Whether to probe Adapters without an identity header.
    pub probe_login_info: bool,
    /// Message cache bound.
    pub cache_capacity: usize,
    /// Latency samples kept per Processor series.
    pub latency_window: usize,
    /// Processor health thresholds.
    pub health: HealthPolicy,
    /// Delivery retry budget.
    pub delivery_retry: RetryPolicy,
    /// Ping cadence.
    pub ping_interval: Duration,
    /// Adapter read deadline.
    pub adapter_read_timeout: Duration,
    /// Processor read deadline.
    pub processor_read_timeout: Duration,
}

impl BrokerConfig {
    /// Extract broker tuning from loaded settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let broker = &settings.broker;
        let heartbeat = &settings.heartbeat;
        Self {
            api_timeout: broker.api_timeout(),
            probe_timeout: broker.probe_timeout(),
            probe_login_info: broker.probe_login_info,
            cache_capacity: broker.cache_capacity,
            latency_window: broker.latency_window,
            health: HealthPolicy {
                heartbeat_window: Duration::from_secs(broker.healthy_heartbeat_secs),
                connect_grace: Duration::from_secs(broker.healthy_grace_secs),
            },
            delivery_retry: broker.delivery_retry,
            ping_interval: heartbeat.ping_interval(),
            adapter_read_timeout: heartbeat.adapter_read_timeout(),
            processor_read_timeout: heartbeat.processor_read_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}

/// Identity hints an Adapter may send at connect time.
#[derive(Clone, Debug, Default)]
pub struct AdapterHints {
    /// Durable self id (`X-Self-ID`).
    pub self_id: Option<String>,
    /// Platform tag (`X-Platform`).
    pub platform: Option<String>,
}

/// Where an event ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Written to this Processor.
    Delivered(ProcessorId),
    /// Parked in the message cache.
    Cached,
    /// Could not be serialized.
    Dropped,
}

/// Counts for `/health`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerSnapshot {
    /// Live Adapters.
    pub adapters: usize,
    /// Live Processors.
    pub processors: usize,
    /// Outstanding correlated requests.
    pub pending_requests: usize,
    /// Events waiting for a Processor.
    pub cached_messages: usize,
    /// Routing rules loaded.
    pub routing_rules: usize,
    /// Groups with a known Adapter.
    pub known_groups: usize,
}

/// The relay broker.
pub struct Broker {
    config: BrokerConfig,
    registry: ConnectionRegistry,
    correlation: CorrelationTable,
    rules: RoutingRules,
    balancer: LoadBalancer,
    cache: MessageCache,
    contacts: ContactCache,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("snapshot", &self.snapshot())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Create a broker with the given tuning and rules.
    pub fn new(config: BrokerConfig, rules: RoutingRules) -> Arc<Self> {
        Arc::new(Self {
            cache: MessageCache::new(config.cache_capacity),
            registry: ConnectionRegistry::new(),
            correlation: CorrelationTable::new(),
            rules,
            balancer: LoadBalancer::new(),
            contacts: ContactCache::new(),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// Create a broker from loaded settings, compiling the configured rules.
    pub fn from_settings(settings: &RelaySettings) -> Result<Arc<Self>> {
        let rules = RoutingRules::from_entries(&settings.routing.rules)?;
        Ok(Self::new(BrokerConfig::from_settings(settings), rules))
    }

    /// Runtime tuning.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Outstanding requests.
    pub fn correlation(&self) -> &CorrelationTable {
        &self.correlation
    }

    /// Routing-rule store.
    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }

    /// Undeliverable events.
    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Group → Adapter lookup.
    pub fn contacts(&self) -> &ContactCache {
        &self.contacts
    }

    /// Counts for health reporting.
    pub fn snapshot(&self) -> BrokerSnapshot {
        let stats = self.registry.stats();
        BrokerSnapshot {
            adapters: stats.adapters,
            processors: stats.processors,
            pending_requests: self.correlation.len(),
            cached_messages: self.cache.len(),
            routing_rules: self.rules.len(),
            known_groups: self.contacts.len(),
        }
    }

    /// Cancel every connection's loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`Broker::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Register a freshly upgraded Adapter.
    ///
    /// Without a self-id hint the connection is keyed by `remote` and a
    /// `get_login_info` probe is issued in the background.
    pub async fn connect_adapter(
        self: &Arc<Self>,
        remote: &str,
        hints: AdapterHints,
        sink: Box<dyn FrameSink>,
    ) -> Arc<AdapterConnection> {
        let durable = hints.self_id.filter(|id| !id.trim().is_empty());
        let platform = hints
            .platform
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_owned());
        let id = AdapterId::from(durable.clone().unwrap_or_else(|| remote.to_owned()));
        let link = Link::new(remote, sink, self.shutdown.child_token());
        let conn = Arc::new(AdapterConnection::new(link, id, platform, durable.is_some()));

        if let Some(previous) = self.registry.register_adapter(conn.clone()) {
            info!(adapter_id = %conn.id(), "adapter reconnected, closing previous connection");
            let _ = self.disconnect_adapter(&previous).await;
        }
        let _ = conn.link().lifecycle().establish();
        info!(adapter_id = %conn.id(), remote, platform = conn.platform(), "adapter connected");

        if durable.is_none() && self.config.probe_login_info {
            drop(tokio::spawn(Arc::clone(self).probe_identity(conn.clone())));
        }
        conn
    }

    /// Register a freshly upgraded Processor and replay cached events.
    pub fn connect_processor(self: &Arc<Self>, remote: &str, sink: Box<dyn FrameSink>) -> Arc<ProcessorConnection> {
        let link = Link::new(remote, sink, self.shutdown.child_token());
        let conn = Arc::new(ProcessorConnection::new(
            link,
            ProcessorId::from(remote),
            self.config.latency_window,
        ));
        self.registry.register_processor(conn.clone());
        let _ = conn.link().lifecycle().establish();
        info!(processor_id = %conn.id(), "processor connected");

        let replayed = self.flush_cache();
        if replayed > 0 {
            info!(replayed, "replaying cached events");
        }
        conn
    }

    /// Tear down an Adapter. Returns `false` if cleanup already ran.
    pub async fn disconnect_adapter(&self, conn: &Arc<AdapterConnection>) -> bool {
        self.teardown(conn.as_ref(), ConnectionKind::Adapter, || {
            self.registry.unregister_adapter(conn)
        })
        .await
    }

    /// Tear down a Processor. Returns `false` if cleanup already ran.
    pub async fn disconnect_processor(&self, conn: &Arc<ProcessorConnection>) -> bool {
        self.teardown(conn.as_ref(), ConnectionKind::Processor, || {
            self.registry.unregister_processor(conn)
        })
        .await
    }

    async fn teardown<P: Peer>(&self, peer: &P, kind: ConnectionKind, unregister: impl FnOnce() -> bool) -> bool {
        let link = peer.link();
        if !link.lifecycle().begin_close() {
            return false;
        }
        link.cancel_token().cancel();
        let removed = unregister();
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, link.close_sink()).await;
        link.lifecycle().finish_close();

        let lifetime = link.age();
        histogram!(CONNECTION_DURATION_SECONDS, "kind" => kind.label()).record(lifetime.as_secs_f64());
        info!(
            kind = kind.label(),
            peer = %peer.label(),
            removed,
            duration_secs = lifetime.as_secs(),
            "connection closed"
        );
        true
    }

    // ── Adapter → Processor ─────────────────────────────────────────────

    /// Handle one text frame from an Adapter.
    pub async fn handle_adapter_frame(self: &Arc<Self>, conn: &Arc<AdapterConnection>, text: &str) {
        conn.record_received();
        let mut event = match Event::from_json(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(adapter_id = %conn.id(), %err, "dropping malformed adapter frame");
                return;
            }
        };

        if let Some(token) = event.echo_str().filter(|echo| issuer_of(echo).is_some()) {
            let token = token.to_owned();
            self.accept_reply(&token, event);
            return;
        }
        if event.is_response() {
            debug!(adapter_id = %conn.id(), "uncorrelated response from adapter, discarding");
            return;
        }

        if let Some(self_id) = event.self_id.clone() {
            if !conn.is_durable() {
                self.rekey(conn, &self_id).await;
            }
        }

        let adapter_id = conn.id();
        event.normalize(&adapter_id, conn.platform());
        if let Some(group) = event.group_id.as_deref() {
            self.contacts.remember_group(group, &adapter_id);
        }
        let _ = self.route_event(event, Some(adapter_id)).await;
    }

    fn accept_reply(&self, token: &str, reply: Event) {
        if let Resolution::Delivered { rtt } = self.correlation.resolve(token, reply) {
            let issuer = issuer_of(token).and_then(|issuer| self.registry.find_processor(issuer));
            if let Some(processor) = issuer {
                processor.record_rtt(rtt);
            }
            debug!(token, rtt_ms = rtt.as_millis(), "reply correlated");
        }
    }

    async fn rekey(&self, conn: &Arc<AdapterConnection>, new_id: &str) {
        match self.registry.rekey_adapter(conn, AdapterId::from(new_id)) {
            Rekey::Moved { old, displaced } => {
                counter!(ADAPTER_REKEYS_TOTAL).increment(1);
                info!(old = %old, adapter_id = new_id, "adapter identity confirmed");
                self.contacts.rename_adapter(&old, &conn.id());
                if let Some(displaced) = displaced {
                    info!(adapter_id = new_id, "closing stale connection for adapter");
                    let _ = self.disconnect_adapter(&displaced).await;
                }
            }
            Rekey::Unchanged => debug!(adapter_id = new_id, "adapter identity already correct"),
            Rekey::AlreadyDurable | Rekey::NotRegistered => {}
        }
    }

    /// Route an event to a Processor, retrying on write failure and caching
    /// once the budget is spent or nobody is available.
    pub async fn route_event(self: &Arc<Self>, event: Event, source: Option<AdapterId>) -> Delivery {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, "event could not be serialized, dropping");
                return Delivery::Dropped;
            }
        };

        let policy = self.config.delivery_retry;
        let mut attempt: u32 = 0;
        loop {
            let Some(target) = self.pick_processor(&event) else {
                break;
            };
            match target.link().send_text(text.clone()).await {
                Ok(()) => {
                    target.record_delivery();
                    counter!(EVENTS_ROUTED_TOTAL).increment(1);
                    debug!(processor_id = %target.id(), attempt, "event delivered");
                    return Delivery::Delivered(target.id().clone());
                }
                Err(err) => {
                    counter!(DELIVERY_FAILURES_TOTAL).increment(1);
                    warn!(processor_id = %target.id(), attempt, %err, "delivery failed, dropping processor");
                    let _ = self.disconnect_processor(&target).await;
                }
            }
            if !policy.allows_retry_after(attempt) {
                break;
            }
            let delay = policy.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }

        self.park(event, source);
        Delivery::Cached
    }

    fn pick_processor(&self, event: &Event) -> Option<Arc<ProcessorConnection>> {
        let healthy = self.registry.healthy_processors(&self.config.health);
        match self
            .rules
            .resolve_target(event, |id| healthy.iter().find(|p| p.id() == id).cloned())
        {
            RouteDecision::Matched(target) => return Some(target),
            RouteDecision::TargetOffline(target) => {
                counter!(RULE_TARGET_OFFLINE_TOTAL).increment(1);
                warn!(target = %target, "rule target offline, falling back to load balancer");
            }
            RouteDecision::NoRule => {}
        }
        self.balancer.select(&healthy)
    }

    /// Cache an event. A Processor may have registered, and flushed an empty
    /// cache, after this event found nobody; such events are flushed here.
    fn park(self: &Arc<Self>, event: Event, source: Option<AdapterId>) {
        counter!(EVENTS_CACHED_TOTAL).increment(1);
        if let Some(evicted) = self.cache.push(CachedMessage::new(event, source)) {
            counter!(CACHE_EVICTIONS_TOTAL).increment(1);
            warn!(
                age_ms = evicted.cached_at.elapsed().as_millis(),
                "message cache full, dropped oldest event"
            );
        }
        if self.registry.healthy_processors(&self.config.health).is_empty() {
            debug!(cached = self.cache.len(), "no processor available, event cached");
            return;
        }
        let replayed = self.flush_cache();
        debug!(replayed, "processor appeared while caching, replaying");
    }

    /// Resubmit every cached event through the routing path.
    ///
    /// Each event gets its own task, so replays are not ordered.
    pub fn flush_cache(self: &Arc<Self>) -> usize {
        let drained = self.cache.drain();
        let count = drained.len();
        for message in drained {
            let broker = Arc::clone(self);
            drop(tokio::spawn(async move {
                let _ = broker.route_event(message.event, message.source).await;
            }));
        }
        count
    }

    // ── Processor → Adapter ─────────────────────────────────────────────

    /// Handle one text frame from a Processor. API calls are forwarded on
    /// their own task; anything else is ignored.
    pub fn handle_processor_frame(self: &Arc<Self>, conn: &Arc<ProcessorConnection>, text: &str) {
        let call = match Event::from_json(text) {
            Ok(call) => call,
            Err(err) => {
                warn!(processor_id = %conn.id(), %err, "dropping malformed processor frame");
                return;
            }
        };
        if !call.is_api_call() {
            debug!(processor_id = %conn.id(), "ignoring non-call frame from processor");
            return;
        }

        let broker = Arc::clone(self);
        let conn = Arc::clone(conn);
        drop(tokio::spawn(async move {
            let _ = broker.forward_api_call(&conn, call).await;
        }));
    }

    /// Forward an API call to an Adapter and return the reply to the caller.
    ///
    /// Always answers: the Adapter's reply, or a synthesized no-target,
    /// forward-failed or timeout failure. The reply carries the caller's
    /// original `echo` and is also returned.
    #[instrument(skip_all, fields(processor_id = %processor.id()))]
    pub async fn forward_api_call(&self, processor: &Arc<ProcessorConnection>, mut call: Event) -> Event {
        if let Some(elapsed) = processor.take_dispatch_elapsed() {
            processor.record_processing(elapsed);
        }

        let started = Instant::now();
        let token = RequestToken::mint(processor.id());
        let rx = self.correlation.register(token.clone(), call.echo.take());
        call.echo = Some(Value::String(token.to_string()));

        self.dispatch_call(&token, &call).await;
        let reply = self.correlation.wait(&token, rx, self.config.api_timeout).await;

        let outcome = FailureKind::from_reply(&reply).map_or("ok", FailureKind::label);
        counter!(API_CALLS_TOTAL, "outcome" => outcome).increment(1);
        histogram!(API_CALL_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(token = %token, action = call.action.as_deref(), outcome, "api call finished");

        if let Err(err) = processor.link().send_event(&reply).await {
            warn!(%err, "could not return reply to processor");
            if err.is_transient() {
                let _ = self.disconnect_processor(processor).await;
            }
        }
        reply
    }

    /// Write the call to an Adapter, retrying once elsewhere. Failures are
    /// resolved through the correlation table so the waiter sees them.
    async fn dispatch_call(&self, token: &RequestToken, call: &Event) {
        let text = match call.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(token = %token, %err, "api call could not be serialized");
                let _ = self.correlation.resolve(token, FailureKind::ForwardFailed.reply(None));
                return;
            }
        };

        let Some(first) = self.pick_adapter(call) else {
            warn!(token = %token, "no adapter available for api call");
            let _ = self.correlation.resolve(token, FailureKind::NoTarget.reply(None));
            return;
        };
        if self.send_call(&first, text.clone()).await {
            return;
        }
        if let Some(second) = self.registry.any_adapter(Some(&first)) {
            if self.send_call(&second, text).await {
                return;
            }
        }
        let _ = self.correlation.resolve(token, FailureKind::ForwardFailed.reply(None));
    }

    async fn send_call(&self, adapter: &Arc<AdapterConnection>, text: String) -> bool {
        match adapter.link().send_text(text).await {
            Ok(()) => {
                adapter.record_sent();
                true
            }
            Err(err) => {
                warn!(adapter_id = %adapter.id(), %err, "forward to adapter failed, dropping adapter");
                let _ = self.disconnect_adapter(adapter).await;
                false
            }
        }
    }

    /// The addressed `self_id` if connected, else the Adapter known for
    /// `params.group_id`, else any Adapter.
    fn pick_adapter(&self, call: &Event) -> Option<Arc<AdapterConnection>> {
        if let Some(self_id) = call.target_self_id() {
            if let Some(found) = self.registry.find_adapter(&self_id) {
                return Some(found);
            }
            warn!(self_id = %self_id, "addressed adapter is not connected, choosing another");
        }
        let by_group = call
            .param_id("group_id")
            .and_then(|group| self.contacts.adapter_for_group(&group))
            .and_then(|id| self.registry.find_adapter(&id));
        by_group.or_else(|| self.registry.any_adapter(None))
    }

    // ── Identity probe ──────────────────────────────────────────────────

    async fn probe_identity(self: Arc<Self>, conn: Arc<AdapterConnection>) {
        let token = RequestToken::mint(BROKER_ISSUER);
        let rx = self.correlation.register(token.clone(), None);
        let probe = Event {
            action: Some(LOGIN_INFO_ACTION.to_owned()),
            params: Some(json!({})),
            echo: Some(Value::String(token.to_string())),
            ..Event::default()
        };
        if let Err(err) = conn.link().send_event(&probe).await {
            debug!(adapter_id = %conn.id(), %err, "identity probe not sent");
            let _ = self.correlation.expire(&token);
            return;
        }
        conn.record_sent();

        let reply = self.correlation.wait(&token, rx, self.config.probe_timeout).await;
        if let Some(failure) = FailureKind::from_reply(&reply) {
            debug!(adapter_id = %conn.id(), reason = failure.label(), "identity probe unanswered");
            return;
        }
        match reply.data.as_ref().and_then(|data| data.get("user_id")).and_then(id_string) {
            Some(user_id) => self.rekey(&conn, &user_id).await,
            None => debug!(adapter_id = %conn.id(), "login info carried no user_id"),
        }
    }
}
