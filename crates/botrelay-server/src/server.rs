//! `RelayServer`: Axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use botrelay_broker::Broker;
use botrelay_settings::ServerSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::health::{self, HealthResponse};
use crate::session;
use crate::shutdown::ShutdownCoordinator;

/// Path many OneBot implementations dial by default.
pub const ONEBOT_ALIAS_PATH: &str = "/onebot";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The broker every connection is attached to.
    pub broker: Arc<Broker>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// Largest accepted WebSocket message.
    pub max_message_size: usize,
}

/// The relay's network front end.
pub struct RelayServer {
    settings: ServerSettings,
    broker: Arc<Broker>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: PrometheusHandle,
}

impl RelayServer {
    /// Create a server around an existing broker.
    pub fn new(settings: ServerSettings, broker: Arc<Broker>, metrics: PrometheusHandle) -> Self {
        Self {
            settings,
            shutdown: Arc::new(ShutdownCoordinator::new(broker.clone())),
            broker,
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            max_message_size: self.settings.max_message_size,
        };

        let mut router = Router::new()
            .route(&self.settings.adapter_path, get(adapter_ws))
            .route(&self.settings.processor_path, get(processor_ws))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler));
        let alias_free = ![&self.settings.adapter_path, &self.settings.processor_path]
            .iter()
            .any(|path| path.as_str() == ONEBOT_ALIAS_PATH);
        if alias_free {
            router = router.route(ONEBOT_ALIAS_PATH, get(adapter_ws));
        }
        router.with_state(state).layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in the background, returning the bound address
    /// (useful with port `0`).
    ///
    /// The serve task is owned by [`ShutdownCoordinator`]; it stops
    /// accepting once the coordinator triggers.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, adapter_path = %self.settings.adapter_path, processor_path = %self.settings.processor_path, "relay listening");

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let stop = self.shutdown.listener_token().cancelled_owned();
        self.shutdown.track(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                error!(%err, "server stopped with error");
            }
        }));
        Ok(local_addr)
    }

    /// Get the broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// GET adapter path: upgrade and attach as an Adapter.
async fn adapter_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let hints = session::adapter_hints(&headers);
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| session::run_adapter_session(socket, remote.to_string(), hints, state.broker))
}

/// GET processor path: upgrade and attach as a Processor.
async fn processor_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| session::run_processor_session(socket, remote.to_string(), state.broker))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.broker.snapshot()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    crate::metrics::render(&state.metrics)
}
