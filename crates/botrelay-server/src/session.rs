//! Upgraded socket → broker connection.
//!
//! Splits the socket, hands the write half to the broker as a [`WsSink`] and
//! feeds the read half, reduced to [`Inbound`] frames, into the driver.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use botrelay_broker::{AdapterHints, Broker, Inbound, drive_adapter, drive_processor};
use botrelay_core::constants::{PLATFORM_HEADER, SELF_ID_HEADER};
use futures::{Stream, StreamExt, TryStreamExt, future};
use tracing::{debug, info, warn};

use crate::sink::WsSink;

/// Identity hints from the Adapter's upgrade request.
pub fn adapter_hints(headers: &HeaderMap) -> AdapterHints {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    };
    AdapterHints {
        self_id: header(SELF_ID_HEADER),
        platform: header(PLATFORM_HEADER),
    }
}

/// Serve one Adapter until its socket closes.
pub async fn run_adapter_session(socket: WebSocket, remote: String, hints: AdapterHints, broker: Arc<Broker>) {
    let (sink, frames) = split(socket);
    let conn = broker.connect_adapter(&remote, hints, Box::new(sink)).await;
    let reason = drive_adapter(broker, conn, frames).await;
    info!(remote = %remote, reason = reason.label(), "adapter session ended");
}

/// Serve one Processor until its socket closes.
pub async fn run_processor_session(socket: WebSocket, remote: String, broker: Arc<Broker>) {
    let (sink, frames) = split(socket);
    let conn = broker.connect_processor(&remote, Box::new(sink));
    let reason = drive_processor(broker, conn, frames).await;
    info!(remote = %remote, reason = reason.label(), "processor session ended");
}

fn split(socket: WebSocket) -> (WsSink, impl Stream<Item = Inbound> + Unpin + Send) {
    let (tx, rx) = socket.split();
    let frames = rx
        .inspect_err(|err| debug!(%err, "websocket read failed"))
        .take_while(|message| future::ready(message.is_ok()))
        .filter_map(|message| future::ready(message.ok().and_then(inbound)));
    (WsSink::new(tx), frames)
}

/// Reduce a socket message to what the broker cares about.
fn inbound(message: Message) -> Option<Inbound> {
    match message {
        Message::Text(text) => Some(Inbound::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Inbound::Text(text)),
            Err(_) => {
                warn!(len = bytes.len(), "dropping non-UTF-8 binary frame");
                None
            }
        },
        Message::Ping(_) => Some(Inbound::Ping),
        Message::Pong(_) => Some(Inbound::Pong),
        Message::Close(_) => Some(Inbound::Close),
    }
}
