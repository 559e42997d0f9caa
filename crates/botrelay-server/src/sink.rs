//! WebSocket write half as a broker [`FrameSink`].

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use botrelay_broker::FrameSink;
use botrelay_core::LinkError;
use futures::SinkExt;
use futures::stream::SplitSink;

/// A write that has not completed in this long counts as a dead peer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write half of an upgraded socket.
pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

impl WsSink {
    /// Wrap the write half returned by `WebSocket::split`.
    pub fn new(tx: SplitSink<WebSocket, Message>) -> Self {
        Self { tx }
    }

    async fn write(&mut self, message: Message) -> Result<(), LinkError> {
        match tokio::time::timeout(WRITE_TIMEOUT, self.tx.send(message)).await {
            Ok(result) => result.map_err(LinkError::transport),
            Err(_) => Err(LinkError::transport("write timed out")),
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), LinkError> {
        self.write(Message::Text(text.into())).await
    }

    async fn send_ping(&mut self) -> Result<(), LinkError> {
        self.write(Message::Ping(Bytes::new())).await
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        let _ = self.write(Message::Close(None)).await;
        self.tx.close().await.map_err(LinkError::transport)
    }
}
