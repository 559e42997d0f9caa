//! End-to-end flows through the public broker API with in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use botrelay_broker::{
    AdapterHints, Broker, BrokerConfig, ChannelSink, EndReason, Inbound, Outbound, RoutingRules, drive_adapter,
    drive_processor,
};
use botrelay_core::Event;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Peer {
    tx: UnboundedSender<Inbound>,
    rx: UnboundedReceiver<Outbound>,
    driver: JoinHandle<EndReason>,
}

impl Peer {
    fn send(&self, value: &serde_json::Value) {
        self.tx.unbounded_send(Inbound::Text(value.to_string())).unwrap();
    }

    async fn next_event(&mut self) -> Event {
        loop {
            match timeout(Duration::from_secs(2), self.rx.recv()).await {
                Ok(Some(Outbound::Text(text))) => return Event::from_json(&text).unwrap(),
                Ok(Some(Outbound::Ping)) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }
}

fn broker(rules: RoutingRules) -> Arc<Broker> {
    Broker::new(
        BrokerConfig {
            probe_login_info: false,
            ..BrokerConfig::default()
        },
        rules,
    )
}

async fn connect_adapter(broker: &Arc<Broker>, remote: &str, self_id: &str) -> Peer {
    let (sink, rx) = ChannelSink::pair();
    let hints = AdapterHints {
        self_id: Some(self_id.to_owned()),
        platform: Some("qq".to_owned()),
    };
    let conn = broker.connect_adapter(remote, hints, Box::new(sink)).await;
    let (tx, frames) = unbounded();
    let driver = tokio::spawn(drive_adapter(broker.clone(), conn, frames));
    Peer { tx, rx, driver }
}

fn connect_processor(broker: &Arc<Broker>, remote: &str) -> Peer {
    let (sink, rx) = ChannelSink::pair();
    let conn = broker.connect_processor(remote, Box::new(sink));
    let (tx, frames) = unbounded();
    let driver = tokio::spawn(drive_processor(broker.clone(), conn, frames));
    Peer { tx, rx, driver }
}

#[tokio::test]
async fn event_then_reply_round_trip() {
    let rules = RoutingRules::new();
    rules.set("group_100", "10.0.0.9:2").unwrap();
    let broker = broker(rules);

    let mut bot = connect_adapter(&broker, "10.0.0.1:1", "10001").await;
    let mut other = connect_processor(&broker, "10.0.0.9:1");
    let mut worker = connect_processor(&broker, "10.0.0.9:2");

    bot.send(&json!({"post_type":"message","message_type":"group","group_id":100,"user_id":7,"message":"ping"}));
    let event = worker.next_event().await;
    assert_eq!(event.group_id.as_deref(), Some("100"));
    assert_eq!(event.self_id.as_deref(), Some("10001"));

    worker.send(&json!({"action":"send_group_msg","params":{"group_id":100,"message":"pong"},"echo":"w-1"}));
    let call = bot.next_event().await;
    assert_eq!(call.action.as_deref(), Some("send_group_msg"));
    let token = call.echo.clone().unwrap();
    assert_ne!(token, json!("w-1"));

    bot.send(&json!({"status":"ok","retcode":0,"data":{"message_id":1},"echo":token}));
    let reply = worker.next_event().await;
    assert_eq!(reply.echo, Some(json!("w-1")));
    assert_eq!(reply.retcode, Some(0));

    let unexpected = timeout(Duration::from_millis(50), other.rx.recv()).await;
    assert!(unexpected.is_err());
    assert_eq!(broker.snapshot().pending_requests, 0);

    broker.shutdown();
    assert_eq!(bot.driver.await.unwrap(), EndReason::Cancelled);
    assert_eq!(worker.driver.await.unwrap(), EndReason::Cancelled);
    assert_eq!(other.driver.await.unwrap(), EndReason::Cancelled);
    assert_eq!(broker.snapshot().adapters, 0);
    assert_eq!(broker.snapshot().processors, 0);
}

#[tokio::test]
async fn events_wait_for_a_processor() {
    let broker = broker(RoutingRules::new());
    let bot = connect_adapter(&broker, "10.0.0.1:1", "10001").await;
    for n in 0..3 {
        bot.send(&json!({"post_type":"notice","notice_type":"poke","user_id":n}));
    }
    timeout(Duration::from_secs(1), async {
        while broker.cache().len() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let mut worker = connect_processor(&broker, "10.0.0.9:1");
    let mut users = Vec::new();
    for _ in 0..3 {
        users.push(worker.next_event().await.user_id.unwrap());
    }
    users.sort();
    assert_eq!(users, ["0", "1", "2"]);
    assert!(broker.cache().is_empty());
}

#[tokio::test]
async fn processor_disconnect_is_observed() {
    let broker = broker(RoutingRules::new());
    let worker = connect_processor(&broker, "10.0.0.9:1");
    worker.tx.unbounded_send(Inbound::Close).unwrap();
    assert_eq!(worker.driver.await.unwrap(), EndReason::PeerClosed);
    assert_eq!(broker.snapshot().processors, 0);
}
