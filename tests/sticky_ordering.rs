//! Sticky dispatch pins each client to one worker, which preserves
//! per-client publish order even though publishes are fire-and-forget.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use hubmq::client::{ClientOptions, HubClient};
use hubmq::config::{Config, DeliveryStrategy};
use hubmq::core::message::Message;
use hubmq::Hub;

async fn start_sticky_hub() -> (Arc<Hub>, SocketAddr) {
    common::init_logging();
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.delivery.strategy = DeliveryStrategy::Sticky;
    config.delivery.workers = 4;
    let hub = Hub::new(config);
    let addr = hub.start().await.expect("hub start failed");
    (hub, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_client_order_is_preserved_across_a_burst() {
    let (hub, addr) = start_sticky_hub().await;

    let (client, mut inbox) =
        HubClient::connect(ClientOptions::new(addr.to_string()).with_identifier("consumer-1"))
            .await
            .expect("connect failed");
    client.subscribe("stream", None).await.expect("subscribe failed");
    client.start_receive(None).await.expect("start failed");

    const COUNT: usize = 200;
    for n in 0..COUNT {
        hub.publish(Message::application(
            vec![("stream".into(), None)],
            Bytes::from(format!("{n}")),
        ))
        .await
        .expect("publish failed");
    }

    let mut received = Vec::with_capacity(COUNT);
    for _ in 0..COUNT {
        let msg = timeout(Duration::from_secs(10), inbox.recv())
            .await
            .expect("timed out")
            .expect("inbox closed");
        received.push(String::from_utf8(msg.payload.to_vec()).expect("utf8 payload"));
    }

    let expected: Vec<String> = (0..COUNT).map(|n| n.to_string()).collect();
    assert_eq!(received, expected);

    let stats = hub.stats();
    assert_eq!(stats.sticky_bindings, 1);
    assert_eq!(stats.queue_depths.len(), 4);

    client.close().await;
    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fanout_still_reaches_every_client() {
    let (hub, addr) = start_sticky_hub().await;

    let mut inboxes = Vec::new();
    let mut clients = Vec::new();
    for n in 0..3 {
        let (client, inbox) = HubClient::connect(
            ClientOptions::new(addr.to_string()).with_identifier(format!("worker-{n}")),
        )
        .await
        .expect("connect failed");
        client.subscribe("jobs", None).await.expect("subscribe failed");
        client.start_receive(None).await.expect("start failed");
        clients.push(client);
        inboxes.push(inbox);
    }

    hub.publish(Message::application(
        vec![("jobs".into(), None)],
        Bytes::from_static(b"build-42"),
    ))
    .await
    .expect("publish failed");

    for inbox in &mut inboxes {
        let msg = timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("timed out")
            .expect("inbox closed");
        assert_eq!(msg.payload.as_ref(), b"build-42");
    }

    for client in &clients {
        client.close().await;
    }
    hub.shutdown().await;
}
