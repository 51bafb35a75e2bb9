//! Connection-loss recovery: desired-state replay and catch-up overlap.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use hubmq::client::{ClientOptions, HubClient};
use hubmq::config::Config;
use hubmq::core::message::Message;
use hubmq::Hub;

async fn start_hub() -> (Arc<Hub>, SocketAddr) {
    common::init_logging();
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    let hub = Hub::new(config);
    let addr = hub.start().await.expect("hub start failed");
    (hub, addr)
}

fn sample(payload: &'static [u8]) -> Message {
    Message::application(vec![("stream".into(), None)], Bytes::from_static(payload))
}

fn quick_reconnect(addr: SocketAddr, id: &str) -> ClientOptions {
    let mut options = ClientOptions::new(addr.to_string()).with_identifier(id);
    options.reconnect_count = 10;
    options.reconnect_interval = Duration::from_millis(50);
    options.reconnect_buffer = Duration::from_secs(10);
    options
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_disconnect_is_survived_with_at_least_once_delivery() {
    let (hub, addr) = start_hub().await;

    let (client, mut inbox) = HubClient::connect(quick_reconnect(addr, "sensor"))
        .await
        .expect("connect failed");
    client.subscribe("stream", None).await.expect("subscribe failed");
    client.start_receive(None).await.expect("start failed");

    hub.publish(sample(b"before")).await.expect("publish failed");
    let msg = timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("timed out")
        .expect("inbox closed");
    assert_eq!(msg.payload.as_ref(), b"before");

    assert!(hub.disconnect_client(&"sensor".into()));

    // Wait until the replacement session is registered and receiving.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let restored = hub
            .clients()
            .iter()
            .any(|c| c.client == Some("sensor".into()) && c.receiving);
        if restored {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "client never reconnected"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The replacement session carries the same subscriptions.
    let subjects = hub.subjects_of(&"sensor".into()).expect("session lost");
    assert_eq!(subjects, vec!["stream".to_string()]);

    hub.publish(sample(b"after")).await.expect("publish failed");

    // The catch-up overlap may replay "before"; "after" must arrive.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        let msg = timeout(remaining, inbox.recv())
            .await
            .expect("timed out waiting for post-reconnect delivery")
            .expect("inbox closed");
        match msg.payload.as_ref() {
            b"after" => break,
            b"before" => continue,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    assert!(!client.is_closed());
    client.close().await;
    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_close_suppresses_reconnection() {
    let (hub, addr) = start_hub().await;

    let (client, mut inbox) = HubClient::connect(quick_reconnect(addr, "polite"))
        .await
        .expect("connect failed");
    client.subscribe("stream", None).await.expect("subscribe failed");
    client.start_receive(None).await.expect("start failed");

    hub.shutdown().await;

    // The reader exits after the notice and the inbox closes for good.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        match timeout(remaining, inbox.recv()).await {
            Ok(None) => break,
            Ok(Some(msg)) => panic!("unexpected delivery {msg:?}"),
            Err(_) => panic!("inbox never closed"),
        }
    }
    assert!(client.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_redial_goes_out_before_the_retry_interval() {
    let (hub, addr) = start_hub().await;

    // An interval far beyond the wait below: recovery within the deadline
    // is only possible if the first redial skips it.
    let mut options = quick_reconnect(addr, "eager");
    options.reconnect_interval = Duration::from_secs(30);
    let (client, _inbox) = HubClient::connect(options).await.expect("connect failed");
    client.subscribe("stream", None).await.expect("subscribe failed");
    client.start_receive(None).await.expect("start failed");

    assert!(hub.disconnect_client(&"eager".into()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let restored = hub
            .clients()
            .iter()
            .any(|c| c.client == Some("eager".into()) && c.receiving);
        if restored {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "first redial waited out the retry interval"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.close().await;
    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_attempts_are_bounded() {
    let (hub, addr) = start_hub().await;

    let mut options = quick_reconnect(addr, "stubborn");
    options.reconnect_count = 2;
    let (client, mut inbox) = HubClient::connect(options).await.expect("connect failed");
    client.subscribe("stream", None).await.expect("subscribe failed");

    // Kill the session and the listener; every redial must fail.
    assert!(hub.disconnect_client(&"stubborn".into()));
    hub.shutdown().await;

    let closed = timeout(Duration::from_secs(10), inbox.recv())
        .await
        .expect("reader never gave up");
    assert!(closed.is_none());
    let _ = client;
}
