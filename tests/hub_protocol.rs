//! Wire-level tests: a bare TCP client speaks the control protocol to a
//! live hub and reads raw envelope frames, no client library involved.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use hubmq::config::{Config, DeliveryStrategy, Transport};
use hubmq::core::command::{
    encode_command_frame, new_add, new_bye, new_id, new_start_receive, ClientCommand,
};
use hubmq::core::frame::{try_decode_frame, MAX_FRAME_LEN};
use hubmq::core::message::{decode_message, Message, MessageKind};
use hubmq::Hub;

async fn start_hub(mut config: Config) -> (Arc<Hub>, SocketAddr) {
    common::init_logging();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    let hub = Hub::new(config);
    let addr = hub.start().await.expect("hub start failed");
    (hub, addr)
}

struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("failed to connect to hub");
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, cmd: &ClientCommand) {
        let frame = encode_command_frame(cmd).expect("encode failed");
        self.stream
            .write_all(&frame)
            .await
            .expect("failed to write frame");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("failed to write raw bytes");
    }

    /// Next envelope, or `None` once the hub closed the connection.
    async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.buf).expect("bad frame from hub") {
                return Some(decode_message(&frame).expect("bad envelope from hub"));
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("failed to read from hub");
            if n == 0 {
                return None;
            }
        }
    }

    async fn expect_ack(&mut self, request_id: i16) {
        let msg = timeout(Duration::from_secs(5), self.recv())
            .await
            .expect("timed out waiting for ack")
            .expect("connection closed before ack");
        assert_eq!(msg.kind, MessageKind::ServerResponse);
        assert_eq!(msg.request_id, request_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_are_acked_in_order() {
    let (hub, addr) = start_hub(Config::default()).await;
    let mut client = TestClient::connect(addr).await;

    client.send(&new_id(1, "wire-1")).await;
    client.send(&new_add(2, "orders", None)).await;
    client.send(&new_start_receive(3, None)).await;

    client.expect_ack(1).await;
    client.expect_ack(2).await;
    client.expect_ack(3).await;

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bye_closes_the_connection_without_ack() {
    let (hub, addr) = start_hub(Config::default()).await;
    let mut client = TestClient::connect(addr).await;

    client.send(&new_bye(7)).await;

    let next = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for close");
    assert!(next.is_none(), "expected EOF after bye, got {next:?}");

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn published_envelopes_reach_a_receiving_subscriber() {
    let (hub, addr) = start_hub(Config::default()).await;
    let mut client = TestClient::connect(addr).await;

    client.send(&new_add(1, "orders", Some(vec!["eu".into()]))).await;
    client.send(&new_start_receive(2, None)).await;
    client.expect_ack(1).await;
    client.expect_ack(2).await;

    hub.publish(Message::application(
        vec![("orders".into(), Some("eu".into()))],
        Bytes::from_static(b"{\"total\":9000}"),
    ))
    .await
    .expect("publish failed");

    // A message on a different key must not arrive.
    hub.publish(Message::application(
        vec![("orders".into(), Some("us".into()))],
        Bytes::from_static(b"other"),
    ))
    .await
    .expect("publish failed");

    hub.publish(Message::application(
        vec![("orders".into(), Some("eu".into()))],
        Bytes::from_static(b"second"),
    ))
    .await
    .expect("publish failed");

    let first = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out")
        .expect("closed early");
    assert_eq!(first.kind, MessageKind::Application);
    assert_eq!(first.payload.as_ref(), b"{\"total\":9000}");
    assert!(first.sent_at_ms > 0);

    let second = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out")
        .expect("closed early");
    assert_eq!(second.payload.as_ref(), b"second");

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acks_are_suppressed_when_disabled() {
    let mut config = Config::default();
    config.server.ack_responses = false;
    let (hub, addr) = start_hub(config).await;
    let mut client = TestClient::connect(addr).await;

    client.send(&new_add(1, "orders", None)).await;
    client.send(&new_start_receive(2, None)).await;

    // No ack barrier exists without responses; wait for the hub to see a
    // receiving subscriber instead.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let receiving = hub.clients().iter().any(|c| c.receiving);
        if receiving {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "subscriber never ready");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    hub.publish(Message::application(
        vec![("orders".into(), None)],
        Bytes::from_static(b"quiet"),
    ))
    .await
    .expect("publish failed");

    // The very first envelope is the application message, not an ack.
    let msg = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out")
        .expect("closed early");
    assert_eq!(msg.kind, MessageKind::Application);
    assert_eq!(msg.payload.as_ref(), b"quiet");

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_length_header_terminates_the_session() {
    let (hub, addr) = start_hub(Config::default()).await;
    let mut client = TestClient::connect(addr).await;

    let mut raw = BytesMut::new();
    raw.put_u32(MAX_FRAME_LEN + 1);
    client.send_raw(&raw).await;

    let next = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for close");
    assert!(next.is_none());

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_limit_refuses_extra_clients() {
    let mut config = Config::default();
    config.server.max_connections = 1;
    let (hub, addr) = start_hub(config).await;

    let mut first = TestClient::connect(addr).await;
    first.send(&new_id(1, "keeper")).await;
    first.expect_ack(1).await;

    // The second connection is accepted by the OS and then dropped by
    // the hub without a session.
    let mut second = TestClient::connect(addr).await;
    let next = timeout(Duration::from_secs(5), second.recv())
        .await
        .expect("timed out waiting for refusal");
    assert!(next.is_none());

    // The first session is unaffected.
    first.send(&new_add(2, "orders", None)).await;
    first.expect_ack(2).await;

    hub.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_announces_server_close() {
    let (hub, addr) = start_hub(Config::default()).await;
    let mut client = TestClient::connect(addr).await;

    client.send(&new_start_receive(1, None)).await;
    client.expect_ack(1).await;

    hub.shutdown().await;

    let close = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for server close")
        .expect("connection closed before the notice");
    assert_eq!(close.kind, MessageKind::ServerClose);

    let eof = timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for EOF");
    assert!(eof.is_none());
}

// The poller and the worker pool both run on OS threads; joining them
// must not wedge a runtime with a single worker.
#[tokio::test]
async fn shutdown_completes_on_a_single_threaded_runtime() {
    let mut config = Config::default();
    config.server.transport = Transport::Polled;
    config.delivery.strategy = DeliveryStrategy::Sticky;
    let (hub, addr) = start_hub(config).await;

    let mut client = TestClient::connect(addr).await;
    client.send(&new_start_receive(1, None)).await;
    client.expect_ack(1).await;

    timeout(Duration::from_secs(5), hub.shutdown())
        .await
        .expect("shutdown stalled");
}
