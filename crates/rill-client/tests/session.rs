// Session behavior against a scripted in-process transport: the test plays
// the server end and drives the protocol frame by frame.
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rill_client::transport::{Dialer, Transport, TransportCommand, TransportEvent};
use rill_client::{Client, ClientConfig, ConnectionState, SessionEvent, Subscription};
use rill_wire::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TICK: Duration = Duration::from_millis(500);

struct ServerEnd {
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::Receiver<TransportCommand>,
}

impl ServerEnd {
    async fn recv_frame(&mut self) -> Bytes {
        match self.recv_command().await {
            TransportCommand::Send(frame) => frame,
            TransportCommand::Close { code } => panic!("unexpected close: {code}"),
        }
    }

    async fn recv_command(&mut self) -> TransportCommand {
        timeout(TICK, self.outbound.recv())
            .await
            .expect("command within timeout")
            .expect("transport still open")
    }

    async fn send(&self, frame: Vec<u8>) {
        self.events
            .send(TransportEvent::Frame(Bytes::from(frame)))
            .await
            .expect("session alive");
    }

    async fn close(&self, code: u16) {
        self.events
            .send(TransportEvent::Closed { code })
            .await
            .expect("session alive");
    }
}

struct MockDialer {
    connections: mpsc::Sender<ServerEnd>,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _url: &str) -> Result<Transport> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(64);
        event_tx
            .send(TransportEvent::Opened)
            .await
            .expect("event queue");
        self.connections
            .send(ServerEnd {
                events: event_tx,
                outbound: command_rx,
            })
            .await
            .expect("test holds the connection receiver");
        Ok(Transport {
            commands: command_tx,
            events: event_rx,
        })
    }
}

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("mock://broker");
    config.reconnect_delay = Duration::from_millis(20);
    config
}

/// Connect a client against a fresh mock dialer, completing the handshake
/// with the given server-assigned id.
async fn start(config: ClientConfig) -> (Client, ServerEnd, mpsc::Receiver<ServerEnd>) {
    let (connection_tx, mut connections) = mpsc::channel(4);
    let dialer = Arc::new(MockDialer {
        connections: connection_tx,
    });
    let connecting = tokio::spawn(Client::connect(dialer, config));
    let mut server = timeout(TICK, connections.recv())
        .await
        .expect("dial within timeout")
        .expect("dialer alive");
    let frame = server.recv_frame().await;
    assert_eq!(frame[0], Command::Connect as u8);
    server.send(connack("abc")).await;
    let client = connecting.await.expect("join").expect("connect");
    (client, server, connections)
}

async fn subscribe(
    client: &Client,
    server: &mut ServerEnd,
    topic: &str,
    cursor: u64,
) -> Subscription {
    let subscribing = tokio::spawn({
        let client = client.clone();
        let topic = topic.to_string();
        async move { client.subscribe(&topic, cursor).await }
    });
    let parsed = parse_extended(&server.recv_frame().await);
    assert_eq!(parsed.command, Command::Subscribe as u8);
    assert_eq!(parsed.topic, topic);
    assert_eq!(parsed.cursor, cursor);
    server.send(suback(topic)).await;
    subscribing.await.expect("join").expect("subscribe")
}

async fn unsubscribe(client: &Client, server: &mut ServerEnd, subscription: Subscription) {
    let topic = subscription.topic().to_string();
    let unsubscribing = tokio::spawn({
        let client = client.clone();
        async move { client.unsubscribe(subscription).await }
    });
    let parsed = parse_extended(&server.recv_frame().await);
    assert_eq!(parsed.command, Command::Unsubscribe as u8);
    assert_eq!(parsed.topic, topic);
    server.send(unsuback(&topic)).await;
    unsubscribing.await.expect("join").expect("unsubscribe");
}

// Server-originated frame builders. The codec has no encode path for these
// (they only ever travel server-to-client), so the tests lay them out by
// hand.

fn connack(client_id: &str) -> Vec<u8> {
    let mut frame = vec![Command::ConnAck as u8, client_id.len() as u8];
    frame.extend_from_slice(client_id.as_bytes());
    frame
}

fn suback(topic: &str) -> Vec<u8> {
    short_ack(Command::SubAck as u8, topic)
}

fn unsuback(topic: &str) -> Vec<u8> {
    short_ack(Command::UnsubAck as u8, topic)
}

fn short_ack(command: u8, topic: &str) -> Vec<u8> {
    let mut frame = vec![command, (3 + topic.len()) as u8, topic.len() as u8];
    frame.extend_from_slice(topic.as_bytes());
    frame
}

// Relayed publishes arrive in the short framing with data after the topic.
fn publish_frame(topic: &str, payload: &str) -> Vec<u8> {
    let mut frame = vec![
        Command::Publish as u8,
        (3 + topic.len() + payload.len()) as u8,
        topic.len() as u8,
    ];
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload.as_bytes());
    frame
}

fn inform(topic: &str, cursor: u64, payload: &str) -> Vec<u8> {
    let mut frame = vec![
        Command::Inform as u8,
        (12 + topic.len() + payload.len()) as u8,
    ];
    frame.extend_from_slice(&(topic.len() as u16).to_le_bytes());
    frame.extend_from_slice(&cursor.to_le_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload.as_bytes());
    frame
}

struct ExtendedFrame {
    command: u8,
    topic: String,
    cursor: u64,
    data: Vec<u8>,
}

// Client-originated frames use the extended framing; the codec only decodes
// server-originated frames, so the test parses these by hand.
fn parse_extended(frame: &[u8]) -> ExtendedFrame {
    assert_eq!(frame[1] as usize, frame.len(), "total length byte");
    let topic_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    ExtendedFrame {
        command: frame[0],
        topic: String::from_utf8(frame[12..12 + topic_len].to_vec()).expect("topic utf8"),
        cursor: u64::from_le_bytes(frame[4..12].try_into().expect("cursor bytes")),
        data: frame[12 + topic_len..].to_vec(),
    }
}

#[tokio::test]
async fn end_to_end_connect_subscribe_publish_inform() {
    let (client, mut server, _connections) = start(test_config()).await;
    assert_eq!(client.client_id().await.expect("query").as_deref(), Some("abc"));
    assert_eq!(
        client.state().await.expect("query"),
        ConnectionState::Connected
    );

    let mut subscription = subscribe(&client, &mut server, "orders", 0).await;

    client
        .publish("orders", &serde_json::json!({ "qty": 1 }))
        .await
        .expect("publish");
    let parsed = parse_extended(&server.recv_frame().await);
    assert_eq!(parsed.command, Command::Publish as u8);
    assert_eq!(parsed.topic, "orders");
    assert_eq!(parsed.data, b"{\"qty\":1}");

    server.send(inform("orders", 0, "{\"qty\":1}")).await;
    let message = timeout(TICK, subscription.next_message())
        .await
        .expect("inform within timeout")
        .expect("subscription alive");
    assert_eq!(message.command, Command::Inform);
    assert_eq!(message.payload(), "{\"qty\":1}");
    assert_eq!(message.cursor, Some(0));

    // Cursor advanced by the payload's decoded text length.
    assert_eq!(client.cursor("orders").await.expect("query"), Some(9));
}

#[tokio::test]
async fn connect_without_client_id_sends_bare_connect() {
    let (connection_tx, mut connections) = mpsc::channel(4);
    let dialer = Arc::new(MockDialer {
        connections: connection_tx,
    });
    let connecting = tokio::spawn(Client::connect(dialer, test_config()));
    let mut server = timeout(TICK, connections.recv())
        .await
        .expect("dial")
        .expect("dialer alive");
    let frame = server.recv_frame().await;
    assert_eq!(frame.as_ref(), &[Command::Connect as u8, 2]);
    server.send(connack("server-assigned")).await;
    let client = connecting.await.expect("join").expect("connect");
    assert_eq!(
        client.client_id().await.expect("query").as_deref(),
        Some("server-assigned")
    );
}

#[tokio::test]
async fn requested_client_id_is_overwritten_by_server() {
    let mut config = test_config();
    config.client_id = Some("wanted".to_string());
    let (connection_tx, mut connections) = mpsc::channel(4);
    let dialer = Arc::new(MockDialer {
        connections: connection_tx,
    });
    let connecting = tokio::spawn(Client::connect(dialer, config));
    let mut server = timeout(TICK, connections.recv())
        .await
        .expect("dial")
        .expect("dialer alive");
    let frame = server.recv_frame().await;
    assert_eq!(&frame[2..], b"wanted");
    server.send(connack("assigned")).await;
    let client = connecting.await.expect("join").expect("connect");
    // Identity mismatch is non-fatal; the server-assigned id wins.
    assert_eq!(
        client.client_id().await.expect("query").as_deref(),
        Some("assigned")
    );
}

#[tokio::test]
async fn suback_routing_matches_topics_not_arrival_order() {
    let (client, mut server, _connections) = start(test_config()).await;

    let subscribing_x = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe("x", 0).await }
    });
    let parsed = parse_extended(&server.recv_frame().await);
    assert_eq!(parsed.topic, "x");

    let subscribing_y = tokio::spawn({
        let client = client.clone();
        async move { client.subscribe("y", 0).await }
    });
    let parsed = parse_extended(&server.recv_frame().await);
    assert_eq!(parsed.topic, "y");

    // The ack for y must resolve only y's waiter, even though x's is older.
    server.send(suback("y")).await;
    subscribing_y.await.expect("join").expect("subscribe y");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!subscribing_x.is_finished());

    server.send(suback("x")).await;
    subscribing_x.await.expect("join").expect("subscribe x");
}

#[tokio::test]
async fn fan_out_and_removal_keep_the_registry_entry() {
    let (client, mut server, _connections) = start(test_config()).await;

    let mut first = subscribe(&client, &mut server, "orders", 0).await;
    let mut second = subscribe(&client, &mut server, "orders", 0).await;

    server.send(inform("orders", 0, "one")).await;
    assert_eq!(
        timeout(TICK, first.next_message())
            .await
            .expect("first copy")
            .expect("alive")
            .payload(),
        "one"
    );
    assert_eq!(
        timeout(TICK, second.next_message())
            .await
            .expect("second copy")
            .expect("alive")
            .payload(),
        "one"
    );

    unsubscribe(&client, &mut server, first).await;

    server.send(inform("orders", 3, "two")).await;
    assert_eq!(
        timeout(TICK, second.next_message())
            .await
            .expect("remaining listener")
            .expect("alive")
            .payload(),
        "two"
    );

    // Removing the last listener keeps the entry and its cursor.
    unsubscribe(&client, &mut server, second).await;
    assert_eq!(client.cursor("orders").await.expect("query"), Some(6));
    assert_eq!(
        client.topics().await.expect("query"),
        vec![("orders".to_string(), 6)]
    );
}

#[tokio::test]
async fn abnormal_close_resubscribes_with_stored_cursors() {
    let (client, mut server, mut connections) = start(test_config()).await;
    let mut events = client.events();

    let mut sub_a = subscribe(&client, &mut server, "a", 5).await;
    let _sub_b = subscribe(&client, &mut server, "b", 0).await;

    server.close(1006).await;
    assert!(matches!(
        timeout(TICK, events.recv()).await.expect("event").expect("open"),
        SessionEvent::Disconnected { code: 1006 }
    ));

    // The reconnect timer fires, a fresh transport is dialed, and the
    // handshake runs again.
    let mut server = timeout(TICK, connections.recv())
        .await
        .expect("reconnect dial")
        .expect("dialer alive");
    let frame = server.recv_frame().await;
    assert_eq!(frame[0], Command::Connect as u8);
    server.send(connack("abc")).await;

    // Exactly one Subscribe per known topic, each with its stored cursor.
    let mut resubscribed = Vec::new();
    for _ in 0..2 {
        let parsed = parse_extended(&server.recv_frame().await);
        assert_eq!(parsed.command, Command::Subscribe as u8);
        resubscribed.push((parsed.topic, parsed.cursor));
    }
    resubscribed.sort();
    assert_eq!(
        resubscribed,
        vec![("a".to_string(), 5), ("b".to_string(), 0)]
    );

    assert!(matches!(
        timeout(TICK, events.recv()).await.expect("event").expect("open"),
        SessionEvent::Connected
    ));

    // Delivery resumes on the surviving listeners.
    server.send(inform("a", 5, "xy")).await;
    assert_eq!(
        timeout(TICK, sub_a.next_message())
            .await
            .expect("resumed delivery")
            .expect("alive")
            .payload(),
        "xy"
    );
    assert_eq!(client.cursor("a").await.expect("query"), Some(7));
}

#[tokio::test]
async fn normal_close_does_not_reconnect() {
    let (client, server, mut connections) = start(test_config()).await;
    server.close(1000).await;

    // Well past the reconnect delay: no new dial may happen.
    assert!(
        timeout(Duration::from_millis(100), connections.recv())
            .await
            .is_err()
    );
    assert_eq!(
        client.state().await.expect("query"),
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn disconnect_cancels_a_pending_reconnect() {
    let (client, server, mut connections) = start(test_config()).await;
    server.close(1006).await;
    client.disconnect().await.expect("disconnect");

    assert!(
        timeout(Duration::from_millis(100), connections.recv())
            .await
            .is_err()
    );
    assert_eq!(
        client.state().await.expect("query"),
        ConnectionState::Disconnected
    );
    // The session is down for good; sends now fail synchronously.
    let err = client.publish_text("orders", "x").await.expect_err("down");
    assert!(format!("{err:#}").contains("transport not connected"));
}

#[tokio::test]
async fn disconnect_closes_the_transport_normally() {
    let (client, mut server, _connections) = start(test_config()).await;
    client.disconnect().await.expect("disconnect");
    assert!(matches!(
        server.recv_command().await,
        TransportCommand::Close { code: 1000 }
    ));
}

#[tokio::test]
async fn undecodable_frames_are_dropped_not_fatal() {
    let (client, mut server, _connections) = start(test_config()).await;
    let mut subscription = subscribe(&client, &mut server, "orders", 0).await;

    // Unknown command byte, then a truncated ConnAck. Both are discarded.
    server.send(vec![0xEE, 1, 2]).await;
    server.send(vec![Command::ConnAck as u8]).await;

    server.send(inform("orders", 0, "still here")).await;
    assert_eq!(
        timeout(TICK, subscription.next_message())
            .await
            .expect("delivery after bad frames")
            .expect("alive")
            .payload(),
        "still here"
    );
}

#[tokio::test]
async fn inform_cursor_advances_by_text_length_not_bytes() {
    let (client, mut server, _connections) = start(test_config()).await;
    let mut subscription = subscribe(&client, &mut server, "notes", 10).await;

    // "héllo" is 6 bytes but 5 characters.
    server.send(inform("notes", 10, "héllo")).await;
    timeout(TICK, subscription.next_message())
        .await
        .expect("delivery")
        .expect("alive");
    assert_eq!(client.cursor("notes").await.expect("query"), Some(15));
}

#[tokio::test]
async fn inbound_publish_is_delivered_without_cursor_advance() {
    let (client, mut server, _connections) = start(test_config()).await;
    let mut subscription = subscribe(&client, &mut server, "orders", 0).await;

    server.send(publish_frame("orders", "{\"qty\":1}")).await;
    let message = timeout(TICK, subscription.next_message())
        .await
        .expect("publish within timeout")
        .expect("alive");
    assert_eq!(message.command, Command::Publish);
    assert_eq!(message.payload(), "{\"qty\":1}");
    // Only Inform moves the resumption cursor.
    assert_eq!(client.cursor("orders").await.expect("query"), Some(0));
}

#[tokio::test]
async fn inform_cursor_saturates_instead_of_overflowing() {
    let (client, mut server, _connections) = start(test_config()).await;
    let mut subscription = subscribe(&client, &mut server, "notes", 0).await;

    server.send(inform("notes", u64::MAX, "xy")).await;
    timeout(TICK, subscription.next_message())
        .await
        .expect("delivery")
        .expect("alive");
    assert_eq!(client.cursor("notes").await.expect("query"), Some(u64::MAX));
    // The extreme cursor never takes the session down with it.
    assert_eq!(
        client.state().await.expect("query"),
        ConnectionState::Connected
    );
}

#[test]
fn topic_gauge_counts_implicitly_created_entries() {
    let recorder = metrics_util::debugging::DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    // A current-thread runtime inside the recorder scope keeps every
    // session-side metric emission on this thread.
    metrics::with_local_recorder(&recorder, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let (client, mut server, _connections) = start(test_config()).await;
            let mut subscription = subscribe(&client, &mut server, "a", 0).await;

            // An Inform for a topic nobody subscribed still creates an
            // entry, and the gauge has to follow.
            server.send(inform("ghost", 0, "x")).await;
            server.send(inform("a", 0, "y")).await;
            timeout(TICK, subscription.next_message())
                .await
                .expect("delivery")
                .expect("alive");
            assert_eq!(client.topics().await.expect("query").len(), 2);
        });
    });

    let gauge = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(key, _, _, value)| (key.key().name() == "rill_client_topics").then_some(value))
        .expect("topic gauge recorded");
    match gauge {
        metrics_util::debugging::DebugValue::Gauge(value) => {
            assert_eq!(value.into_inner(), 2.0);
        }
        other => panic!("unexpected metric value {other:?}"),
    }
}

#[tokio::test]
async fn oversize_publish_fails_before_send() {
    let (client, _server, _connections) = start(test_config()).await;
    let payload = "x".repeat(300);
    let err = client
        .publish_text("orders", &payload)
        .await
        .expect_err("oversize");
    assert!(format!("{err:#}").contains("255-byte length field"));
}
