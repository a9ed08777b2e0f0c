use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use vnc_latency::channel::{ChannelEvent, ProbeChannel};
use vnc_latency::config::LatencyConfig;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// Answer every ping with a matching pong.
    Echo,
    /// Answer one ping, then close the connection.
    DropAfterFirstPong,
    /// Echo back a timestamp that matches no outstanding ping.
    CorruptTimestamp,
    /// Reply with something that is not a probe message at all.
    Garbage,
}

#[derive(Clone)]
struct ServerState {
    behavior: Behavior,
    connections: Arc<AtomicUsize>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(_session_id): Path<String>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if value["type"] != "ping" {
            continue;
        }
        let client_timestamp = value["timestamp"].as_u64().unwrap_or(0);
        let reply = match state.behavior {
            Behavior::Garbage => "{\"type\":\"stats\"}".to_string(),
            Behavior::CorruptTimestamp => json!({
                "type": "pong",
                "clientTimestamp": client_timestamp + 999,
                "serverTimestamp": client_timestamp,
            })
            .to_string(),
            _ => json!({
                "type": "pong",
                "clientTimestamp": client_timestamp,
                "serverTimestamp": client_timestamp,
            })
            .to_string(),
        };
        if socket.send(WsMessage::Text(reply)).await.is_err() {
            return;
        }
        if state.behavior == Behavior::DropAfterFirstPong {
            return;
        }
    }
}

async fn spawn_server(behavior: Behavior) -> (SocketAddr, Arc<AtomicUsize>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let state = ServerState {
        behavior,
        connections: connections.clone(),
    };
    let app = Router::new()
        .route("/latency/:session_id", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, connections)
}

fn fast_config(addr: SocketAddr) -> LatencyConfig {
    LatencyConfig::new(format!("http://{addr}"))
        .with_ping_interval(Duration::from_millis(25))
        .with_reconnect_backoff(Duration::from_millis(20), Duration::from_millis(100))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn measures_round_trip_from_matching_pong() {
    let (addr, _) = spawn_server(Behavior::Echo).await;
    let (mut channel, mut events) =
        ProbeChannel::open(&fast_config(addr), "s1").expect("open channel");

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event before timeout")
        .expect("channel alive");
    match event {
        ChannelEvent::RoundTrip {
            browser_to_proxy, ..
        } => {
            // Loopback round trips are fast; anything near a second means
            // the probe was not matched to its own reply.
            assert!(browser_to_proxy < Duration::from_secs(1));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    channel.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_unexpected_close() {
    let (addr, connections) = spawn_server(Behavior::DropAfterFirstPong).await;
    let (mut channel, mut events) =
        ProbeChannel::open(&fast_config(addr), "s1").expect("open channel");

    for _ in 0..2 {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("round trip before timeout")
            .expect("channel alive");
        assert!(matches!(event, ChannelEvent::RoundTrip { .. }));
    }
    // Each round trip came from a fresh connection.
    assert!(connections.load(Ordering::SeqCst) >= 2);
    channel.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_replies_produce_no_measurements() {
    let (addr, _) = spawn_server(Behavior::CorruptTimestamp).await;
    let (mut channel, mut events) =
        ProbeChannel::open(&fast_config(addr), "s1").expect("open channel");

    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "corrupted replies must be dropped"
    );
    channel.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_replies_are_dropped_and_the_channel_continues() {
    let (addr, connections) = spawn_server(Behavior::Garbage).await;
    let (mut channel, mut events) =
        ProbeChannel::open(&fast_config(addr), "s1").expect("open channel");

    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err()
    );
    // The parse failures did not kill the connection.
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    channel.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_stops_events() {
    let (addr, _) = spawn_server(Behavior::Echo).await;
    let (mut channel, mut events) =
        ProbeChannel::open(&fast_config(addr), "s1").expect("open channel");

    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("first event")
        .expect("channel alive");

    channel.close().await;
    channel.close().await;

    // Sender side is gone; after draining, the receiver ends.
    while let Ok(Some(_)) = timeout(Duration::from_millis(200), events.recv()).await {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_reconnect_budget_is_spent() {
    // Bind then drop to get an address that refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let config = fast_config(addr).with_max_reconnect_attempts(2);
    let (mut channel, mut events) = ProbeChannel::open(&config, "s1").expect("open channel");

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("unavailable before timeout")
        .expect("channel alive");
    assert_eq!(event, ChannelEvent::Unavailable);
    channel.close().await;
}
