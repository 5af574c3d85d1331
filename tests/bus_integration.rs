//! End-to-end tests over real loopback sockets.
//!
//! Every test starts its own hub on an ephemeral port and connects peers to
//! it. Waiting is always bounded by `tokio::time::timeout`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_tungstenite::tungstenite::Message;
use wsbus::{
    BusError, Config, ConnectionState, Envelope, Hub, Notify, Peer, Registration, Request,
    Responder,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_hub(hub: &Hub) -> String {
    hub.start("127.0.0.1:0").await.unwrap().to_string()
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

/// Connect `identity` and wait until the hub has registered it.
async fn connect(hub: &Hub, addr: &str, identity: &str) -> Peer {
    let peer = Peer::new(identity);
    peer.connect(addr).await.unwrap();
    wait_until(&format!("'{identity}' to register"), || {
        hub.peers().iter().any(|p| p == identity)
    })
    .await;
    peer
}

fn notify_channel() -> (impl Fn(Notify) + Send + Sync + 'static, UnboundedReceiver<Notify>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |notify: Notify| {
            let _ = tx.send(notify);
        },
        rx,
    )
}

#[tokio::test]
async fn test_peer_notify_reaches_hub_handler() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let (handler, mut rx) = notify_channel();
    hub.on_notify("log", handler, None);

    let peer = connect(&hub, &addr, "ui").await;
    peer.notify("log", json!({"msg": "hi"}), None).unwrap();

    let notify = recv(&mut rx).await;
    assert_eq!(notify.payload, json!({"msg": "hi"}));
    assert_eq!(notify.sender_id, "ui");
}

#[tokio::test]
async fn test_request_gets_partial_then_final() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    hub.on_request(
        "sum",
        |request: Request, responder: Responder| {
            let a = request.payload["a"].as_i64().unwrap_or(0);
            let b = request.payload["b"].as_i64().unwrap_or(0);
            responder.respond(json!({"partial": true}));
            responder.end(json!({"total": a + b}));
        },
        None,
    );

    let peer = connect(&hub, &addr, "ui").await;
    let (tx, mut rx) = mpsc::unbounded_channel::<(bool, Value)>();
    let partial_tx = tx.clone();
    let handle = peer.request("sum", json!({"a": 2, "b": 3})).unwrap();
    handle
        .on_partial(move |r| {
            let _ = partial_tx.send((false, r.payload));
        })
        .on_final(move |r| {
            let _ = tx.send((true, r.payload));
        });

    assert_eq!(recv(&mut rx).await, (false, json!({"partial": true})));
    assert_eq!(recv(&mut rx).await, (true, json!({"total": 5})));
    assert!(!peer.is_outstanding(handle.request_id()));
    assert!(handle.is_finished());
}

#[tokio::test]
async fn test_responder_can_answer_from_spawned_task() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    hub.on_request(
        "slow",
        |request: Request, responder: Responder| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                responder.end(request.payload);
            });
        },
        None,
    );

    let peer = connect(&hub, &addr, "ui").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    peer.request("slow", json!("later")).unwrap().on_final(move |r| {
        let _ = tx.send(r.payload);
    });

    assert_eq!(recv(&mut rx).await, json!("later"));
    assert!(peer.outstanding_requests().is_empty());
}

#[tokio::test]
async fn test_hub_notify_reaches_peer_handler() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let peer = connect(&hub, &addr, "ui").await;
    let (handler, mut rx) = notify_channel();
    peer.on_notify("theme", handler);

    assert_eq!(hub.notify("theme", json!("dark"), Some("ui")), 1);

    let notify = recv(&mut rx).await;
    assert_eq!(notify.sender_id, "hub");
    assert_eq!(notify.target_id.as_deref(), Some("ui"));
    assert_eq!(notify.payload, json!("dark"));
}

#[tokio::test]
async fn test_hub_notify_to_unknown_peer_is_swallowed() {
    let hub = Hub::new();
    let _addr = start_hub(&hub).await;
    assert_eq!(hub.notify("ping", json!({}), Some("nonexistent")), 0);
}

#[tokio::test]
async fn test_broadcast_reaches_only_peers_registered_at_call_time() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;

    let a = connect(&hub, &addr, "a").await;
    let b = connect(&hub, &addr, "b").await;
    let (handler_a, mut rx_a) = notify_channel();
    let (handler_b, mut rx_b) = notify_channel();
    a.on_notify("tick", handler_a);
    b.on_notify("tick", handler_b);

    assert_eq!(hub.notify("tick", json!({"n": 1}), None), 2);

    let late = connect(&hub, &addr, "late").await;
    let (handler_late, mut rx_late) = notify_channel();
    late.on_notify("tick", handler_late);

    let got_a = recv(&mut rx_a).await;
    let got_b = recv(&mut rx_b).await;
    assert_eq!(got_a.payload, got_b.payload);
    assert_eq!(got_a.target_id.as_deref(), Some("a"));
    assert_eq!(got_b.target_id.as_deref(), Some("b"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_late.try_recv().is_err());
}

#[tokio::test]
async fn test_sends_before_connect_fail() {
    let peer = Peer::new("ui");
    let notified = peer.notify("log", json!(null), None);
    assert!(matches!(notified, Err(BusError::NotConnected(_))));
    let requested = peer.request("sum", json!(null));
    assert!(matches!(requested, Err(BusError::NotConnected(_))));
}

#[tokio::test]
async fn test_request_ids_strictly_increase() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let peer = connect(&hub, &addr, "ui").await;

    let ids: Vec<u64> = (0..10)
        .map(|_| peer.request("nobody", json!(null)).unwrap().request_id())
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "ids: {ids:?}");
}

#[tokio::test]
async fn test_end_twice_is_harmless() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    hub.on_request(
        "twice",
        |_request: Request, responder: Responder| {
            responder.end(json!(1));
            responder.end(json!(2));
        },
        None,
    );

    let peer = connect(&hub, &addr, "ui").await;
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&count);
        peer.request("twice", json!(null)).unwrap().on_final(move |r| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(r.payload);
        });
        assert_eq!(recv(&mut rx).await, json!(1));
    }

    // The duplicate finals were routing misses; the connection survived.
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(peer.state(), ConnectionState::Registered);
}

#[tokio::test]
async fn test_duplicate_identity_is_rejected() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let first = connect(&hub, &addr, "ui").await;

    let second = Peer::new("ui");
    second.connect(&addr).await.unwrap();
    wait_until("duplicate to be closed", || second.state() == ConnectionState::Closed).await;

    assert_eq!(hub.peers(), vec!["ui".to_string()]);
    assert_eq!(first.state(), ConnectionState::Registered);
    assert_eq!(hub.notify("still-there", json!(null), Some("ui")), 1);
}

#[tokio::test]
async fn test_disconnect_purges_registry() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let peer = connect(&hub, &addr, "ui").await;

    peer.close();
    assert_eq!(peer.state(), ConnectionState::Closed);
    wait_until("registry to empty", || {
        hub.peers().is_empty() && hub.connection_count() == 0
    })
    .await;

    // The identity is free for a new connection.
    let again = connect(&hub, &addr, "ui").await;
    assert_eq!(again.state(), ConnectionState::Registered);
}

#[tokio::test]
async fn test_malformed_frames_do_not_kill_connection() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let (handler, mut rx) = notify_channel();
    hub.on_notify("log", handler, None);

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    let registration = Envelope::from(Registration::new("raw")).to_text();
    socket.send(Message::Text(registration)).await.unwrap();
    socket.send(Message::Text("not json".to_string())).await.unwrap();
    socket.send(Message::Text(r#"{"kind":"bogus"}"#.to_string())).await.unwrap();
    socket.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let notify = Envelope::from(Notify::new("log", json!("ok"), "raw", None)).to_text();
    socket.send(Message::Text(notify)).await.unwrap();

    let got = recv(&mut rx).await;
    assert_eq!(got.sender_id, "raw");
    assert_eq!(got.payload, json!("ok"));
}

#[tokio::test]
async fn test_unregistered_connection_is_unknown_sender() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let (scoped, mut scoped_rx) = notify_channel();
    let (open, mut open_rx) = notify_channel();
    hub.on_notify("save", scoped, Some("ui"));
    hub.on_notify("ping", open, None);

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    // Claims to be "ui" but never registered.
    let save = Envelope::from(Notify::new("save", json!(1), "ui", None)).to_text();
    let ping = Envelope::from(Notify::new("ping", json!(1), "ui", None)).to_text();
    socket.send(Message::Text(save)).await.unwrap();
    socket.send(Message::Text(ping)).await.unwrap();

    recv(&mut open_rx).await;
    assert!(scoped_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_on_connect_runs_after_registration() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);

    let peer = Peer::new("ui");
    peer.on_connect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    peer.connect(&addr).await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(peer.state(), ConnectionState::Registered);
    let err = peer.connect(&addr).await.unwrap_err();
    assert!(matches!(err, BusError::AlreadyConnected(_)));
}

#[tokio::test]
async fn test_connect_to_unreachable_hub_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let peer = Peer::new("ui");
    let err = peer.connect(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, BusError::Connection(_)));
    assert_eq!(peer.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_close_purges_outstanding_requests() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    hub.on_request("never", |_request: Request, _responder: Responder| {}, None);

    let peer = connect(&hub, &addr, "ui").await;
    let handle = peer.request("never", json!(null)).unwrap();
    assert!(peer.is_outstanding(handle.request_id()));

    peer.close();
    assert!(peer.outstanding_requests().is_empty());
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn test_hub_shutdown_closes_peers() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let peer = connect(&hub, &addr, "ui").await;

    hub.shutdown();
    wait_until("peer to observe shutdown", || peer.state() == ConnectionState::Closed).await;
    assert!(hub.local_addr().is_none());
}

#[tokio::test]
async fn test_relay_forwards_between_peers() {
    let hub = Hub::with_config(Config {
        relay_targeted_notify: true,
        ..Config::default()
    });
    let addr = start_hub(&hub).await;

    let ui = connect(&hub, &addr, "ui").await;
    let settings = connect(&hub, &addr, "settings").await;
    let (handler, mut rx) = notify_channel();
    settings.on_notify("chat", handler);

    ui.notify("chat", json!("hey"), Some("settings")).unwrap();

    let got = recv(&mut rx).await;
    assert_eq!(got.sender_id, "ui");
    assert_eq!(got.payload, json!("hey"));
}

#[tokio::test]
async fn test_panicking_hub_handler_keeps_connection_usable() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    let (handler, mut rx) = notify_channel();
    hub.on_notify("boom", |_notify: Notify| panic!("hub handler failed"), None);
    hub.on_notify("log", handler, None);

    let peer = connect(&hub, &addr, "ui").await;
    peer.notify("boom", json!(null), None).unwrap();
    peer.notify("log", json!("after"), None).unwrap();

    assert_eq!(recv(&mut rx).await.payload, json!("after"));
    assert_eq!(hub.peers(), vec!["ui".to_string()]);

    peer.close();
    wait_until("registry to empty", || hub.connection_count() == 0).await;
    let again = connect(&hub, &addr, "ui").await;
    assert_eq!(again.state(), ConnectionState::Registered);
}

#[tokio::test]
async fn test_panicking_peer_handler_still_tears_down() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;
    hub.on_request("never", |_request: Request, _responder: Responder| {}, None);

    let peer = connect(&hub, &addr, "ui").await;
    let (handler, mut rx) = notify_channel();
    peer.on_notify("boom", |_notify: Notify| panic!("peer handler failed"));
    peer.on_notify("tick", handler);
    let handle = peer.request("never", json!(null)).unwrap();
    let (final_tx, mut final_rx) = mpsc::unbounded_channel::<Value>();
    handle.on_final(move |r| {
        let _ = final_tx.send(r.payload);
    });

    assert_eq!(hub.notify("boom", json!(null), Some("ui")), 1);
    assert_eq!(hub.notify("tick", json!(1), Some("ui")), 1);
    assert_eq!(recv(&mut rx).await.payload, json!(1));

    hub.shutdown();
    wait_until("peer to observe shutdown", || peer.state() == ConnectionState::Closed).await;
    assert!(peer.outstanding_requests().is_empty());
    // The purged request released its callback.
    let ended = tokio::time::timeout(WAIT, final_rx.recv()).await.unwrap();
    assert!(ended.is_none());
}

#[tokio::test]
async fn test_hub_shutdown_sends_close_frame() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    let registration = Envelope::from(Registration::new("raw")).to_text();
    socket.send(Message::Text(registration)).await.unwrap();
    wait_until("'raw' to register", || hub.peers() == vec!["raw".to_string()]).await;

    hub.shutdown();

    let frame = tokio::time::timeout(WAIT, socket.next())
        .await
        .expect("timed out waiting for close frame");
    match frame {
        Some(Ok(Message::Close(Some(close)))) => assert_eq!(close.reason, "hub shutting down"),
        other => panic!("Expected close frame, got: {other:?}"),
    }
    wait_until("registry to empty", || hub.connection_count() == 0).await;
}

#[tokio::test]
async fn test_shutdown_during_handshake_refuses_connection() {
    let hub = Hub::new();
    let addr = start_hub(&hub).await;

    // TCP is accepted but the WebSocket handshake has not started.
    let tcp = tokio::net::TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    hub.shutdown();

    let handshake = tokio::time::timeout(
        WAIT,
        tokio_tungstenite::client_async(format!("ws://{addr}"), tcp),
    )
    .await
    .expect("handshake neither completed nor failed");
    assert!(handshake.is_err());
    assert_eq!(hub.connection_count(), 0);
}
