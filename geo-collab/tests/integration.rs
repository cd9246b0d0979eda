//! Integration tests: real server + clients over WebSocket.
//!
//! Each test binds its own server on a free port and drives it either
//! through [`ConnectionManager`] or through a raw tungstenite socket that
//! speaks the JSON envelope directly.

use std::future::Future;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use geo_collab::client::{ClientEvent, ConnectionManager};
use geo_collab::config::{ClientConfig, ReconnectConfig, ServerConfig};
use geo_collab::model::{Feature, GeometryType, SessionInfo};
use geo_collab::observer::NoopObserver;
use geo_collab::protocol::{DeletePayload, Envelope, ErrorCode, MessageType, Payload};
use geo_collab::reconciler::LocalChange;
use geo_collab::reconnect::ConnectionState;
use geo_collab::server::CollabServer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port; returns the handle and its ws:// URL.
async fn start_test_server(config: ServerConfig) -> (Arc<CollabServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(CollabServer::new(config));
    let handle = server.clone();
    tokio::spawn(async move {
        let _ = handle.serve(listener).await;
    });
    (server, url)
}

fn test_client_config() -> ClientConfig {
    ClientConfig {
        connect_timeout_secs: 2,
        reconnect: ReconnectConfig {
            base_delay_ms: 10,
            max_delay_ms: 50,
            max_jitter_ms: 0,
            max_attempts: 5,
        },
        ..ClientConfig::default()
    }
}

fn client(user: &str) -> (ConnectionManager, mpsc::Receiver<ClientEvent>) {
    let mut manager =
        ConnectionManager::new(user, user.to_uppercase(), test_client_config(), Arc::new(NoopObserver));
    let events = manager.take_event_rx().unwrap();
    (manager, events)
}

fn point(id: &str, owner: &str, at: u64) -> Feature {
    Feature::new(id, GeometryType::Point, vec![[13.4, 52.5]], owner, at)
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Receive events until one matches `want`.
async fn wait_for_event(
    events: &mut mpsc::Receiver<ClientEvent>,
    want: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if want(&event) {
            return event;
        }
    }
}

async fn raw_connect(url: &str) -> RawSocket {
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

async fn raw_send(ws: &mut RawSocket, envelope: &Envelope) {
    ws.send(Message::text(envelope.encode().unwrap())).await.unwrap();
}

/// Next text frame, decoded. Panics on timeout or close.
async fn raw_recv(ws: &mut RawSocket) -> Envelope {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return Envelope::decode(text.as_str()).unwrap();
        }
    }
}

/// True if nothing arrives within `ms` milliseconds.
async fn raw_silent(ws: &mut RawSocket, ms: u64) -> bool {
    timeout(Duration::from_millis(ms), ws.next()).await.is_err()
}

/// Connect raw and join `room_id`; returns the socket and the joiner's sync.
async fn raw_join(url: &str, room_id: &str, session: &SessionInfo) -> (RawSocket, Envelope) {
    let mut ws = raw_connect(url).await;
    raw_send(&mut ws, &Envelope::join(room_id, session)).await;
    let sync = raw_recv(&mut ws).await;
    assert_eq!(sync.kind(), MessageType::Sync);
    (ws, sync)
}

// ─── End-to-end ──────────────────────────────────────────────────

#[tokio::test]
async fn test_two_sessions_converge_and_room_survives_disconnect() {
    let (server, url) = start_test_server(ServerConfig {
        room_grace_period_secs: 1,
        ..ServerConfig::default()
    })
    .await;

    let (x, mut x_events) = client("x");
    x.connect(&url, Some("R1")).await.unwrap();
    wait_for_event(&mut x_events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    assert_eq!(x.reconciler().lock().await.features().count(), 0);

    assert!(x.submit_change(LocalChange::CreateFeature(point("f1", "x", 100))).await);
    let broker = server.broker().clone();
    eventually("f1 in the room state", || {
        let broker = broker.clone();
        async move {
            broker
                .snapshot("R1")
                .await
                .is_some_and(|state| state.features.contains_key("f1"))
        }
    })
    .await;

    let (y, mut y_events) = client("y");
    y.connect(&url, Some("R1")).await.unwrap();
    wait_for_event(&mut y_events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    {
        let reconciler = y.reconciler();
        let reconciler = reconciler.lock().await;
        let f1 = reconciler.feature("f1").expect("sync carries f1");
        assert_eq!(f1.updated_at, 100);
        assert_eq!(f1.owner_id, "x");
    }

    assert!(y.submit_change(LocalChange::UpdateFeature(point("f1", "y", 150))).await);
    let x_replica = x.reconciler();
    eventually("x sees f1@150", || {
        let x_replica = x_replica.clone();
        async move {
            x_replica
                .lock()
                .await
                .feature("f1")
                .is_some_and(|f| f.updated_at == 150 && f.owner_id == "y")
        }
    })
    .await;

    // Unclean disconnect: tasks are aborted without a leave.
    drop(x);
    eventually("x evicted from R1", || {
        let broker = broker.clone();
        async move { broker.members("R1").await.len() == 1 }
    })
    .await;

    sleep(Duration::from_millis(1500)).await;
    assert!(broker.room_exists("R1").await, "room with a member is never collected");
    let state = broker.snapshot("R1").await.unwrap();
    assert_eq!(state.features["f1"].updated_at, 150);

    y.close().await;
}

#[tokio::test]
async fn test_empty_room_collected_after_grace() {
    let (server, url) = start_test_server(ServerConfig {
        room_grace_period_secs: 1,
        ..ServerConfig::default()
    })
    .await;

    let session = SessionInfo::with_id("s1", "u1", "U1");
    let (mut ws, _) = raw_join(&url, "R1", &session).await;
    raw_send(&mut ws, &Envelope::leave("R1", "u1")).await;

    let broker = server.broker().clone();
    eventually("member removed", || {
        let broker = broker.clone();
        async move { broker.members("R1").await.is_empty() }
    })
    .await;
    assert!(broker.room_exists("R1").await, "room survives during grace");

    sleep(Duration::from_millis(1500)).await;
    assert!(!broker.room_exists("R1").await);
}

// ─── Routing ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_change_fans_out_excluding_sender() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let alice = SessionInfo::with_id("sa", "alice", "Alice");
    let bob = SessionInfo::with_id("sb", "bob", "Bob");
    let (mut ws_a, _) = raw_join(&url, "R1", &alice).await;
    let (mut ws_b, _) = raw_join(&url, "R1", &bob).await;

    let joined = raw_recv(&mut ws_a).await;
    assert!(matches!(joined.payload, Payload::PresenceJoined(ref s) if s.session_id == "sb"));

    let create = Envelope::change(
        "R1",
        "alice",
        "sa:feature_create:f1:5",
        Payload::FeatureCreate(point("f1", "alice", 5)),
    );
    raw_send(&mut ws_a, &create).await;

    let received = raw_recv(&mut ws_b).await;
    assert_eq!(received.kind(), MessageType::FeatureCreate);
    assert_eq!(received.change_id.as_deref(), Some("sa:feature_create:f1:5"));
    assert!(raw_silent(&mut ws_a, 200).await, "sender must not get its own change");
}

#[tokio::test]
async fn test_stale_change_not_broadcast() {
    let (server, url) = start_test_server(ServerConfig::default()).await;

    let alice = SessionInfo::with_id("sa", "alice", "Alice");
    let bob = SessionInfo::with_id("sb", "bob", "Bob");
    let (mut ws_a, _) = raw_join(&url, "R1", &alice).await;
    let (mut ws_b, _) = raw_join(&url, "R1", &bob).await;
    let _ = raw_recv(&mut ws_a).await; // presence_joined

    let newer = Envelope::change("R1", "alice", "c1", Payload::FeatureUpdate(point("f1", "alice", 20)));
    raw_send(&mut ws_a, &newer).await;
    assert_eq!(raw_recv(&mut ws_b).await.kind(), MessageType::FeatureUpdate);

    let older = Envelope::change("R1", "alice", "c2", Payload::FeatureUpdate(point("f1", "alice", 10)));
    raw_send(&mut ws_a, &older).await;
    assert!(raw_silent(&mut ws_b, 200).await, "losing change is not relayed");

    let state = server.broker().snapshot("R1").await.unwrap();
    assert_eq!(state.features["f1"].updated_at, 20);
}

#[tokio::test]
async fn test_room_isolation() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let (mut ws_1, _) = raw_join(&url, "R1", &SessionInfo::with_id("s1", "u1", "U1")).await;
    let (mut ws_2, _) = raw_join(&url, "R2", &SessionInfo::with_id("s2", "u2", "U2")).await;

    let create = Envelope::change("R2", "u2", "c1", Payload::FeatureCreate(point("f1", "u2", 1)));
    raw_send(&mut ws_2, &create).await;

    assert!(raw_silent(&mut ws_1, 200).await, "R1 must not see R2 traffic");
}

#[tokio::test]
async fn test_sync_contains_tombstones_and_members() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let (mut ws_a, _) = raw_join(&url, "R1", &SessionInfo::with_id("sa", "alice", "Alice")).await;
    raw_send(
        &mut ws_a,
        &Envelope::change("R1", "alice", "c1", Payload::FeatureCreate(point("f1", "alice", 1))),
    )
    .await;
    raw_send(
        &mut ws_a,
        &Envelope::change(
            "R1",
            "alice",
            "c2",
            Payload::FeatureDelete(DeletePayload {
                id: "f1".into(),
                updated_at: 2,
            }),
        ),
    )
    .await;
    sleep(Duration::from_millis(100)).await;

    let (_ws_b, sync) = raw_join(&url, "R1", &SessionInfo::with_id("sb", "bob", "Bob")).await;
    let Payload::Sync(state) = sync.payload else {
        panic!("expected sync");
    };
    assert!(state.features.is_empty());
    assert_eq!(state.deleted_features["f1"].updated_at, 2);
    let mut members: Vec<_> = state.members.iter().map(|m| m.session_id.as_str()).collect();
    members.sort();
    assert_eq!(members, vec!["sa", "sb"]);
}

// ─── Errors ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_change_before_join_is_rejected() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let mut ws = raw_connect(&url).await;

    let create = Envelope::change("R1", "u1", "c1", Payload::FeatureCreate(point("f1", "u1", 1)));
    raw_send(&mut ws, &create).await;

    let reply = raw_recv(&mut ws).await;
    assert!(matches!(reply.payload, Payload::Error(ref e) if e.code == ErrorCode::NotJoined));
}

#[tokio::test]
async fn test_malformed_envelope_keeps_connection_open() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let mut ws = raw_connect(&url).await;

    ws.send(Message::text("{not json".to_string())).await.unwrap();
    let reply = raw_recv(&mut ws).await;
    assert!(matches!(reply.payload, Payload::Error(ref e) if e.code == ErrorCode::Protocol));

    raw_send(&mut ws, &Envelope::heartbeat("", "u1")).await;
    let reply = raw_recv(&mut ws).await;
    assert_eq!(reply.kind(), MessageType::Heartbeat);

    assert_eq!(server.stats().await.protocol_errors, 1);
}

#[tokio::test]
async fn test_capacity_rejects_join_but_keeps_socket() {
    let (server, url) = start_test_server(ServerConfig {
        max_members_per_room: Some(1),
        ..ServerConfig::default()
    })
    .await;

    let (_ws_a, _) = raw_join(&url, "R1", &SessionInfo::with_id("sa", "alice", "Alice")).await;

    let (b, mut b_events) = client("bob");
    b.connect(&url, Some("R1")).await.unwrap();
    let event = wait_for_event(&mut b_events, |e| matches!(e, ClientEvent::ServerError(_))).await;
    assert!(matches!(event, ClientEvent::ServerError(ref e) if e.code == ErrorCode::Capacity));

    assert_eq!(b.state().await, ConnectionState::Connected);
    assert_eq!(b.room_id().await, None);
    assert_eq!(server.broker().members("R1").await.len(), 1);
    b.close().await;
}

#[tokio::test]
async fn test_duplicate_session_id_refused() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let owner = SessionInfo::with_id("dup", "alice", "Alice");
    let (mut ws_a, _) = raw_join(&url, "R1", &owner).await;
    let (mut ws_c, _) = raw_join(&url, "R1", &SessionInfo::with_id("sc", "carol", "Carol")).await;
    assert_eq!(raw_recv(&mut ws_a).await.kind(), MessageType::PresenceJoined);

    let mut ws_b = raw_connect(&url).await;
    let impostor = SessionInfo::with_id("dup", "mallory", "Mallory");
    raw_send(&mut ws_b, &Envelope::join("R1", &impostor)).await;
    let reply = raw_recv(&mut ws_b).await;
    assert!(matches!(reply.payload, Payload::Error(ref e) if e.code == ErrorCode::Protocol));
    drop(ws_b);
    sleep(Duration::from_millis(200)).await;

    // The first socket keeps its seat and its queue.
    assert_eq!(server.broker().members("R1").await.len(), 2);
    assert!(raw_silent(&mut ws_c, 100).await, "no presence_left for the owner");
    let create = Envelope::change(
        "R1",
        "carol",
        "sc:feature_create:f1:1",
        Payload::FeatureCreate(point("f1", "carol", 1)),
    );
    raw_send(&mut ws_c, &create).await;
    let relayed = raw_recv(&mut ws_a).await;
    assert_eq!(relayed.kind(), MessageType::FeatureCreate);
}

// ─── Heartbeats ──────────────────────────────────────────────────

#[tokio::test]
async fn test_heartbeat_reply() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (mut ws, _) = raw_join(&url, "R1", &SessionInfo::with_id("s1", "u1", "U1")).await;

    raw_send(&mut ws, &Envelope::heartbeat("R1", "u1")).await;
    let reply = raw_recv(&mut ws).await;
    assert_eq!(reply.kind(), MessageType::Heartbeat);
    assert_eq!(reply.room_id, "R1");
}

#[tokio::test]
async fn test_silent_peer_evicted() {
    let (server, url) = start_test_server(ServerConfig {
        heartbeat_interval_secs: 1,
        ..ServerConfig::default()
    })
    .await;
    let (mut ws, _) = raw_join(&url, "R1", &SessionInfo::with_id("s1", "u1", "U1")).await;

    // No traffic from us: the server closes after twice the interval.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "silent peer should be disconnected");

    let broker = server.broker().clone();
    eventually("evicted member removed", || {
        let broker = broker.clone();
        async move { broker.members("R1").await.is_empty() }
    })
    .await;
}

// ─── Client lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_close_sends_leave_and_never_reconnects() {
    let (server, url) = start_test_server(ServerConfig::default()).await;

    let (x, mut events) = client("x");
    x.connect(&url, Some("R1")).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, ClientEvent::Synced { .. })).await;

    x.close().await;
    assert_eq!(x.state().await, ConnectionState::Disconnected);

    let broker = server.broker().clone();
    eventually("x left R1", || {
        let broker = broker.clone();
        async move { broker.members("R1").await.is_empty() }
    })
    .await;

    sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                ClientEvent::StateChanged(ConnectionState::Reconnecting) | ClientEvent::Disconnected
            ),
            "unexpected {event:?} after close"
        );
    }
    assert_eq!(x.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_join_switches_rooms() {
    let (server, url) = start_test_server(ServerConfig::default()).await;

    let (x, mut events) = client("x");
    x.connect(&url, Some("R1")).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    x.submit_change(LocalChange::CreateFeature(point("f1", "x", 1))).await;

    assert!(x.join("R2").await);
    let synced = wait_for_event(&mut events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    assert_eq!(synced, ClientEvent::Synced { room_id: "R2".into() });
    assert_eq!(x.reconciler().lock().await.features().count(), 0);

    let broker = server.broker().clone();
    let session_id = x.session().await.unwrap().session_id;
    assert_eq!(broker.room_of(&session_id).await.as_deref(), Some("R2"));
    assert!(broker.members("R1").await.is_empty());
    x.close().await;
}

// ─── Reconnection ────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_rejoins_with_fresh_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    // Accepts the first connection, reads its join, then drops it.
    // The second connection gets a sync and stays open.
    let (joins_tx, mut joins_rx) = mpsc::channel::<Envelope>(4);
    tokio::spawn(async move {
        for round in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let join = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break Envelope::decode(text.as_str()).unwrap(),
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            };
            joins_tx.send(join.clone()).await.unwrap();
            if round == 1 {
                let sync = Envelope::sync(join.room_id.clone(), Default::default());
                ws.send(Message::text(sync.encode().unwrap())).await.unwrap();
                while let Some(Ok(_)) = ws.next().await {}
            }
        }
    });

    let (x, mut events) = client("x");
    let first_session = x.connect(&url, Some("R1")).await.unwrap();

    let first = timeout(Duration::from_secs(2), joins_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(first.payload, Payload::Join(ref s) if s.session_id == first_session.session_id));

    wait_for_event(&mut events, |e| *e == ClientEvent::StateChanged(ConnectionState::Reconnecting)).await;
    let second = timeout(Duration::from_secs(2), joins_rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.room_id, "R1");
    let Payload::Join(rejoined) = second.payload else {
        panic!("expected join");
    };
    assert_ne!(rejoined.session_id, first_session.session_id);
    assert_eq!(rejoined.user_id, "x");

    let synced = wait_for_event(&mut events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    assert_eq!(synced, ClientEvent::Synced { room_id: "R1".into() });
    assert_eq!(x.state().await, ConnectionState::Connected);
    assert_eq!(x.session().await.unwrap().session_id, rejoined.session_id);
    x.close().await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_emits_disconnected_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    // One connection, then the listener goes away and every retry is refused.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(listener);
        sleep(Duration::from_millis(50)).await;
        drop(ws);
    });

    let (x, mut events) = client("x");
    x.connect(&url, Some("R1")).await.unwrap();

    wait_for_event(&mut events, |e| *e == ClientEvent::Disconnected).await;
    assert_eq!(x.state().await, ConnectionState::Disconnected);
    assert!(!x.submit_change(LocalChange::CreateFeature(point("f2", "x", 1))).await);

    sleep(Duration::from_millis(300)).await;
    let mut late = Vec::new();
    while let Ok(event) = events.try_recv() {
        late.push(event);
    }
    assert!(
        !late.contains(&ClientEvent::Disconnected),
        "Disconnected must be emitted once, got {late:?}"
    );
    assert!(!late.contains(&ClientEvent::StateChanged(ConnectionState::Connecting)));
}

#[tokio::test]
async fn test_connect_again_after_failed_connect() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let (x, mut events) = client("x");
    assert!(x.connect("ws://127.0.0.1:1", Some("R1")).await.is_err());
    assert_eq!(x.state().await, ConnectionState::Disconnected);

    x.connect(&url, Some("R1")).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    assert_eq!(x.state().await, ConnectionState::Connected);
    x.close().await;
}
