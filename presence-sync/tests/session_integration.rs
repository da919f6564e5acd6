//! End-to-end tests: a real relay on a free port and real session clients.

use presence_sync::{
    ClientId, ConnectionState, FollowEvent, LeaveReason, LocalIdentity, PresenceEvent,
    PresenceServer, Position, ServerConfig, SessionClient, SessionConfig, SessionEvent,
};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, timeout, Duration, Instant};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn relay_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    }
}

/// Start a relay on `port`.
async fn start_relay_on(port: u16) {
    let server = PresenceServer::new(relay_config(port));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    sleep(Duration::from_millis(50)).await;
}

async fn start_relay() -> u16 {
    let port = free_port().await;
    start_relay_on(port).await;
    port
}

/// A relay on its own runtime. Stopping it drops every open connection
/// at once, the way a crashed relay process would.
struct Relay {
    stop: oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl Relay {
    async fn start(port: u16) -> Self {
        let (stop, stopped) = oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let server = PresenceServer::new(relay_config(port));
                tokio::select! {
                    result = server.run() => result.unwrap(),
                    _ = stopped => {}
                }
            });
        });
        sleep(Duration::from_millis(50)).await;
        Self { stop, thread }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        let thread = self.thread;
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .unwrap()
            .unwrap();
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        backoff_base: Duration::from_millis(50),
        backoff_cap: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if matches(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("event stream ended: {e}"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Connect a client and wait until its first snapshot is applied.
async fn join(
    port: u16,
    session: &str,
    name: &str,
) -> (SessionClient, broadcast::Receiver<SessionEvent>) {
    join_as(port, session, LocalIdentity::new(format!("user-{name}"), name)).await
}

async fn join_as(
    port: u16,
    session: &str,
    identity: LocalIdentity,
) -> (SessionClient, broadcast::Receiver<SessionEvent>) {
    let client =
        SessionClient::connect(fast_config(), identity, &format!("ws://127.0.0.1:{port}"), session)
            .unwrap();
    let mut events = client.subscribe();
    wait_for(&mut events, |e| *e == SessionEvent::Reconciled).await;
    (client, events)
}

#[tokio::test]
async fn test_join_and_leave_end_to_end() {
    let port = start_relay().await;
    let (alice, mut alice_events) = join(port, "doc-1", "Alice").await;
    assert_eq!(alice.connection_state(), ConnectionState::Open);
    assert!(alice.list_active().await.unwrap().is_empty());

    let (mut bob, _bob_events) = join(port, "doc-1", "Bob").await;
    let bob_id = bob.client_id().clone();

    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == bob_id)
    })
    .await;
    let active = alice.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].display_name, "Bob");

    // Bob already saw Alice in his snapshot.
    let seen_by_bob = bob.list_active().await.unwrap();
    assert_eq!(&seen_by_bob[0].client_id, alice.client_id());

    bob.close().await;
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::Presence(PresenceEvent::Left {
            client_id: bob_id.clone(),
            reason: LeaveReason::Leave,
        })
    })
    .await;
    assert!(alice.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cursor_relay_and_follow() {
    let port = start_relay().await;
    let (alice, mut alice_events) = join(port, "doc-2", "Alice").await;
    let (bob, _bob_events) = join(port, "doc-2", "Bob").await;
    let bob_id = bob.client_id().clone();

    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == bob_id)
    })
    .await;
    assert!(alice.follow(&bob_id).await.unwrap());
    assert_eq!(alice.follow_target().await.unwrap(), Some(bob_id.clone()));

    bob.report_local("src/lib.rs", Position::new(42, 7), None).unwrap();

    let event = wait_for(&mut alice_events, |e| matches!(e, SessionEvent::Navigate(_))).await;
    let SessionEvent::Navigate(intent) = event else {
        unreachable!()
    };
    assert_eq!(intent.target, bob_id);
    assert_eq!(intent.document_id, "src/lib.rs");
    assert_eq!(intent.position, Position::new(42, 7));

    let cursor = alice.latest_cursor(&bob_id).await.unwrap().unwrap();
    assert_eq!(cursor.position, Position::new(42, 7));

    // Moving the local cursor ends follow mode.
    alice.report_local("src/main.rs", Position::new(1, 0), None).unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SessionEvent::Follow(FollowEvent::Stopped { .. })))
        .await;
    assert_eq!(alice.follow_target().await.unwrap(), None);
}

#[tokio::test]
async fn test_follow_cleared_when_target_leaves() {
    let port = start_relay().await;
    let (alice, mut alice_events) = join(port, "doc-3", "Alice").await;
    let (mut bob, _bob_events) = join(port, "doc-3", "Bob").await;
    let bob_id = bob.client_id().clone();

    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == bob_id)
    })
    .await;
    assert!(alice.follow(&bob_id).await.unwrap());

    bob.close().await;
    wait_for(&mut alice_events, |e| matches!(e, SessionEvent::Follow(FollowEvent::Stopped { .. })))
        .await;
    assert_eq!(alice.follow_target().await.unwrap(), None);
}

#[tokio::test]
async fn test_snapshot_carries_existing_cursor() {
    let port = start_relay().await;
    let (alice, _alice_events) = join(port, "doc-4", "Alice").await;
    alice.report_local("README.md", Position::new(3, 1), None).unwrap();
    sleep(Duration::from_millis(150)).await;

    let (bob, _bob_events) = join(port, "doc-4", "Bob").await;
    let cursor = bob.latest_cursor(alice.client_id()).await.unwrap().unwrap();
    assert_eq!(cursor.document_id, "README.md");
    assert_eq!(cursor.position, Position::new(3, 1));
}

#[tokio::test]
async fn test_chat_order_identical_on_all_clients() {
    let port = start_relay().await;
    let (alice, mut alice_events) = join(port, "doc-5", "Alice").await;
    let (bob, _bob_events) = join(port, "doc-5", "Bob").await;
    let bob_id = bob.client_id().clone();
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == bob_id)
    })
    .await;

    for i in 0..3 {
        alice.send_chat(format!("alice {i}")).await.unwrap().unwrap();
        bob.send_chat(format!("bob {i}")).await.unwrap().unwrap();
    }
    assert!(alice.send_chat("  ").await.unwrap().is_none());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let a = alice.history().await.unwrap();
        let b = bob.history().await.unwrap();
        if a.len() == 6 && a == b {
            let mut sorted = a.clone();
            sorted.sort_by(|x, y| x.order_key().cmp(&y.order_key()));
            assert_eq!(sorted, a);
            break;
        }
        assert!(Instant::now() < deadline, "histories never converged: {a:?} vs {b:?}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_offline_chat_delivered_after_connect() {
    let port = free_port().await;
    let identity = LocalIdentity::new("user-carol", "Carol");
    let carol = SessionClient::connect(
        fast_config(),
        identity,
        &format!("ws://127.0.0.1:{port}"),
        "doc-6",
    )
    .unwrap();
    let mut carol_events = carol.subscribe();

    let queued = carol.send_chat("written offline").await.unwrap().unwrap();
    assert_ne!(carol.connection_state(), ConnectionState::Open);

    start_relay_on(port).await;

    // The server echo is the acknowledgement: it restamps our copy.
    let event = wait_for(&mut carol_events, |e| matches!(e, SessionEvent::ChatRestamped(_))).await;
    let SessionEvent::ChatRestamped(acked) = event else {
        unreachable!()
    };
    assert_eq!(acked.id, queued.id);
    assert!(acked.sent_at >= queued.sent_at);

    let history = carol.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, queued.id);
}

#[tokio::test]
async fn test_sessions_do_not_leak_presence() {
    let port = start_relay().await;
    let (alice, _a) = join(port, "doc-7a", "Alice").await;
    let (_bob, _b) = join(port, "doc-7b", "Bob").await;

    sleep(Duration::from_millis(100)).await;
    assert!(alice.list_active().await.unwrap().is_empty());
    assert!(!alice
        .follow(&ClientId::from("anyone"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_connection_blip_keeps_collaborator_in_place() {
    let port = start_relay().await;
    let (alice, mut alice_events) = join(port, "doc-8", "Alice").await;
    let bob_identity = LocalIdentity::new("user-Bob", "Bob");
    let bob_id = bob_identity.client_id.clone();
    let (bob, _bob_events) = join_as(port, "doc-8", bob_identity.clone()).await;
    let (carol, _carol_events) = join(port, "doc-8", "Carol").await;
    let carol_id = carol.client_id().clone();

    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == bob_id)
    })
    .await;
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == carol_id)
    })
    .await;

    // Bob's socket dies without a leave and the same tab comes straight back.
    drop(bob);
    sleep(Duration::from_millis(100)).await;
    let (_bob_again, _) = join_as(port, "doc-8", bob_identity).await;
    sleep(Duration::from_millis(200)).await;

    while let Ok(event) = alice_events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::Presence(PresenceEvent::Left { .. })),
            "collaborator flickered out: {event:?}"
        );
    }
    let order: Vec<ClientId> = alice
        .list_active()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.client_id)
        .collect();
    assert_eq!(order, vec![bob_id, carol_id]);
}

#[tokio::test]
async fn test_relay_restart_reconciles_and_retransmits_chat() {
    let port = free_port().await;
    let relay = Relay::start(port).await;

    let (alice, mut alice_events) = join(port, "doc-9", "Alice").await;
    let (bob, _bob_events) = join(port, "doc-9", "Bob").await;
    let (mut carol, _carol_events) = join(port, "doc-9", "Carol").await;
    let bob_id = bob.client_id().clone();
    let carol_id = carol.client_id().clone();
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == bob_id)
    })
    .await;
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Presence(PresenceEvent::Joined(c)) if c.client_id == carol_id)
    })
    .await;

    let message = alice.send_chat("right before the drop").await.unwrap().unwrap();
    relay.stop().await;

    // Carol quits while the relay is down, so nobody hears her leave.
    carol.close().await;
    wait_for(&mut alice_events, |e| {
        *e == SessionEvent::Connection(ConnectionState::Reconnecting)
    })
    .await;

    let _relay = Relay::start(port).await;
    wait_for(&mut alice_events, |e| *e == SessionEvent::Connection(ConnectionState::Open)).await;

    // The snapshot is the only way Alice learns Carol is gone.
    let mut carol_reconciled_away = false;
    loop {
        match wait_for(&mut alice_events, |_| true).await {
            SessionEvent::Presence(PresenceEvent::Left {
                client_id,
                reason: LeaveReason::Reconciled,
            }) if client_id == carol_id => carol_reconciled_away = true,
            SessionEvent::Reconciled => break,
            _ => {}
        }
    }
    assert!(carol_reconciled_away);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let active: Vec<ClientId> = alice
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.client_id)
            .collect();
        let a = alice.history().await.unwrap();
        let b = bob.history().await.unwrap();
        if active == vec![bob_id.clone()] && b.iter().any(|m| m.id == message.id) {
            assert_eq!(a.iter().filter(|m| m.id == message.id).count(), 1);
            assert_eq!(b.iter().filter(|m| m.id == message.id).count(), 1);
            break;
        }
        assert!(
            Instant::now() < deadline,
            "never converged after restart: active={active:?} bob_history={b:?}"
        );
        sleep(Duration::from_millis(20)).await;
    }
}
