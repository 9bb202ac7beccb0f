//! Integration tests for live pointer presence.
//!
//! These tests start a real server and connect two clients, verifying
//! cursor relay, removal on pointer release and removal on disconnect
//! through the full network stack.

use std::time::Instant;

use scribble_collab::client::{SyncClient, SyncEvent};
use scribble_collab::presence::CursorThrottle;
use scribble_collab::protocol::{Brush, CursorSample};
use scribble_collab::reconcile::Reconciler;
use scribble_collab::server::{ServerConfig, SyncServer};
use scribble_collab::stroke::Vec2;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        presence_ttl: Duration::from_millis(1500),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Connect a client, returning it once it has been welcomed and synced.
async fn connect_client(url: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>, Uuid) {
    let mut client = SyncClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let session_id = match wait_for(&mut events, |e| matches!(e, SyncEvent::Welcome { .. })).await {
        SyncEvent::Welcome { session_id, .. } => session_id,
        _ => unreachable!(),
    };
    wait_for(&mut events, |e| matches!(e, SyncEvent::Snapshot(_))).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Snapshot(_))).await;
    (client, events, session_id)
}

fn pen(color: &str) -> Brush {
    Brush {
        color: color.into(),
        size: 12.0,
        is_eraser: false,
    }
}

#[tokio::test]
async fn test_welcome_carries_configured_ttl() {
    let url = start_test_server().await;
    let mut client = SyncClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match wait_for(&mut events, |e| matches!(e, SyncEvent::Welcome { .. })).await {
        SyncEvent::Welcome { info, .. } => assert_eq!(info.presence_ttl_ms, 1500),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_cursor_relayed_with_session_tag() {
    let url = start_test_server().await;
    let (alice, _alice_events, alice_id) = connect_client(&url).await;
    let (_bob, mut bob_events, _) = connect_client(&url).await;

    let sample = CursorSample {
        position: Vec2::new(120.5, -40.0),
        brush: pen("#00ff00"),
    };
    alice.send_cursor(&sample).await.unwrap();

    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteCursor { .. })).await {
        SyncEvent::RemoteCursor { session_id, sample: received } => {
            assert_eq!(session_id, alice_id);
            assert_eq!(received, sample);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_sender_does_not_see_own_cursor() {
    let url = start_test_server().await;
    let (alice, mut alice_events, _) = connect_client(&url).await;
    let (_bob, _bob_events, _) = connect_client(&url).await;

    let sample = CursorSample {
        position: Vec2::ZERO,
        brush: Brush::default(),
    };
    alice.send_cursor(&sample).await.unwrap();
    alice.send_ping().await.unwrap();

    let event = wait_for(&mut alice_events, |e| {
        matches!(e, SyncEvent::Pong | SyncEvent::RemoteCursor { .. })
    })
    .await;
    assert_eq!(event, SyncEvent::Pong);

    let late = timeout(Duration::from_millis(200), async {
        loop {
            match alice_events.recv().await {
                Some(SyncEvent::RemoteCursor { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(!matches!(late, Ok(true)));
}

#[tokio::test]
async fn test_cursor_remove_on_release() {
    let url = start_test_server().await;
    let (alice, _alice_events, alice_id) = connect_client(&url).await;
    let (_bob, mut bob_events, _) = connect_client(&url).await;

    alice.send_cursor_remove().await.unwrap();

    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::CursorRemoved(_))).await;
    assert_eq!(event, SyncEvent::CursorRemoved(alice_id));
}

#[tokio::test]
async fn test_cursor_remove_on_disconnect() {
    let url = start_test_server().await;
    let (mut alice, _alice_events, alice_id) = connect_client(&url).await;
    let (_bob, mut bob_events, _) = connect_client(&url).await;

    alice.disconnect().await;

    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::CursorRemoved(_))).await;
    assert_eq!(event, SyncEvent::CursorRemoved(alice_id));
}

#[tokio::test]
async fn test_reconciler_tracks_remote_pointer() {
    let url = start_test_server().await;
    let (mut alice, _alice_events, _) = connect_client(&url).await;
    let (_bob, mut bob_events, bob_id) = connect_client(&url).await;

    let mut bob_view = Reconciler::new();
    bob_view.handle_event(SyncEvent::Welcome {
        session_id: bob_id,
        info: Default::default(),
    });

    let mut throttle = CursorThrottle::default();
    let now = Instant::now();
    let sample = throttle.sample(Vec2::new(5.0, 5.0), &pen("#0000ff"), now).unwrap();
    assert!(throttle.sample(Vec2::new(6.0, 6.0), &pen("#0000ff"), now).is_none());
    alice.send_cursor(&sample).await.unwrap();

    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::RemoteCursor { .. })).await;
    bob_view.handle_event(event);
    let live = bob_view.presence().live();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].position, Vec2::new(5.0, 5.0));
    assert_eq!(live[0].brush.color, "#0000ff");

    alice.disconnect().await;
    let event = wait_for(&mut bob_events, |e| matches!(e, SyncEvent::CursorRemoved(_))).await;
    bob_view.handle_event(event);
    assert!(bob_view.presence().is_empty());
}

#[tokio::test]
async fn test_presence_never_touches_strokes() {
    let url = start_test_server().await;
    let (alice, _alice_events, _) = connect_client(&url).await;
    let (bob, mut bob_events, _) = connect_client(&url).await;

    for i in 0..10 {
        let sample = CursorSample {
            position: Vec2::new(i as f32, 0.0),
            brush: Brush::default(),
        };
        alice.send_cursor(&sample).await.unwrap();
    }
    alice.send_cursor_remove().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::CursorRemoved(_))).await;

    bob.request_full().await.unwrap();
    match wait_for(&mut bob_events, |e| matches!(e, SyncEvent::Snapshot(_))).await {
        SyncEvent::Snapshot(strokes) => assert!(strokes.is_empty()),
        _ => unreachable!(),
    }
}
