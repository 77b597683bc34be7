//! Integration tests for the presence broadcaster.
//!
//! A [`MockConnector`] plays the server; the broadcaster is driven the way
//! an editor would drive it.

mod common;

use std::sync::Arc;
use std::time::Duration;

use codepad_collab::protocol::{self, Payload, Position, Range, TextChange};
use codepad_collab::{
    CollabConfig, CollabService, CollabStatus, ConnectionState, CursorColor, PresenceBroadcaster,
    PresenceConfig, ReconnectPolicy, TransportEvent,
};
use common::{deliver, MockConnector};
use parking_lot::Mutex;
use serde_json::Value;

fn service(connector: &MockConnector) -> CollabService {
    let config = CollabConfig::new("ws://collab.test")
        .with_local_user_id("me")
        .with_reconnect(ReconnectPolicy::fixed(Duration::from_secs(1)));
    CollabService::with_connector(config, connector.clone())
}

async fn open(service: &CollabService, file_id: &str) {
    service.connect(file_id);
    service
        .watch_state()
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn change(text: &str) -> TextChange {
    TextChange {
        range: Range::new(Position::new(1, 1), Position::new(1, 1)),
        text: text.into(),
    }
}

// ─── Remote presence ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_remote_frames_update_collaborators() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();
    open(&service, "doc1").await;
    let peer = connector.take_peer();

    deliver(
        &peer,
        r#"{"type":"cursor","userId":"u2","payload":{"position":{"lineNumber":4,"column":10}}}"#,
    )
    .await;
    let selection = Range::new(Position::new(2, 1), Position::new(5, 3));
    let frame = protocol::encode("u3", &Payload::selection(selection)).unwrap();
    deliver(&peer, &frame).await;
    settle().await;

    let peers = presence.remote_collaborators();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0].user_id, "u2");
    assert_eq!(peers[0].cursor, Some(Position::new(4, 10)));
    assert_eq!(peers[0].color, CursorColor::from_user_id("u2"));
    assert_eq!(peers[1].user_id, "u3");
    assert_eq!(peers[1].selection, Some(selection));
    assert!(peers[1].cursor.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_own_echo_not_tracked() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();
    open(&service, "doc1").await;
    let peer = connector.take_peer();

    let frame = protocol::encode("me", &Payload::cursor(Position::new(1, 1))).unwrap();
    deliver(&peer, &frame).await;
    settle().await;

    assert!(presence.remote_collaborators().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_prune_idle_collaborators() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let config = PresenceConfig {
        idle_timeout: Duration::from_secs(30),
        ..PresenceConfig::default()
    };
    let presence = PresenceBroadcaster::attach(service.clone(), config).await.unwrap();
    open(&service, "doc1").await;
    let peer = connector.take_peer();

    let frame = protocol::encode("u2", &Payload::cursor(Position::new(1, 1))).unwrap();
    deliver(&peer, &frame).await;
    settle().await;
    assert!(presence.prune_idle().is_empty());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(presence.prune_idle(), vec!["u2".to_string()]);
    assert!(presence.remote_collaborator("u2").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_collaborators_reset_on_session_change() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let mut presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();
    open(&service, "doc1").await;
    let first = connector.take_peer();

    let frame = protocol::encode("u2", &Payload::cursor(Position::new(4, 10))).unwrap();
    deliver(&first, &frame).await;
    settle().await;
    assert_eq!(presence.remote_collaborators().len(), 1);

    // A caret held back in doc1 must not leak into doc2.
    assert!(presence.cursor_moved(Position::new(1, 1)));
    assert!(!presence.cursor_moved(Position::new(1, 2)));
    assert!(presence.has_pending_cursor());

    service.connect("doc2");
    settle().await;
    assert_eq!(service.state(), ConnectionState::Open);
    assert!(presence.remote_collaborators().is_empty());
    assert!(presence.remote_collaborator("u2").is_none());
    assert!(!presence.flush_cursor());

    let second = connector.take_peer();
    let frame = protocol::encode("u3", &Payload::cursor(Position::new(2, 2))).unwrap();
    deliver(&second, &frame).await;
    settle().await;
    let ids: Vec<String> = presence
        .remote_collaborators()
        .into_iter()
        .map(|p| p.user_id)
        .collect();
    assert_eq!(ids, vec!["u3".to_string()]);

    service.disconnect();
    service
        .watch_status()
        .wait_for(|s| *s == CollabStatus::Idle)
        .await
        .unwrap();
    assert!(presence.remote_collaborators().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_collaborators_kept_across_reconnect() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();
    open(&service, "doc1").await;
    let first = connector.take_peer();

    let frame = protocol::encode("u2", &Payload::cursor(Position::new(4, 10))).unwrap();
    deliver(&first, &frame).await;
    settle().await;

    first
        .inbound
        .send(TransportEvent::Closed { reason: None })
        .await
        .unwrap();
    service
        .watch_state()
        .wait_for(|s| *s == ConnectionState::Closed)
        .await
        .unwrap();
    service
        .watch_state()
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .unwrap();

    assert_eq!(
        presence.remote_collaborator("u2").and_then(|p| p.cursor),
        Some(Position::new(4, 10))
    );
}

// ─── Local events ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cursor_moves_are_throttled() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let mut presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();
    open(&service, "doc1").await;
    let mut peer = connector.take_peer();

    assert!(presence.cursor_moved(Position::new(1, 1)));
    assert!(!presence.cursor_moved(Position::new(1, 2)));
    assert!(!presence.cursor_moved(Position::new(1, 3)));
    assert!(presence.has_pending_cursor());

    // The held position is the latest one.
    assert!(presence.flush_cursor());
    assert!(!presence.has_pending_cursor());
    assert!(!presence.flush_cursor());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(presence.cursor_moved(Position::new(9, 9)));

    let mut columns = Vec::new();
    for _ in 0..3 {
        let frame: Value = serde_json::from_str(&peer.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "cursor");
        assert_eq!(frame["userId"], "me");
        columns.push(frame["payload"]["position"]["column"].as_u64().unwrap());
    }
    assert_eq!(columns, vec![1, 3, 9]);
}

#[tokio::test(start_paused = true)]
async fn test_local_events_dropped_while_closed() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let mut presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();

    assert!(!presence.cursor_moved(Position::new(1, 1)));
    assert!(!presence.selection_changed(Range::new(Position::new(1, 1), Position::new(1, 2))));
    assert!(!presence.edits_applied(vec![change("a")]));
    assert_eq!(service.stats().sends_dropped, 3);
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_edits_round_trip() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let mut presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();

    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = applied.clone();
    presence
        .on_remote_edit(move |sender: &str, changes: &[TextChange]| {
            sink.lock().push((sender.to_owned(), changes.to_vec()));
        })
        .await
        .unwrap();

    open(&service, "doc1").await;
    let mut peer = connector.take_peer();

    let remote = vec![change("x"), change("y")];
    let frame = protocol::encode("u2", &Payload::edit(remote.clone())).unwrap();
    deliver(&peer, &frame).await;
    settle().await;
    assert_eq!(*applied.lock(), vec![("u2".to_string(), remote)]);

    assert!(!presence.edits_applied(Vec::new()));
    assert!(presence.edits_applied(vec![change("z")]));
    let sent: Value = serde_json::from_str(&peer.outbound.recv().await.unwrap()).unwrap();
    assert_eq!(sent["type"], "edit");
    assert_eq!(sent["payload"]["changes"][0]["text"], "z");
}

#[tokio::test(start_paused = true)]
async fn test_detach_removes_subscriptions() {
    let connector = MockConnector::new();
    let service = service(&connector);
    let mut presence = PresenceBroadcaster::attach(service.clone(), PresenceConfig::default())
        .await
        .unwrap();

    let applied = Arc::new(Mutex::new(0usize));
    let sink = applied.clone();
    presence
        .on_remote_edit(move |_: &str, _: &[TextChange]| *sink.lock() += 1)
        .await
        .unwrap();

    open(&service, "doc1").await;
    let peer = connector.take_peer();
    let frame = protocol::encode("u2", &Payload::edit(vec![change("a")])).unwrap();

    deliver(&peer, &frame).await;
    settle().await;
    presence.detach();
    deliver(&peer, &frame).await;
    settle().await;

    assert_eq!(*applied.lock(), 1);
    assert_eq!(service.state(), ConnectionState::Open);
}
