use super::*;
use crate::services::connection::CloseReason;
use crate::services::registry::Member;
use serde_json::json;
use tokio::sync::mpsc;

const ROOM: &str = "board-1";

struct Peer {
    handle: Arc<ConnectionHandle>,
    rx: mpsc::Receiver<CollaborationMessage>,
    _close_rx: mpsc::Receiver<CloseReason>,
}

async fn peer(registry: &SessionRegistry, user_id: &str) -> Peer {
    let (tx, rx) = mpsc::channel(32);
    let (close_tx, close_rx) = mpsc::channel(1);
    let member = Member::new(
        ConnectionHandle { id: ConnectionId::new(), user_id: user_id.into(), username: format!("{user_id}-name") },
        tx,
        close_tx,
    );
    let handle = Arc::clone(&member.handle);
    registry.register(member);
    registry.join(handle.id, ROOM).await.unwrap();
    Peer { handle, rx, _close_rx: close_rx }
}

async fn setup(typing_ttl_ms: u64, cursor_ttl_ms: u64) -> (EphemeralRouter, Peer, Peer) {
    let registry = SessionRegistry::new();
    let alice = peer(&registry, "alice").await;
    let bob = peer(&registry, "bob").await;
    let router = EphemeralRouter::new(
        registry,
        Duration::from_millis(typing_ttl_ms),
        Duration::from_millis(cursor_ttl_ms),
    );
    (router, alice, bob)
}

fn cursor(task_id: &str, x: f64, y: f64) -> CursorPayload {
    CursorPayload { task_id: task_id.into(), x, y, element: None }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

#[tokio::test]
async fn typing_is_forwarded_to_others_only() {
    let (router, mut alice, mut bob) = setup(3_000, 5_000).await;

    let report = router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    assert_eq!(report.delivered, 1);

    let msg = bob.rx.try_recv().unwrap();
    assert_eq!(msg.kind, MessageType::UserTyping);
    assert_eq!(msg.user_id, "alice");
    assert_eq!(msg.room.as_deref(), Some(ROOM));
    assert_eq!(msg.data.get("task_id"), Some(&json!("t1")));
    assert_eq!(msg.data.get("is_typing"), Some(&json!(true)));
    assert!(msg.data.get("expired").is_none());
    assert!(alice.rx.try_recv().is_err());
}

#[tokio::test]
async fn typing_expires_once_with_implicit_clear() {
    let (router, alice, mut bob) = setup(3_000, 5_000).await;
    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    bob.rx.try_recv().unwrap();

    assert_eq!(router.expire_due(far_future()).await, 1);
    let clear = bob.rx.try_recv().unwrap();
    assert_eq!(clear.kind, MessageType::UserTyping);
    assert_eq!(clear.data.get("is_typing"), Some(&json!(false)));
    assert_eq!(clear.data.get("expired"), Some(&json!(true)));
    assert_eq!(clear.data.get("task_id"), Some(&json!("t1")));

    assert_eq!(router.expire_due(far_future()).await, 0);
    assert!(bob.rx.try_recv().is_err());
    assert_eq!(router.active_signals(), 0);
}

#[tokio::test]
async fn typing_renewal_pushes_deadline_back() {
    let (router, alice, _bob) = setup(200, 5_000).await;
    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    let first = router.next_deadline().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    let second = router.next_deadline().unwrap();
    assert!(second > first);

    assert_eq!(router.expire_due(first).await, 0);
    assert_eq!(router.expire_due(second).await, 1);
}

#[tokio::test]
async fn explicit_stop_cancels_expiry() {
    let (router, alice, mut bob) = setup(3_000, 5_000).await;
    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    router
        .publish_typing(&alice.handle, ROOM, "t1", false)
        .await;

    assert_eq!(bob.rx.try_recv().unwrap().data.get("is_typing"), Some(&json!(true)));
    assert_eq!(bob.rx.try_recv().unwrap().data.get("is_typing"), Some(&json!(false)));
    assert_eq!(router.active_signals(), 0);
    assert_eq!(router.next_deadline(), None);
    assert_eq!(router.expire_due(far_future()).await, 0);
}

#[tokio::test]
async fn switching_task_clears_previous_indicator_first() {
    let (router, alice, mut bob) = setup(3_000, 5_000).await;
    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    router
        .publish_typing(&alice.handle, ROOM, "t2", true)
        .await;

    bob.rx.try_recv().unwrap();
    let clear = bob.rx.try_recv().unwrap();
    assert_eq!(clear.data.get("task_id"), Some(&json!("t1")));
    assert_eq!(clear.data.get("is_typing"), Some(&json!(false)));
    let start = bob.rx.try_recv().unwrap();
    assert_eq!(start.data.get("task_id"), Some(&json!("t2")));
    assert_eq!(start.data.get("is_typing"), Some(&json!(true)));
    assert_eq!(router.active_signals(), 1);
}

#[tokio::test]
async fn cursor_keeps_latest_position_per_connection() {
    let (router, alice, mut bob) = setup(3_000, 5_000).await;
    router
        .publish_cursor(&alice.handle, ROOM, cursor("t1", 1.0, 2.0))
        .await;
    router
        .publish_cursor(&alice.handle, ROOM, cursor("t1", 10.0, 20.0))
        .await;

    let first = bob.rx.try_recv().unwrap();
    assert_eq!(first.kind, MessageType::CursorPosition);
    assert_eq!(first.data.get("visible"), Some(&json!(true)));
    assert_eq!(first.data.get("x"), Some(&json!(1.0)));

    let cursors = router.cursors_in(ROOM);
    assert_eq!(cursors.len(), 1);
    assert_eq!(cursors[0].user_id, "alice");
    assert!((cursors[0].x - 10.0).abs() < f64::EPSILON);
    assert!(router.cursors_in("other-room").is_empty());
}

#[tokio::test]
async fn cursor_expiry_hides_cursor() {
    let (router, alice, mut bob) = setup(3_000, 5_000).await;
    router
        .publish_cursor(&alice.handle, ROOM, cursor("t1", 1.0, 2.0))
        .await;
    bob.rx.try_recv().unwrap();

    assert_eq!(router.expire_due(far_future()).await, 1);
    let clear = bob.rx.try_recv().unwrap();
    assert_eq!(clear.kind, MessageType::CursorPosition);
    assert_eq!(clear.data.get("visible"), Some(&json!(false)));
    assert_eq!(clear.data.get("expired"), Some(&json!(true)));
    assert!(router.cursors_in(ROOM).is_empty());
}

#[tokio::test]
async fn connections_of_same_user_are_independent() {
    let registry = SessionRegistry::new();
    let tab1 = peer(&registry, "alice").await;
    let tab2 = peer(&registry, "alice").await;
    let router = EphemeralRouter::new(registry, Duration::from_secs(3), Duration::from_secs(5));

    router
        .publish_cursor(&tab1.handle, ROOM, cursor("t1", 1.0, 1.0))
        .await;
    router
        .publish_cursor(&tab2.handle, ROOM, cursor("t2", 2.0, 2.0))
        .await;
    assert_eq!(router.cursors_in(ROOM).len(), 2);
}

#[tokio::test]
async fn forget_clears_signals_and_notifies_room() {
    let (router, alice, mut bob) = setup(3_000, 5_000).await;
    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    router
        .publish_cursor(&alice.handle, ROOM, cursor("t1", 1.0, 2.0))
        .await;
    bob.rx.try_recv().unwrap();
    bob.rx.try_recv().unwrap();

    router.forget(alice.handle.id, ROOM).await;
    assert_eq!(router.active_signals(), 0);

    let typing_clear = bob.rx.try_recv().unwrap();
    assert_eq!(typing_clear.kind, MessageType::UserTyping);
    assert_eq!(typing_clear.data.get("is_typing"), Some(&json!(false)));
    assert!(typing_clear.data.get("expired").is_none());
    let cursor_clear = bob.rx.try_recv().unwrap();
    assert_eq!(cursor_clear.data.get("visible"), Some(&json!(false)));

    assert_eq!(router.expire_due(far_future()).await, 0);
}

#[tokio::test]
async fn expiry_worker_broadcasts_after_ttl() {
    let (router, alice, mut bob) = setup(50, 5_000).await;
    let worker = spawn_expiry_task(router.clone());

    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    let start = bob.rx.recv().await.unwrap();
    assert_eq!(start.data.get("is_typing"), Some(&json!(true)));

    let clear = tokio::time::timeout(Duration::from_secs(2), bob.rx.recv())
        .await
        .expect("expiry broadcast")
        .unwrap();
    assert_eq!(clear.data.get("is_typing"), Some(&json!(false)));
    assert_eq!(clear.data.get("expired"), Some(&json!(true)));
    assert_eq!(router.active_signals(), 0);

    worker.abort();
}

#[tokio::test]
async fn rooms_keep_separate_signal_shards() {
    let (router, alice, mut bob) = setup(3_000, 5_000).await;
    router.registry.join(alice.handle.id, "board-2").await.unwrap();

    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    router
        .publish_cursor(&alice.handle, "board-2", cursor("t2", 3.0, 4.0))
        .await;
    assert_eq!(router.room_shards(), 2);
    assert_eq!(router.active_signals(), 2);
    assert!(router.cursors_in(ROOM).is_empty());
    assert_eq!(router.cursors_in("board-2").len(), 1);

    router.forget(alice.handle.id, "board-2").await;
    assert_eq!(router.room_shards(), 1);
    router
        .publish_typing(&alice.handle, ROOM, "t1", false)
        .await;
    assert_eq!(router.room_shards(), 0);
    assert_eq!(router.active_signals(), 0);

    let seen: Vec<CollaborationMessage> = std::iter::from_fn(|| bob.rx.try_recv().ok()).collect();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|m| m.room.as_deref() == Some(ROOM)));
}

#[tokio::test]
async fn expiry_sweeps_every_room() {
    let (router, alice, _bob) = setup(3_000, 5_000).await;
    router.registry.join(alice.handle.id, "board-2").await.unwrap();
    router
        .publish_typing(&alice.handle, ROOM, "t1", true)
        .await;
    router
        .publish_typing(&alice.handle, "board-2", "t2", true)
        .await;

    let next = router.next_deadline().unwrap();
    assert!(next <= Instant::now() + Duration::from_millis(3_000));
    assert_eq!(router.expire_due(far_future()).await, 2);
    assert_eq!(router.room_shards(), 0);
    assert_eq!(router.next_deadline(), None);
}
