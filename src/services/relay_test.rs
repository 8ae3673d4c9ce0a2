use super::*;
use crate::services::connection::CloseReason;
use crate::services::registry::{ConnectionHandle, Member};
use serde_json::json;
use tokio::sync::mpsc;

struct Viewer {
    id: ConnectionId,
    rx: mpsc::Receiver<CollaborationMessage>,
    _close_rx: mpsc::Receiver<CloseReason>,
}

async fn viewer(registry: &SessionRegistry, room: &str, capacity: usize) -> Viewer {
    let (tx, rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = mpsc::channel(1);
    let handle = ConnectionHandle { id: ConnectionId::new(), user_id: "viewer".into(), username: "Viewer".into() };
    let id = handle.id;
    registry.register(Member::new(handle, tx, close_tx));
    registry.join(id, room).await.unwrap();
    Viewer { id, rx, _close_rx: close_rx }
}

fn task(id: &str) -> Data {
    let mut data = Data::new();
    data.insert("id".into(), json!(id));
    data
}

#[tokio::test]
async fn announce_reaches_each_member_exactly_once() {
    let registry = SessionRegistry::new();
    let relay = DurableRelay::new(registry.clone());
    let mut a = viewer(&registry, "board-7", 8).await;
    let mut b = viewer(&registry, "board-7", 8).await;
    let mut other = viewer(&registry, "board-3", 8).await;

    let result = relay
        .announce("board-7", MessageType::TaskDeleted, task("t1"), &Actor::system())
        .await
        .unwrap();
    assert_eq!(result.seq, 1);
    assert_eq!(result.delivered, 2);
    assert_eq!(result.failed, 0);

    for v in [&mut a, &mut b] {
        let msg = v.rx.try_recv().unwrap();
        assert_eq!(msg.kind, MessageType::TaskDeleted);
        assert_eq!(msg.room.as_deref(), Some("board-7"));
        assert_eq!(msg.user_id, SYSTEM_USER_ID);
        assert_eq!(msg.data.get("id"), Some(&json!("t1")));
        assert_eq!(msg.data.get("seq"), Some(&json!(1)));
        assert!(v.rx.try_recv().is_err());
    }
    assert!(other.rx.try_recv().is_err());
}

#[tokio::test]
async fn announce_rejects_non_durable_types() {
    let registry = SessionRegistry::new();
    let relay = DurableRelay::new(registry.clone());
    let mut v = viewer(&registry, "board-7", 8).await;

    let err = relay
        .announce("board-7", MessageType::UserTyping, Data::new(), &Actor::system())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_DURABLE");
    assert!(v.rx.try_recv().is_err());
    assert_eq!(relay.current_seq("board-7").await, 0);
}

#[tokio::test]
async fn announces_keep_call_order_and_sequence() {
    let registry = SessionRegistry::new();
    let relay = DurableRelay::new(registry.clone());
    let mut v = viewer(&registry, "board-7", 64).await;

    for i in 0..20 {
        relay
            .announce("board-7", MessageType::TaskUpdated, task(&format!("t{i}")), &Actor::new("u1", "Alice"))
            .await
            .unwrap();
    }

    for i in 0..20u64 {
        let msg = v.rx.try_recv().unwrap();
        assert_eq!(msg.data.get("seq"), Some(&json!(i + 1)));
        assert_eq!(msg.data.get("id"), Some(&json!(format!("t{i}"))));
        assert_eq!(msg.user_id, "u1");
    }
    assert_eq!(relay.current_seq("board-7").await, 20);
}

#[tokio::test]
async fn concurrent_announces_get_distinct_sequence_numbers() {
    let registry = SessionRegistry::new();
    let relay = DurableRelay::new(registry.clone());
    let mut v = viewer(&registry, "board-7", 128).await;

    let mut tasks = Vec::new();
    for i in 0..50 {
        let relay = relay.clone();
        tasks.push(tokio::spawn(async move {
            relay
                .announce("board-7", MessageType::TaskCreated, task(&format!("t{i}")), &Actor::system())
                .await
                .unwrap()
                .seq
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let mut last = 0;
    for _ in 0..50 {
        let seq = v.rx.try_recv().unwrap().data["seq"].as_u64().unwrap();
        assert_eq!(seq, last + 1);
        last = seq;
    }
}

#[tokio::test]
async fn sequences_are_per_room() {
    let registry = SessionRegistry::new();
    let relay = DurableRelay::new(registry.clone());
    let _a = viewer(&registry, "board-1", 8).await;
    let _b = viewer(&registry, "board-2", 8).await;

    relay
        .announce("board-1", MessageType::TaskCreated, task("t1"), &Actor::system())
        .await
        .unwrap();
    relay
        .announce("board-1", MessageType::TaskAssigned, task("t1"), &Actor::system())
        .await
        .unwrap();
    let other = relay
        .announce("board-2", MessageType::TaskCreated, task("t9"), &Actor::system())
        .await
        .unwrap();

    assert_eq!(relay.current_seq("board-1").await, 2);
    assert_eq!(other.seq, 1);
}

#[tokio::test]
async fn saturated_member_does_not_stop_announce() {
    let registry = SessionRegistry::new();
    let relay = DurableRelay::new(registry.clone());
    let mut stuck = viewer(&registry, "board-7", 1).await;
    let mut healthy = viewer(&registry, "board-7", 8).await;

    relay
        .announce("board-7", MessageType::TaskCreated, task("t1"), &Actor::system())
        .await
        .unwrap();
    let second = tokio::time::timeout(
        std::time::Duration::from_millis(500),
        relay.announce("board-7", MessageType::TaskUpdated, task("t1"), &Actor::system()),
    )
    .await
    .expect("announce must not block on a full queue")
    .unwrap();

    assert_eq!(second.delivered, 1);
    assert_eq!(second.failed, 1);
    assert_eq!(healthy.rx.try_recv().unwrap().kind, MessageType::TaskCreated);
    assert_eq!(healthy.rx.try_recv().unwrap().kind, MessageType::TaskUpdated);
    assert_eq!(stuck.rx.try_recv().unwrap().kind, MessageType::TaskCreated);
    assert!(stuck.rx.try_recv().is_err());
}

#[tokio::test]
async fn emit_excludes_and_lane_is_pruned_for_empty_room() {
    let registry = SessionRegistry::new();
    let relay = DurableRelay::new(registry.clone());
    let mut v = viewer(&registry, "board-7", 8).await;

    let (seq, report) = relay
        .emit("board-7", CollaborationMessage::new(MessageType::UserJoined, Data::new()), Some(v.id))
        .await;
    assert_eq!(seq, 1);
    assert_eq!(report.delivered, 0);
    assert!(v.rx.try_recv().is_err());
    assert_eq!(relay.lane_count(), 1);

    relay
        .announce("empty-room", MessageType::TaskCreated, task("t1"), &Actor::system())
        .await
        .unwrap();
    assert_eq!(relay.lane_count(), 1);
    assert_eq!(relay.current_seq("empty-room").await, 0);
}
