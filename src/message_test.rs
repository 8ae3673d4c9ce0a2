use super::*;
use serde_json::json;

// =============================================================================
// MessageType
// =============================================================================

#[test]
fn message_type_wire_names_round_trip() {
    for kind in MessageType::ALL {
        assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        let json = serde_json::to_value(kind).unwrap();
        assert_eq!(json, json!(kind.as_str()));
    }
}

#[test]
fn message_type_rejects_unknown_names() {
    assert_eq!(MessageType::parse("presence_update"), None);
    assert_eq!(MessageType::parse(""), None);
    assert_eq!(MessageType::parse("TASK_CREATED"), None);
}

#[test]
fn durable_and_ephemeral_classification() {
    assert!(MessageType::TaskDeleted.is_durable());
    assert!(MessageType::TaskAssigned.is_durable());
    assert!(!MessageType::UserTyping.is_durable());
    assert!(MessageType::UserTyping.is_ephemeral());
    assert!(MessageType::CursorPosition.is_ephemeral());
    assert!(!MessageType::DocumentEdit.is_ephemeral());
}

// =============================================================================
// Constructors / serialization
// =============================================================================

#[test]
fn new_message_defaults_to_system_sender() {
    let msg = CollaborationMessage::new(MessageType::Heartbeat, Data::new());
    assert_eq!(msg.user_id, SYSTEM_USER_ID);
    assert_eq!(msg.username, SYSTEM_USERNAME);
    assert!(msg.room.is_none());
    assert!(msg.timestamp > 0);
    assert!(!msg.requires_ack);
}

#[test]
fn serialized_envelope_uses_wire_field_names() {
    let msg = CollaborationMessage::new(MessageType::TaskDeleted, Data::new())
        .with_sender("u1", "Alice")
        .with_room("board-7")
        .with_data("id", "t1");
    let value = serde_json::to_value(&msg).unwrap();

    assert_eq!(value["type"], "task_deleted");
    assert_eq!(value["room"], "board-7");
    assert_eq!(value["user_id"], "u1");
    assert_eq!(value["username"], "Alice");
    assert_eq!(value["data"]["id"], "t1");
    assert!(value.get("requires_ack").is_none());
}

#[test]
fn room_is_omitted_when_absent() {
    let msg = CollaborationMessage::new(MessageType::Heartbeat, Data::new());
    let value = serde_json::to_value(&msg).unwrap();
    assert!(value.get("room").is_none());
}

#[test]
fn error_from_carries_code_and_reply_to() {
    let err = ProtocolError::UnknownType("bogus".into());
    let msg = CollaborationMessage::error_from(&err, Some("m-1"));

    assert_eq!(msg.kind, MessageType::Error);
    assert_eq!(msg.data.get(MSG_CODE).and_then(|v| v.as_str()), Some("E_UNKNOWN_TYPE"));
    assert_eq!(
        msg.data.get(MSG_MESSAGE).and_then(|v| v.as_str()),
        Some("unknown message type: bogus")
    );
    assert_eq!(msg.data.get(MSG_RETRYABLE).and_then(serde_json::Value::as_bool), Some(false));
    assert_eq!(msg.data.get(MSG_REPLY_TO).and_then(|v| v.as_str()), Some("m-1"));
}

#[test]
fn acknowledgment_references_message_id() {
    let ack = CollaborationMessage::acknowledgment("abc");
    assert_eq!(ack.kind, MessageType::Acknowledgment);
    assert_eq!(ack.data.get("message_id").and_then(|v| v.as_str()), Some("abc"));
}

// =============================================================================
// Inbound parsing
// =============================================================================

#[test]
fn inbound_parses_minimal_frame_and_assigns_id() {
    let inbound = Inbound::parse(r#"{"type":"heartbeat"}"#).unwrap();
    assert_eq!(inbound.kind, MessageType::Heartbeat);
    assert!(!inbound.id.is_empty());
    assert!(inbound.data.is_empty());
    assert!(inbound.room.is_none());
    assert!(!inbound.requires_ack);
}

#[test]
fn inbound_keeps_client_id_room_and_ack_flag() {
    let text = json!({
        "id": "client-42",
        "type": "user_typing",
        "room": "board-7",
        "requires_ack": true,
        "data": {"task_id": "t1", "is_typing": true},
        "user_id": "spoofed",
    })
    .to_string();
    let inbound = Inbound::parse(&text).unwrap();

    assert_eq!(inbound.id, "client-42");
    assert_eq!(inbound.room.as_deref(), Some("board-7"));
    assert!(inbound.requires_ack);
    let typing: TypingPayload = inbound.payload().unwrap();
    assert_eq!(typing.task_id, "t1");
    assert!(typing.is_typing);
}

#[test]
fn inbound_blank_room_is_treated_as_absent() {
    let inbound = Inbound::parse(r#"{"type":"heartbeat","room":"  "}"#).unwrap();
    assert!(inbound.room.is_none());
}

#[test]
fn inbound_invalid_json_is_protocol_error() {
    let err = Inbound::parse("{not json").unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidJson(_)));
    assert_eq!(err.error_code(), "E_INVALID_JSON");
}

#[test]
fn inbound_unknown_type_is_protocol_error() {
    let err = Inbound::parse(r#"{"type":"launch_missiles"}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "launch_missiles"));
}

#[test]
fn inbound_non_object_data_is_rejected() {
    let err = Inbound::parse(r#"{"type":"user_typing","data":[1,2]}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidPayload { kind: MessageType::UserTyping, .. }));
    assert!(err.to_string().contains("array"));
}

#[test]
fn payload_type_mismatch_is_invalid_payload() {
    let inbound = Inbound::parse(r#"{"type":"cursor_position","data":{"task_id":"t1","x":"left"}}"#).unwrap();
    let err = inbound.payload::<CursorPayload>().unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID_PAYLOAD");
}

#[test]
fn cursor_payload_element_is_optional() {
    let inbound = Inbound::parse(r#"{"type":"cursor_position","data":{"task_id":"t1","x":1.5,"y":2.0}}"#).unwrap();
    let cursor: CursorPayload = inbound.payload().unwrap();
    assert!(cursor.element.is_none());
    assert!((cursor.x - 1.5).abs() < f64::EPSILON);
}

#[test]
fn data_str_ignores_blank_and_non_string_values() {
    let inbound = Inbound::parse(r#"{"type":"room_joined","data":{"room_id":"  ","n":3}}"#).unwrap();
    assert_eq!(inbound.data_str("room_id"), None);
    assert_eq!(inbound.data_str("n"), None);
    assert_eq!(inbound.data_str("missing"), None);
}

#[test]
fn room_ids_are_trimmed_and_bounded() {
    assert_eq!(validate_room_id("  board-7 ", 16).unwrap(), "board-7");
    assert_eq!(validate_room_id(&"é".repeat(16), 16).unwrap().chars().count(), 16);

    for bad in ["", "   ", "board\t7", "board\u{0}"] {
        let err = validate_room_id(bad, 16).unwrap_err();
        assert_eq!(err.error_code(), "E_INVALID_ROOM");
    }
    assert!(matches!(validate_room_id(&"r".repeat(17), 16), Err(ProtocolError::InvalidRoom(_))));
}
