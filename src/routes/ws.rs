//! WebSocket handler — one task pair per connection.
//!
//! DESIGN
//! ======
//! On upgrade the socket is split:
//! - a writer task drains the connection's private outbound queue, stamps
//!   timestamps monotonically, and emits the periodic `heartbeat` + ping
//! - the reader loop `select!`s over client frames, close requests from
//!   fan-out (slow consumer, shutdown), and the heartbeat deadline
//!
//! Handler functions validate and call services, returning an `Outcome`.
//! Replies to the sender go through the same outbound queue as broadcasts,
//! so the sender sees one ordered stream.
//!
//! LIFECYCLE
//! =========
//! 1. Handshake identity checked before upgrade (401 on `AuthError`)
//! 2. `accept` → welcome `notification` + auto-join `room_joined`
//! 3. Inbound frames → dispatch → Outcome → reply/ack
//! 4. Loop exit → `close` (Draining → `user_left` → Closed) → writer sends
//!    the final error/close frame and stops

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::message::{
    CollaborationMessage, CursorPayload, Data, ErrorCode, Inbound, MessageType, PresencePayload, ProtocolError,
    TypingPayload, validate_room_id,
};
use crate::services::connection::{self, Admission, CloseReason, Connection, Identity, MonotonicClock};
use crate::services::registry::{FanOut, Member};
use crate::state::AppState;

const USER_ID_HEADER: &str = "x-user-id";
const USER_NAME_HEADER: &str = "x-user-name";

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer turns it into
/// messages for the sender; fan-out already happened inside the services.
#[derive(Debug)]
enum Outcome {
    /// Send one message back to the sender.
    Reply(CollaborationMessage),
    /// Broadcast to peers happened; nothing for the sender.
    Relayed(FanOut),
    /// Accepted with no visible effect.
    Done,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = params
        .get("user_id")
        .map(String::as_str)
        .or_else(|| header_str(&headers, USER_ID_HEADER));
    let username = params
        .get("username")
        .map(String::as_str)
        .or_else(|| header_str(&headers, USER_NAME_HEADER));

    let identity = match Identity::from_parts(user_id, username, state.config.max_user_id_len) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, code = e.error_code(), "ws: handshake rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState, identity: Identity) {
    let admission = match connection::accept(&state, Some(&identity.user_id), Some(&identity.username)).await {
        Ok(admission) => admission,
        Err(e) => {
            warn!(error = %e, "ws: accept failed after upgrade");
            return;
        }
    };
    let Admission { mut connection, member, outbound_rx, mut close_rx, .. } = admission;
    let connection_id = connection.id();
    let user_id = connection.handle.user_id.clone();

    let (sink, mut stream) = socket.split();
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(sink, outbound_rx, stop_rx, state.config.heartbeat_interval));

    info!(%connection_id, %user_id, "ws: client connected");

    let reason = loop {
        let deadline = connection.heartbeat_deadline();
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break CloseReason::ConnectionLost };
                connection.touch();
                match msg {
                    Message::Text(text) => {
                        for reply in process_inbound_text(&state, &connection, text.as_str()).await {
                            deliver_reply(&member, reply);
                        }
                    }
                    Message::Binary(_) => {
                        deliver_reply(&member, CollaborationMessage::error_from(&ProtocolError::BinaryFrame, None));
                    }
                    Message::Close(_) => break CloseReason::ClientClosed,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            Some(reason) = close_rx.recv() => break reason,
            () = tokio::time::sleep_until(deadline) => {
                if connection.is_heartbeat_expired(Instant::now()) {
                    break CloseReason::HeartbeatTimeout;
                }
            }
        }
    };

    connection::close(&state, &mut connection, reason).await;
    // The writer must learn the reason before its queue reports closed.
    let _ = stop_tx.send(reason);
    drop(member);
    // A client that stopped reading can hold the final frames forever.
    match tokio::time::timeout(state.config.heartbeat_timeout, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%connection_id, error = %e, "ws: writer task failed"),
        Err(_) => {
            writer.abort();
            warn!(%connection_id, "ws: writer did not finish, aborted");
        }
    }
    info!(%connection_id, %user_id, reason = reason.as_str(), "ws: client disconnected");
}

fn deliver_reply(member: &Member, reply: CollaborationMessage) {
    if let Err(e) = member.deliver(reply) {
        warn!(connection_id = %member.id(), error = %e, "ws: reply dropped");
    }
}

// =============================================================================
// WRITER
// =============================================================================

type WsSink = SplitSink<WebSocket, Message>;

async fn write_loop(
    mut sink: WsSink,
    mut outbound_rx: mpsc::Receiver<CollaborationMessage>,
    mut stop_rx: oneshot::Receiver<CloseReason>,
    heartbeat_interval: Duration,
) {
    let mut clock = MonotonicClock::new();
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);

    let reason = loop {
        tokio::select! {
            biased;
            reason = &mut stop_rx => break reason.ok(),
            msg = outbound_rx.recv() => {
                // Every sender is gone: the reader has finished closing and
                // the stop reason is already sent or about to be.
                let Some(msg) = msg else { break (&mut stop_rx).await.ok() };
                if send_message(&mut sink, &mut clock, msg).await.is_err() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let beat = CollaborationMessage::new(MessageType::Heartbeat, Data::new())
                    .with_data("interval_ms", u64::try_from(heartbeat_interval.as_millis()).unwrap_or(u64::MAX));
                if send_message(&mut sink, &mut clock, beat).await.is_err() {
                    return;
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    return;
                }
            }
        }
    };

    let Some(reason) = reason else { return };
    if reason == CloseReason::ConnectionLost {
        return;
    }
    if reason != CloseReason::SlowConsumer {
        while let Ok(msg) = outbound_rx.try_recv() {
            if send_message(&mut sink, &mut clock, msg).await.is_err() {
                return;
            }
        }
    }
    if reason.is_forced() {
        let notice = CollaborationMessage::error_from(&reason, None).with_data("reason", reason.as_str());
        if send_message(&mut sink, &mut clock, notice).await.is_err() {
            return;
        }
    }
    let frame = CloseFrame { code: reason.code(), reason: reason.as_str().into() };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

async fn send_message(sink: &mut WsSink, clock: &mut MonotonicClock, mut msg: CollaborationMessage) -> Result<(), ()> {
    msg.timestamp = clock.stamp(msg.timestamp);
    let json = match serde_json::to_string(&msg) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, kind = %msg.kind, "ws: failed to serialize message");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await.map_err(|e| {
        debug!(error = %e, "ws: send failed");
    })
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return messages for the sender.
///
/// Kept separate from the socket so tests can drive dispatch directly.
async fn process_inbound_text(state: &AppState, connection: &Connection, text: &str) -> Vec<CollaborationMessage> {
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(connection_id = %connection.id(), error = %e, "ws: invalid inbound message");
            return vec![CollaborationMessage::error_from(&e, None)];
        }
    };

    if inbound.kind.is_ephemeral() {
        debug!(connection_id = %connection.id(), id = %inbound.id, kind = %inbound.kind, "ws: recv");
    } else {
        info!(connection_id = %connection.id(), id = %inbound.id, kind = %inbound.kind, "ws: recv");
    }

    let result = match inbound.kind {
        MessageType::Heartbeat => Ok(Outcome::Reply(
            CollaborationMessage::new(MessageType::Heartbeat, Data::new()).with_data("reply_to", inbound.id.as_str()),
        )),
        MessageType::Acknowledgment => {
            debug!(connection_id = %connection.id(), message_id = ?inbound.data_str("message_id"), "ws: client ack");
            Ok(Outcome::Done)
        }
        MessageType::RoomJoined => handle_room_join(state, connection, &inbound).await,
        MessageType::RoomLeft => handle_room_leave(state, connection, &inbound).await,
        MessageType::UserTyping => handle_typing(state, connection, &inbound).await,
        MessageType::CursorPosition => handle_cursor(state, connection, &inbound).await,
        MessageType::UserPresence => handle_presence(state, connection, &inbound).await,
        MessageType::DocumentEdit | MessageType::Notification => handle_passthrough(state, connection, &inbound).await,
        kind @ (MessageType::TaskCreated
        | MessageType::TaskUpdated
        | MessageType::TaskDeleted
        | MessageType::TaskAssigned
        | MessageType::UserJoined
        | MessageType::UserLeft
        | MessageType::Error) => Err(ProtocolError::ServerOnly(kind)),
    };

    let mut replies = Vec::new();
    match result {
        Ok(outcome) => {
            match outcome {
                Outcome::Reply(msg) => replies.push(msg),
                Outcome::Relayed(report) => {
                    debug!(
                        connection_id = %connection.id(),
                        kind = %inbound.kind,
                        delivered = report.delivered,
                        failed = report.failed.len(),
                        "ws: relayed"
                    );
                }
                Outcome::Done => {}
            }
            if inbound.requires_ack {
                replies.push(CollaborationMessage::acknowledgment(&inbound.id));
            }
        }
        Err(e) => {
            warn!(connection_id = %connection.id(), id = %inbound.id, code = e.error_code(), error = %e, "ws: rejected");
            replies.push(CollaborationMessage::error_from(&e, Some(&inbound.id)));
        }
    }
    replies
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Room id named by a join/leave request: `data.room_id`, else the envelope room.
fn requested_room(state: &AppState, inbound: &Inbound) -> Result<String, ProtocolError> {
    let raw = inbound
        .data_str("room_id")
        .or(inbound.room.as_deref())
        .ok_or(ProtocolError::RoomRequired(inbound.kind))?;
    validate_room_id(raw, state.config.max_room_id_len)
}

/// Room targeted by a broadcast: envelope room, `data.room_id`, then the
/// first auto-join room. The sender must already be a member.
async fn target_room(state: &AppState, connection: &Connection, inbound: &Inbound) -> Result<String, ProtocolError> {
    let room = match inbound.room.as_deref().or_else(|| inbound.data_str("room_id")) {
        Some(raw) => validate_room_id(raw, state.config.max_room_id_len)?,
        None => state
            .config
            .auto_join_rooms
            .first()
            .cloned()
            .ok_or(ProtocolError::RoomRequired(inbound.kind))?,
    };
    if !state.registry.is_member(connection.id(), &room).await {
        return Err(ProtocolError::NotInRoom(room));
    }
    Ok(room)
}

async fn handle_room_join(state: &AppState, connection: &Connection, inbound: &Inbound) -> Result<Outcome, ProtocolError> {
    let room = requested_room(state, inbound)?;
    let reply = connection::join_room(state, &connection.handle, &room)
        .await
        .map_err(|e| ProtocolError::InvalidPayload { kind: inbound.kind, reason: e.to_string() })?;
    Ok(Outcome::Reply(reply))
}

async fn handle_room_leave(state: &AppState, connection: &Connection, inbound: &Inbound) -> Result<Outcome, ProtocolError> {
    let room = requested_room(state, inbound)?;
    Ok(Outcome::Reply(connection::leave_room(state, &connection.handle, &room).await))
}

async fn handle_typing(state: &AppState, connection: &Connection, inbound: &Inbound) -> Result<Outcome, ProtocolError> {
    let payload: TypingPayload = inbound.payload()?;
    let room = target_room(state, connection, inbound).await?;
    let report = state
        .router
        .publish_typing(&connection.handle, &room, &payload.task_id, payload.is_typing)
        .await;
    Ok(Outcome::Relayed(report))
}

async fn handle_cursor(state: &AppState, connection: &Connection, inbound: &Inbound) -> Result<Outcome, ProtocolError> {
    let payload: CursorPayload = inbound.payload()?;
    if !payload.x.is_finite() || !payload.y.is_finite() {
        return Err(ProtocolError::InvalidPayload { kind: inbound.kind, reason: "coordinates must be finite".into() });
    }
    let room = target_room(state, connection, inbound).await?;
    let report = state
        .router
        .publish_cursor(&connection.handle, &room, payload)
        .await;
    Ok(Outcome::Relayed(report))
}

async fn handle_presence(state: &AppState, connection: &Connection, inbound: &Inbound) -> Result<Outcome, ProtocolError> {
    let payload: PresencePayload = inbound.payload()?;
    let handle = &connection.handle;
    let record = state
        .presence
        .set_presence(&handle.user_id, &handle.username, payload.status, payload.activity.as_deref())
        .await;
    let rooms = state.registry.rooms_of(handle.id).await;
    let report = state
        .registry
        .broadcast_rooms(rooms.iter(), &connection::presence_message(&record), Some(handle.id))
        .await;
    Ok(Outcome::Relayed(report))
}

/// Coarse collaboration events are relayed verbatim to the other members.
async fn handle_passthrough(state: &AppState, connection: &Connection, inbound: &Inbound) -> Result<Outcome, ProtocolError> {
    let room = target_room(state, connection, inbound).await?;
    let mut msg = CollaborationMessage::new(inbound.kind, inbound.data.clone())
        .with_sender(connection.handle.user_id.as_str(), connection.handle.username.as_str())
        .with_room(room.as_str());
    msg.id.clone_from(&inbound.id);
    let report = state
        .registry
        .broadcast(&room, &msg, Some(connection.id()))
        .await;
    Ok(Outcome::Relayed(report))
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
