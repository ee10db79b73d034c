use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::Extension,
    response::Response,
};
use chrono::Utc;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use pulse_core::bus::{self, MessageNotice};
use pulse_core::{presence, PulseContext, PulseError, PulseResult};
use pulse_services::messages::NewMessage;
use pulse_services::{ConversationService, MessageService, UserService};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing;
use uuid::Uuid;

use crate::auth::{self, Principal};
use crate::rooms::{conversation_room, ConnId, RoomRegistry};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const IO_DEADLINE: Duration = Duration::from_secs(10);

/// Inbound frame shape: `{"event": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct AuthenticateData {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationData {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveredData {
    conversation_id: String,
    message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadData {
    conversation_id: String,
    message_ids: Vec<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<PulseContext>,
    Extension(rooms): Extension<Arc<RoomRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, rooms))
}

async fn handle_socket(socket: WebSocket, ctx: PulseContext, rooms: Arc<RoomRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Single writer task per connection; handlers and room broadcasts all
    // feed it through the mpsc sender.
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let principal = match authenticate(&ctx, &mut stream).await {
        Ok(principal) => principal,
        Err(e) => {
            tracing::debug!("WebSocket handshake rejected: {}", e);
            let _ = tx.send(error_reply("authenticate", &e));
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let conn_id: ConnId = Uuid::new_v4();

    if let Err(e) = presence::mark_online(&ctx.redis_pool, &principal.subject).await {
        tracing::warn!("Failed to mark user {} online: {}", principal.subject, e);
    }

    let _ = tx.send(
        json!({
            "event": "connected",
            "userId": principal.subject,
        })
        .to_string(),
    );

    tracing::info!(
        "WebSocket connection {} established for user {}",
        conn_id,
        principal.subject
    );

    let mut joined_rooms: HashSet<String> = HashSet::new();

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handle_event(
                    &ctx,
                    &rooms,
                    &principal,
                    conn_id,
                    &tx,
                    &mut joined_rooms,
                    &text,
                )
                .await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("WebSocket read error for {}: {}", conn_id, e);
                break;
            }
        }
    }

    rooms.remove_connection(conn_id).await;

    if let Err(e) = presence::mark_offline(&ctx.redis_pool, &principal.subject).await {
        tracing::warn!("Failed to mark user {} offline: {}", principal.subject, e);
    }
    if let Err(e) = UserService::new(ctx.clone())
        .touch_last_seen(&principal.subject)
        .await
    {
        tracing::warn!(
            "Failed to record last seen for {}: {}",
            principal.subject,
            e
        );
    }

    drop(tx);
    let _ = writer.await;

    tracing::info!(
        "WebSocket connection {} closed for user {}",
        conn_id,
        principal.subject
    );
}

/// The first frame must be an `authenticate` envelope carrying the bearer
/// credential; anything else closes the connection.
async fn authenticate(
    ctx: &PulseContext,
    stream: &mut SplitStream<WebSocket>,
) -> PulseResult<Principal> {
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next())
        .await
        .map_err(|_| PulseError::Unauthenticated("authentication timed out".to_string()))?
        .ok_or_else(|| {
            PulseError::Unauthenticated("connection closed before authentication".to_string())
        })?
        .map_err(|e| PulseError::Unauthenticated(format!("transport error: {}", e)))?;

    let text = match frame {
        Message::Text(text) => text,
        _ => {
            return Err(PulseError::Unauthenticated(
                "expected authentication envelope".to_string(),
            ))
        }
    };

    let envelope: Envelope = serde_json::from_str(&text)
        .map_err(|_| PulseError::Unauthenticated("malformed authentication envelope".to_string()))?;
    if envelope.event != "authenticate" {
        return Err(PulseError::Unauthenticated(
            "first event must be authenticate".to_string(),
        ));
    }

    let data: AuthenticateData = serde_json::from_value(envelope.data)
        .map_err(|_| PulseError::Unauthenticated("missing credential".to_string()))?;

    auth::resolve_principal(ctx, &data.token).await
}

async fn handle_event(
    ctx: &PulseContext,
    rooms: &Arc<RoomRegistry>,
    principal: &Principal,
    conn_id: ConnId,
    tx: &mpsc::UnboundedSender<String>,
    joined_rooms: &mut HashSet<String>,
    text: &str,
) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => {
            let _ = tx.send(error_reply(
                "error",
                &PulseError::BadRequest("malformed event envelope".to_string()),
            ));
            return;
        }
    };

    let event = envelope.event.clone();
    if let Err(e) = dispatch(ctx, rooms, principal, conn_id, tx, joined_rooms, envelope).await {
        tracing::debug!("Event {} from {} failed: {}", event, principal.subject, e);
        let _ = tx.send(error_reply(&event, &e));
    }
}

async fn dispatch(
    ctx: &PulseContext,
    rooms: &Arc<RoomRegistry>,
    principal: &Principal,
    conn_id: ConnId,
    tx: &mpsc::UnboundedSender<String>,
    joined_rooms: &mut HashSet<String>,
    envelope: Envelope,
) -> PulseResult<()> {
    match envelope.event.as_str() {
        "join_conversation" => {
            let data: ConversationData = parse_data(envelope.data)?;
            require_member(ctx, &data.conversation_id, &principal.subject).await?;

            let room = conversation_room(&data.conversation_id);
            rooms
                .join(&room, conn_id, &principal.subject, tx.clone())
                .await;
            joined_rooms.insert(room);

            send_ok(
                tx,
                "join_conversation",
                json!({ "conversationId": data.conversation_id }),
            );
        }

        "leave_conversation" => {
            let data: ConversationData = parse_data(envelope.data)?;

            let room = conversation_room(&data.conversation_id);
            rooms.leave(&room, conn_id).await;
            joined_rooms.remove(&room);

            send_ok(
                tx,
                "leave_conversation",
                json!({ "conversationId": data.conversation_id }),
            );
        }

        "send_message" => {
            let input: NewMessage = parse_data(envelope.data)?;

            let message = with_deadline(
                MessageService::new(ctx.clone()).send(&principal.subject, input),
            )
            .await?;

            // The sender is acknowledged after persist-and-publish; the
            // broadcast to members rides the bus, same-instance included.
            let notice = MessageNotice {
                message_id: message.id.clone(),
                conversation_id: message.conversation_id.clone(),
                sender_id: message.sender_id.clone(),
            };
            with_deadline(bus::publish(&ctx.redis_pool, &notice)).await?;

            send_ok(tx, "send_message", json!({ "messageId": message.id }));
        }

        "typing_start" => {
            let data: ConversationData = parse_data(envelope.data)?;
            require_member(ctx, &data.conversation_id, &principal.subject).await?;

            rooms
                .broadcast_except(
                    &conversation_room(&data.conversation_id),
                    conn_id,
                    &json!({
                        "event": "user_typing",
                        "conversationId": data.conversation_id,
                        "userId": principal.subject,
                    }),
                )
                .await;

            send_ok(tx, "typing_start", json!({}));
        }

        "typing_stop" => {
            let data: ConversationData = parse_data(envelope.data)?;
            require_member(ctx, &data.conversation_id, &principal.subject).await?;

            rooms
                .broadcast_except(
                    &conversation_room(&data.conversation_id),
                    conn_id,
                    &json!({
                        "event": "user_typing_stop",
                        "conversationId": data.conversation_id,
                        "userId": principal.subject,
                    }),
                )
                .await;

            send_ok(tx, "typing_stop", json!({}));
        }

        "message_delivered" => {
            let data: DeliveredData = parse_data(envelope.data)?;
            require_member(ctx, &data.conversation_id, &principal.subject).await?;

            let delivered_at = with_deadline(MessageService::new(ctx.clone()).mark_delivered(
                &principal.subject,
                &data.conversation_id,
                &data.message_id,
            ))
            .await?;

            // Re-delivery is a no-op: no row changed, nothing to announce.
            if let Some(delivered_at) = delivered_at {
                rooms
                    .broadcast(
                        &conversation_room(&data.conversation_id),
                        &json!({
                            "event": "message_delivered",
                            "conversationId": data.conversation_id,
                            "messageId": data.message_id,
                            "userId": principal.subject,
                            "deliveredAt": delivered_at,
                        }),
                    )
                    .await;
            }

            send_ok(
                tx,
                "message_delivered",
                json!({ "messageId": data.message_id }),
            );
        }

        "message_read" => {
            let data: ReadData = parse_data(envelope.data)?;
            require_member(ctx, &data.conversation_id, &principal.subject).await?;

            let (message_ids, read_at) = with_deadline(MessageService::new(ctx.clone()).mark_read(
                &principal.subject,
                &data.conversation_id,
                &data.message_ids,
            ))
            .await?;

            if !message_ids.is_empty() {
                rooms
                    .broadcast(
                        &conversation_room(&data.conversation_id),
                        &json!({
                            "event": "message_read",
                            "conversationId": data.conversation_id,
                            "messageIds": message_ids,
                            "userId": principal.subject,
                            "readAt": read_at,
                        }),
                    )
                    .await;
            }

            send_ok(tx, "message_read", json!({ "messageIds": message_ids }));
        }

        "heartbeat" => {
            let alive =
                with_deadline(presence::heartbeat(&ctx.redis_pool, &principal.subject)).await?;
            if !alive {
                // The key expired between heartbeats; re-mark rather than
                // leaving a live connection invisible.
                with_deadline(presence::mark_online(&ctx.redis_pool, &principal.subject)).await?;
            }

            send_ok(tx, "heartbeat", json!({}));
        }

        "ping" => {
            let _ = tx.send(
                json!({
                    "event": "pong",
                    "timestamp": Utc::now(),
                })
                .to_string(),
            );
        }

        other => {
            return Err(PulseError::BadRequest(format!("unknown event: {}", other)));
        }
    }

    Ok(())
}

async fn require_member(
    ctx: &PulseContext,
    conversation_id: &str,
    user_id: &str,
) -> PulseResult<()> {
    let is_member = with_deadline(
        ConversationService::new(ctx.clone()).is_member(conversation_id, user_id),
    )
    .await?;

    if !is_member {
        return Err(PulseError::Forbidden(format!(
            "user {} is not a member of conversation {}",
            user_id, conversation_id
        )));
    }
    Ok(())
}

/// Every outbound I/O call from a socket handler is bounded; a blown
/// deadline surfaces to the client as a dependency failure.
async fn with_deadline<T, F>(fut: F) -> PulseResult<T>
where
    F: Future<Output = PulseResult<T>>,
{
    tokio::time::timeout(IO_DEADLINE, fut)
        .await
        .map_err(|_| PulseError::Dependency("operation timed out".to_string()))?
}

fn parse_data<T: DeserializeOwned>(data: Value) -> PulseResult<T> {
    serde_json::from_value(data).map_err(|e| PulseError::BadRequest(format!("invalid payload: {}", e)))
}

fn send_ok(tx: &mpsc::UnboundedSender<String>, event: &str, extra: Value) {
    let mut reply = json!({
        "event": event,
        "success": true,
    });
    if let (Some(reply), Some(extra)) = (reply.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            reply.insert(key.clone(), value.clone());
        }
    }
    let _ = tx.send(reply.to_string());
}

fn error_reply(event: &str, error: &PulseError) -> String {
    json!({
        "event": event,
        "success": false,
        "error": error.kind(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_event_and_data() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"event":"join_conversation","data":{"conversationId":"c1"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.event, "join_conversation");

        let data: ConversationData = parse_data(envelope.data).unwrap();
        assert_eq!(data.conversation_id, "c1");
    }

    #[test]
    fn envelope_data_defaults_to_null() {
        let envelope: Envelope = serde_json::from_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(envelope.event, "heartbeat");
        assert!(envelope.data.is_null());
    }

    #[test]
    fn read_data_requires_message_ids() {
        let parsed: PulseResult<ReadData> =
            parse_data(serde_json::json!({ "conversationId": "c1" }));
        assert!(parsed.is_err());

        let parsed: ReadData = parse_data(serde_json::json!({
            "conversationId": "c1",
            "messageIds": ["m1", "m2"],
        }))
        .unwrap();
        assert_eq!(parsed.message_ids.len(), 2);
    }

    #[test]
    fn error_reply_carries_kind() {
        let reply = error_reply(
            "send_message",
            &PulseError::Forbidden("not a member".to_string()),
        );
        let json: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(json["event"], "send_message");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "forbidden");
    }

    #[test]
    fn ok_reply_merges_extras() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        send_ok(&tx, "send_message", json!({ "messageId": "m1" }));
        let reply: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["event"], "send_message");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["messageId"], "m1");
    }
}
