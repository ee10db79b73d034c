use anyhow::Result;
use futures_util::StreamExt;
use pulse_core::bus::{self, MessageNotice};
use pulse_core::PulseContext;
use pulse_services::MessageService;
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::rooms::{conversation_room, RoomRegistry};

/// Bus consumer: every instance subscribes to `chat:messages` and fans each
/// notice out to the locally connected members of the conversation's room.
/// Errors never reach clients; a lost broadcast is recovered on the next
/// history load.
pub async fn run(ctx: PulseContext, rooms: Arc<RoomRegistry>) -> Result<()> {
    tracing::info!("Starting bus consumer");

    let mut error_count = 0u32;

    loop {
        match bus::subscribe(&ctx.redis_pool).await {
            Ok(mut pubsub) => {
                error_count = 0;
                let mut stream = pubsub.on_message();

                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!("Undecodable bus payload: {}", e);
                            continue;
                        }
                    };

                    if let Err(e) = handle_notice(&ctx, &rooms, &payload).await {
                        tracing::error!("Error handling bus notice: {}", e);
                    }
                }

                tracing::warn!("Bus subscription ended, reconnecting");
            }
            Err(e) => {
                error_count += 1;
                tracing::warn!(
                    "Failed to subscribe to bus (attempt {}): {}",
                    error_count,
                    e
                );
            }
        }

        // Exponential backoff: 1s, 2s, 4s, max 30s
        let backoff = Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30));
        tokio::time::sleep(backoff).await;
    }
}

async fn handle_notice(ctx: &PulseContext, rooms: &Arc<RoomRegistry>, payload: &str) -> Result<()> {
    let notice: MessageNotice = serde_json::from_str(payload)?;

    // Source-of-truth re-read: every instance broadcasts the committed row,
    // never the bus payload.
    let service = MessageService::new(ctx.clone());
    match service.load_for_broadcast(&notice.message_id).await? {
        Some(message) => {
            let room = conversation_room(&notice.conversation_id);
            rooms
                .broadcast(
                    &room,
                    &serde_json::json!({
                        "event": "message_received",
                        "message": message,
                    }),
                )
                .await;
            tracing::debug!("Broadcast message {} to {}", notice.message_id, room);
        }
        None => {
            tracing::warn!(
                "Dropping bus notice for missing message {}",
                notice.message_id
            );
        }
    }

    Ok(())
}
