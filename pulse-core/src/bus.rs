use redis::aio::PubSub;
use serde::{Deserialize, Serialize};
use tracing;

use crate::error::{PulseError, PulseResult};
use crate::redis::{get_connection, RedisPool};

/// Single broadcast channel every gateway instance subscribes to. Payloads
/// are reference tuples; the store stays the source of truth.
pub const CHANNEL: &str = "chat:messages";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotice {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
}

pub async fn publish(pool: &RedisPool, notice: &MessageNotice) -> PulseResult<()> {
    let payload = serde_json::to_string(notice)
        .map_err(|e| PulseError::Dependency(format!("failed to encode bus notice: {}", e)))?;

    let mut conn = get_connection(pool).await?;
    let receivers: i64 = redis::cmd("PUBLISH")
        .arg(CHANNEL)
        .arg(&payload)
        .query_async(&mut conn)
        .await?;

    tracing::debug!(
        "Published message {} to {} ({} subscribers)",
        notice.message_id,
        CHANNEL,
        receivers
    );

    Ok(())
}

/// Opens a dedicated subscriber connection. The consumer loop lives in the
/// gateway; a dropped connection is re-established there.
pub async fn subscribe(pool: &RedisPool) -> PulseResult<PubSub> {
    let mut pubsub = pool.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL).await?;
    tracing::info!("Subscribed to bus channel: {}", CHANNEL);
    Ok(pubsub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_round_trips_camel_case() {
        let notice = MessageNotice {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["senderId"], "u1");

        let back: MessageNotice = serde_json::from_value(json).unwrap();
        assert_eq!(back.message_id, "m1");
    }
}
