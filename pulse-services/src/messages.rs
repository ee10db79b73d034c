use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use pulse_core::db::DbConnection;
use pulse_core::schema::{conversations, message_statuses, messages, users};
use pulse_core::types::{
    MessageRow, MessageStatusRow, MessageStatusView, MessageType, MessageView, UserRow,
};
use pulse_core::{PulseContext, PulseError, PulseResult};
use serde::{Deserialize, Serialize};
use tracing;
use uuid::Uuid;

use crate::conversations::ConversationService;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "mediaUrl")]
    pub media_path: Option<String>,
    #[serde(default)]
    pub media_meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub messages: Vec<MessageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<DateTime<Utc>>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    #[serde(flatten)]
    pub message: MessageView,
    pub statuses: Vec<MessageStatusView>,
}

#[derive(Insertable)]
#[diesel(table_name = pulse_core::schema::messages)]
struct NewMessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    content: Option<String>,
    message_type: String,
    media_path: Option<String>,
    media_meta: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = pulse_core::schema::message_statuses)]
struct NewStatusRow {
    message_id: String,
    user_id: String,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

/// Type-vs-payload invariants: text carries content and no media path,
/// image/video carry a media path.
pub fn validate_payload(
    message_type: MessageType,
    content: Option<&str>,
    media_path: Option<&str>,
) -> PulseResult<()> {
    match message_type {
        MessageType::Text => {
            if content.map(str::trim).filter(|c| !c.is_empty()).is_none() {
                return Err(PulseError::BadRequest(
                    "text message requires non-empty content".to_string(),
                ));
            }
            if media_path.is_some() {
                return Err(PulseError::BadRequest(
                    "text message cannot carry a media path".to_string(),
                ));
            }
        }
        MessageType::Image | MessageType::Video => {
            if media_path.map(str::trim).filter(|p| !p.is_empty()).is_none() {
                return Err(PulseError::BadRequest(
                    "media message requires a media path".to_string(),
                ));
            }
        }
    }
    Ok(())
}

pub struct MessageService {
    ctx: PulseContext,
}

impl MessageService {
    pub fn new(ctx: PulseContext) -> Self {
        Self { ctx }
    }

    /// Persists a message plus one status row per member, and bumps the
    /// conversation's `updated_at`, all in one transaction. The sender's
    /// status row is born delivered at the message's `created_at`.
    pub async fn send(&self, actor: &str, input: NewMessage) -> PulseResult<MessageView> {
        let conversations_svc = ConversationService::new(self.ctx.clone());

        let members = {
            let mut conn = self.ctx.db_pool.get().await?;
            let exists: Option<String> = conversations::table
                .find(&input.conversation_id)
                .select(conversations::id)
                .first(&mut conn)
                .await
                .optional()?;
            if exists.is_none() {
                return Err(PulseError::NotFound(format!(
                    "conversation {}",
                    input.conversation_id
                )));
            }
            conversations_svc.member_ids(&input.conversation_id).await?
        };

        if !members.iter().any(|m| m == actor) {
            return Err(PulseError::Forbidden(format!(
                "user {} is not a member of conversation {}",
                actor, input.conversation_id
            )));
        }

        validate_payload(
            input.message_type,
            input.content.as_deref(),
            input.media_path.as_deref(),
        )?;

        let message_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let message_row = NewMessageRow {
            id: message_id.clone(),
            conversation_id: input.conversation_id.clone(),
            sender_id: actor.to_string(),
            content: input.content.clone(),
            message_type: input.message_type.as_str().to_string(),
            media_path: input.media_path.clone(),
            media_meta: input.media_meta.clone(),
            created_at: now,
        };

        let status_rows: Vec<NewStatusRow> = members
            .iter()
            .map(|member| NewStatusRow {
                message_id: message_id.clone(),
                user_id: member.clone(),
                delivered_at: (member == actor).then_some(now),
                read_at: None,
            })
            .collect();

        let conversation_id = input.conversation_id.clone();

        let mut conn = self.ctx.db_pool.get().await?;
        conn.transaction::<_, PulseError, _>(|conn| {
            async move {
                diesel::insert_into(messages::table)
                    .values(&message_row)
                    .execute(conn)
                    .await?;

                diesel::insert_into(message_statuses::table)
                    .values(&status_rows)
                    .execute(conn)
                    .await?;

                diesel::update(conversations::table.find(&conversation_id))
                    .set(conversations::updated_at.eq(now))
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await?;

        tracing::debug!(
            "Persisted message {} with {} status rows",
            message_id,
            members.len()
        );

        let view = self
            .load_view(&mut conn, &message_id)
            .await?
            .ok_or_else(|| PulseError::Dependency("message vanished after commit".to_string()))?;

        Ok(view)
    }

    /// Cursor pagination over `created_at`, newest first. The cursor is the
    /// `created_at` of the oldest message in the previous page; same-instant
    /// ties across a page boundary are deduplicated client-side by id.
    pub async fn list_for_conversation(
        &self,
        conversation_id: &str,
        actor: &str,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> PulseResult<HistoryPage> {
        self.require_membership(conversation_id, actor).await?;

        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let mut conn = self.ctx.db_pool.get().await?;

        let mut query = messages::table
            .inner_join(users::table)
            .filter(messages::conversation_id.eq(conversation_id))
            .select((MessageRow::as_select(), UserRow::as_select()))
            .order(messages::created_at.desc())
            .limit(limit)
            .into_boxed();

        if let Some(cursor) = cursor {
            query = query.filter(messages::created_at.lt(cursor));
        }

        let rows: Vec<(MessageRow, UserRow)> = query.load(&mut conn).await?;

        let has_more = rows.len() as i64 == limit;
        let next_cursor = if has_more {
            rows.last().map(|(message, _)| message.created_at)
        } else {
            None
        };

        Ok(HistoryPage {
            messages: rows
                .into_iter()
                .map(|(message, sender)| MessageView::from_rows(message, sender))
                .collect(),
            next_cursor,
            has_more,
        })
    }

    /// Single message with its status rows, membership-checked.
    pub async fn get_single(&self, message_id: &str, actor: &str) -> PulseResult<MessageDetail> {
        let mut conn = self.ctx.db_pool.get().await?;

        let view = self
            .load_view(&mut conn, message_id)
            .await?
            .ok_or_else(|| PulseError::NotFound(format!("message {}", message_id)))?;

        let conversations_svc = ConversationService::new(self.ctx.clone());
        if !conversations_svc
            .is_member(&view.conversation_id, actor)
            .await?
        {
            return Err(PulseError::Forbidden(format!(
                "user {} is not a member of conversation {}",
                actor, view.conversation_id
            )));
        }

        let statuses: Vec<MessageStatusRow> = message_statuses::table
            .filter(message_statuses::message_id.eq(message_id))
            .select(MessageStatusRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(MessageDetail {
            message: view,
            statuses: statuses.into_iter().map(Into::into).collect(),
        })
    }

    /// Sets the actor's `delivered_at` if still null. Returns the receipt
    /// timestamp when a row changed; `None` means it was already delivered.
    pub async fn mark_delivered(
        &self,
        actor: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> PulseResult<Option<DateTime<Utc>>> {
        let mut conn = self.ctx.db_pool.get().await?;

        let owning: Option<String> = messages::table
            .find(message_id)
            .select(messages::conversation_id)
            .first(&mut conn)
            .await
            .optional()?;
        match owning {
            Some(conv) if conv == conversation_id => {}
            _ => return Err(PulseError::NotFound(format!("message {}", message_id))),
        }

        let now = Utc::now();
        let changed = diesel::update(
            message_statuses::table
                .filter(message_statuses::message_id.eq(message_id))
                .filter(message_statuses::user_id.eq(actor))
                .filter(message_statuses::delivered_at.is_null()),
        )
        .set(message_statuses::delivered_at.eq(now))
        .execute(&mut conn)
        .await?;

        Ok((changed > 0).then_some(now))
    }

    /// Batch read receipt. In one transaction, fills `delivered_at` where
    /// null and `read_at` where null for the actor's rows whose message
    /// belongs to the stated conversation. Both fields get the same
    /// timestamp, so read always implies delivered.
    pub async fn mark_read(
        &self,
        actor: &str,
        conversation_id: &str,
        message_ids: &[String],
    ) -> PulseResult<(Vec<String>, DateTime<Utc>)> {
        let now = Utc::now();

        if message_ids.is_empty() {
            return Ok((Vec::new(), now));
        }

        let actor = actor.to_string();
        let conversation_id = conversation_id.to_string();
        let message_ids = message_ids.to_vec();

        let mut conn = self.ctx.db_pool.get().await?;
        let valid_ids = conn
            .transaction::<_, PulseError, _>(|conn| {
                async move {
                    let valid_ids: Vec<String> = messages::table
                        .filter(messages::id.eq_any(&message_ids))
                        .filter(messages::conversation_id.eq(&conversation_id))
                        .select(messages::id)
                        .load(conn)
                        .await?;

                    if valid_ids.is_empty() {
                        return Ok(valid_ids);
                    }

                    diesel::update(
                        message_statuses::table
                            .filter(message_statuses::message_id.eq_any(&valid_ids))
                            .filter(message_statuses::user_id.eq(&actor))
                            .filter(message_statuses::delivered_at.is_null()),
                    )
                    .set(message_statuses::delivered_at.eq(now))
                    .execute(conn)
                    .await?;

                    diesel::update(
                        message_statuses::table
                            .filter(message_statuses::message_id.eq_any(&valid_ids))
                            .filter(message_statuses::user_id.eq(&actor))
                            .filter(message_statuses::read_at.is_null()),
                    )
                    .set(message_statuses::read_at.eq(now))
                    .execute(conn)
                    .await?;

                    Ok(valid_ids)
                }
                .scope_boxed()
            })
            .await?;

        Ok((valid_ids, now))
    }

    /// Source-of-truth re-read used by the bus consumer. A missing id is a
    /// rollback race, not an error.
    pub async fn load_for_broadcast(&self, message_id: &str) -> PulseResult<Option<MessageView>> {
        let mut conn = self.ctx.db_pool.get().await?;
        self.load_view(&mut conn, message_id).await
    }

    async fn require_membership(&self, conversation_id: &str, actor: &str) -> PulseResult<()> {
        let mut conn = self.ctx.db_pool.get().await?;
        let exists: Option<String> = conversations::table
            .find(conversation_id)
            .select(conversations::id)
            .first(&mut conn)
            .await
            .optional()?;
        if exists.is_none() {
            return Err(PulseError::NotFound(format!(
                "conversation {}",
                conversation_id
            )));
        }

        let conversations_svc = ConversationService::new(self.ctx.clone());
        if !conversations_svc.is_member(conversation_id, actor).await? {
            return Err(PulseError::Forbidden(format!(
                "user {} is not a member of conversation {}",
                actor, conversation_id
            )));
        }
        Ok(())
    }

    async fn load_view(
        &self,
        conn: &mut DbConnection,
        message_id: &str,
    ) -> PulseResult<Option<MessageView>> {
        let row: Option<(MessageRow, UserRow)> = messages::table
            .inner_join(users::table)
            .filter(messages::id.eq(message_id))
            .select((MessageRow::as_select(), UserRow::as_select()))
            .first(conn)
            .await
            .optional()?;

        Ok(row.map(|(message, sender)| MessageView::from_rows(message, sender)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_requires_content() {
        assert!(validate_payload(MessageType::Text, Some("hi"), None).is_ok());
        assert!(validate_payload(MessageType::Text, None, None).is_err());
        assert!(validate_payload(MessageType::Text, Some(""), None).is_err());
        assert!(validate_payload(MessageType::Text, Some("   "), None).is_err());
    }

    #[test]
    fn text_rejects_media_path() {
        assert!(validate_payload(MessageType::Text, Some("hi"), Some("a/b.png")).is_err());
    }

    #[test]
    fn media_requires_path() {
        assert!(validate_payload(MessageType::Image, None, Some("a/b.png")).is_ok());
        assert!(validate_payload(MessageType::Image, Some("caption"), Some("a/b.png")).is_ok());
        assert!(validate_payload(MessageType::Image, None, None).is_err());
        assert!(validate_payload(MessageType::Video, None, Some("")).is_err());
    }

    #[test]
    fn new_message_accepts_wire_shape() {
        let input: NewMessage = serde_json::from_value(serde_json::json!({
            "conversationId": "c1",
            "type": "image",
            "mediaUrl": "conversations/c1/u1_1_cat.png",
            "mediaMeta": {"mime": "image/png"}
        }))
        .unwrap();
        assert_eq!(input.message_type, MessageType::Image);
        assert_eq!(
            input.media_path.as_deref(),
            Some("conversations/c1/u1_1_cat.png")
        );
    }

    #[test]
    fn history_page_shape() {
        let page = HistoryPage {
            messages: vec![],
            next_cursor: None,
            has_more: false,
        };
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["hasMore"], false);
        assert!(json.get("nextCursor").is_none());
    }
}
