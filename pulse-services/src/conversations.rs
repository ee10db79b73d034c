use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use pulse_core::db::DbConnection;
use pulse_core::schema::{conversation_members, conversations, messages, users};
use pulse_core::types::{
    ConversationMemberRow, ConversationMemberView, ConversationRow, ConversationView, MemberRole,
    MessageRow, MessageView, UserRow,
};
use pulse_core::{PulseContext, PulseError, PulseResult};
use serde::Deserialize;
use tracing;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = pulse_core::schema::conversation_members)]
struct NewMemberRow {
    conversation_id: String,
    user_id: String,
    role: String,
    joined_at: DateTime<Utc>,
}

pub struct ConversationService {
    ctx: PulseContext,
}

impl ConversationService {
    pub fn new(ctx: PulseContext) -> Self {
        Self { ctx }
    }

    /// Creates a conversation. Direct conversations are idempotent: if one
    /// already exists whose member set is exactly `{actor, other}`, it is
    /// returned instead of inserting a duplicate.
    pub async fn create(&self, actor: &str, input: NewConversation) -> PulseResult<ConversationView> {
        let mut others: Vec<String> = input
            .user_ids
            .iter()
            .filter(|id| id.as_str() != actor)
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        others.sort();

        let name = input.name.as_deref().map(str::trim).filter(|n| !n.is_empty());

        if input.is_group {
            if others.len() < 2 {
                return Err(PulseError::BadRequest(
                    "group conversation requires at least two other users".to_string(),
                ));
            }
            if name.is_none() {
                return Err(PulseError::BadRequest(
                    "group conversation requires a name".to_string(),
                ));
            }
        } else {
            if others.len() != 1 {
                return Err(PulseError::BadRequest(
                    "direct conversation requires exactly one other user".to_string(),
                ));
            }
            if name.is_some() {
                return Err(PulseError::BadRequest(
                    "direct conversation cannot be named".to_string(),
                ));
            }
        }

        let mut conn = self.ctx.db_pool.get().await?;

        let known: i64 = users::table
            .filter(users::id.eq_any(&others))
            .count()
            .get_result(&mut conn)
            .await?;
        if known as usize != others.len() {
            return Err(PulseError::BadRequest(
                "one or more referenced users do not exist".to_string(),
            ));
        }

        if !input.is_group {
            if let Some(existing) = self
                .find_direct(&mut conn, actor, &others[0])
                .await?
            {
                tracing::debug!("Reusing direct conversation {}", existing);
                return self.get(&existing, actor).await;
            }
        }

        let conversation_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut member_rows = vec![NewMemberRow {
            conversation_id: conversation_id.clone(),
            user_id: actor.to_string(),
            role: if input.is_group {
                MemberRole::Admin.as_str().to_string()
            } else {
                MemberRole::Member.as_str().to_string()
            },
            joined_at: now,
        }];
        for other in &others {
            member_rows.push(NewMemberRow {
                conversation_id: conversation_id.clone(),
                user_id: other.clone(),
                role: MemberRole::Member.as_str().to_string(),
                joined_at: now,
            });
        }

        let conv_id = conversation_id.clone();
        let is_group = input.is_group;
        let conv_name = name.map(|n| n.to_string());

        conn.transaction::<_, PulseError, _>(|conn| {
            async move {
                diesel::insert_into(conversations::table)
                    .values((
                        conversations::id.eq(&conv_id),
                        conversations::is_group.eq(is_group),
                        conversations::name.eq(conv_name.as_deref()),
                        conversations::created_at.eq(now),
                        conversations::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                diesel::insert_into(conversation_members::table)
                    .values(&member_rows)
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await?;

        tracing::info!(
            "Created {} conversation {} with {} members",
            if input.is_group { "group" } else { "direct" },
            conversation_id,
            others.len() + 1
        );

        self.get(&conversation_id, actor).await
    }

    /// The actor's conversations, most recently active first, each with its
    /// latest message attached.
    pub async fn list_for_user(&self, actor: &str) -> PulseResult<Vec<ConversationView>> {
        let mut conn = self.ctx.db_pool.get().await?;

        let conv_rows: Vec<ConversationRow> = conversations::table
            .inner_join(conversation_members::table)
            .filter(conversation_members::user_id.eq(actor))
            .order(conversations::updated_at.desc())
            .select(ConversationRow::as_select())
            .load(&mut conn)
            .await?;

        let ids: Vec<String> = conv_rows.iter().map(|c| c.id.clone()).collect();
        let mut members_by_conv = self.load_members(&mut conn, &ids).await?;

        let mut views = Vec::with_capacity(conv_rows.len());
        for row in conv_rows {
            let last_message = self.load_last_message(&mut conn, &row.id).await?;
            let members = members_by_conv.remove(&row.id).unwrap_or_default();
            views.push(assemble_view(row, members, last_message));
        }

        Ok(views)
    }

    /// Not-found and forbidden are distinct so callers can log accordingly.
    pub async fn get(&self, conversation_id: &str, actor: &str) -> PulseResult<ConversationView> {
        let mut conn = self.ctx.db_pool.get().await?;

        let row: Option<ConversationRow> = conversations::table
            .find(conversation_id)
            .select(ConversationRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        let row = row
            .ok_or_else(|| PulseError::NotFound(format!("conversation {}", conversation_id)))?;

        if !self.is_member(conversation_id, actor).await? {
            return Err(PulseError::Forbidden(format!(
                "user {} is not a member of conversation {}",
                actor, conversation_id
            )));
        }

        let ids = vec![row.id.clone()];
        let mut members_by_conv = self.load_members(&mut conn, &ids).await?;
        let members = members_by_conv.remove(&row.id).unwrap_or_default();
        let last_message = self.load_last_message(&mut conn, &row.id).await?;

        Ok(assemble_view(row, members, last_message))
    }

    /// Hot-path membership predicate used by every gateway event.
    pub async fn is_member(&self, conversation_id: &str, user_id: &str) -> PulseResult<bool> {
        let mut conn = self.ctx.db_pool.get().await?;

        let exists: bool = diesel::select(diesel::dsl::exists(
            conversation_members::table
                .filter(conversation_members::conversation_id.eq(conversation_id))
                .filter(conversation_members::user_id.eq(user_id)),
        ))
        .get_result(&mut conn)
        .await?;

        Ok(exists)
    }

    pub async fn member_ids(&self, conversation_id: &str) -> PulseResult<Vec<String>> {
        let mut conn = self.ctx.db_pool.get().await?;

        let ids: Vec<String> = conversation_members::table
            .filter(conversation_members::conversation_id.eq(conversation_id))
            .select(conversation_members::user_id)
            .load(&mut conn)
            .await?;

        Ok(ids)
    }

    /// Strict set-equality lookup. Subset matching would return groups that
    /// happen to contain both users and break direct-conversation uniqueness.
    async fn find_direct(
        &self,
        conn: &mut DbConnection,
        actor: &str,
        other: &str,
    ) -> PulseResult<Option<String>> {
        let candidate_ids: Vec<String> = conversation_members::table
            .inner_join(conversations::table)
            .filter(conversation_members::user_id.eq(actor))
            .filter(conversations::is_group.eq(false))
            .select(conversations::id)
            .load(conn)
            .await?;

        if candidate_ids.is_empty() {
            return Ok(None);
        }

        let member_rows: Vec<(String, String)> = conversation_members::table
            .filter(conversation_members::conversation_id.eq_any(&candidate_ids))
            .select((
                conversation_members::conversation_id,
                conversation_members::user_id,
            ))
            .load(conn)
            .await?;

        let mut sets: HashMap<String, HashSet<String>> = HashMap::new();
        for (conv_id, user_id) in member_rows {
            sets.entry(conv_id).or_default().insert(user_id);
        }

        let expected: HashSet<String> = [actor.to_string(), other.to_string()].into();
        Ok(sets
            .into_iter()
            .find(|(_, members)| *members == expected)
            .map(|(conv_id, _)| conv_id))
    }

    async fn load_members(
        &self,
        conn: &mut DbConnection,
        conversation_ids: &[String],
    ) -> PulseResult<HashMap<String, Vec<ConversationMemberView>>> {
        if conversation_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(ConversationMemberRow, UserRow)> = conversation_members::table
            .inner_join(users::table)
            .filter(conversation_members::conversation_id.eq_any(conversation_ids))
            .select((ConversationMemberRow::as_select(), UserRow::as_select()))
            .load(conn)
            .await?;

        let mut by_conv: HashMap<String, Vec<ConversationMemberView>> = HashMap::new();
        for (member, user) in rows {
            by_conv
                .entry(member.conversation_id.clone())
                .or_default()
                .push(ConversationMemberView {
                    user: user.into(),
                    role: member.role,
                    joined_at: member.joined_at,
                });
        }

        Ok(by_conv)
    }

    async fn load_last_message(
        &self,
        conn: &mut DbConnection,
        conversation_id: &str,
    ) -> PulseResult<Option<MessageView>> {
        let row: Option<(MessageRow, UserRow)> = messages::table
            .inner_join(users::table)
            .filter(messages::conversation_id.eq(conversation_id))
            .order(messages::created_at.desc())
            .select((MessageRow::as_select(), UserRow::as_select()))
            .first(conn)
            .await
            .optional()?;

        Ok(row.map(|(message, sender)| MessageView::from_rows(message, sender)))
    }
}

fn assemble_view(
    row: ConversationRow,
    members: Vec<ConversationMemberView>,
    last_message: Option<MessageView>,
) -> ConversationView {
    ConversationView {
        id: row.id,
        is_group: row.is_group,
        name: row.name,
        created_at: row.created_at,
        updated_at: row.updated_at,
        members,
        last_message,
    }
}
