use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use pulse_core::schema::users;
use pulse_core::types::{UserRow, UserView};
use pulse_core::{PulseContext, PulseError, PulseResult};
use serde::Deserialize;
use tracing;

/// Identity payload pushed by the OAuth front-door after sign-in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySync {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
}

pub struct UserService {
    ctx: PulseContext,
}

impl UserService {
    pub fn new(ctx: PulseContext) -> Self {
        Self { ctx }
    }

    /// Upserts the user identified by email. First sync creates the row;
    /// later syncs refresh the profile fields.
    pub async fn sync_identity(&self, input: IdentitySync) -> PulseResult<UserView> {
        if input.id.trim().is_empty() || input.email.trim().is_empty() {
            return Err(PulseError::BadRequest(
                "identity sync requires id and email".to_string(),
            ));
        }
        if input.name.trim().is_empty() {
            return Err(PulseError::BadRequest(
                "identity sync requires a display name".to_string(),
            ));
        }

        let mut conn = self.ctx.db_pool.get().await?;

        let row: UserRow = diesel::insert_into(users::table)
            .values((
                users::id.eq(&input.id),
                users::email.eq(&input.email),
                users::display_name.eq(&input.name),
                users::image_url.eq(input.image.as_deref()),
                users::created_at.eq(Utc::now()),
            ))
            .on_conflict(users::email)
            .do_update()
            .set((
                users::display_name.eq(&input.name),
                users::image_url.eq(input.image.as_deref()),
            ))
            .returning(UserRow::as_returning())
            .get_result(&mut conn)
            .await?;

        tracing::debug!("Synced identity for user {}", row.id);

        Ok(row.into())
    }

    pub async fn me(&self, user_id: &str) -> PulseResult<UserView> {
        let row = self
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| PulseError::NotFound(format!("user {}", user_id)))?;
        Ok(row.into())
    }

    pub async fn find_by_id(&self, user_id: &str) -> PulseResult<Option<UserRow>> {
        let mut conn = self.ctx.db_pool.get().await?;

        let row = users::table
            .find(user_id)
            .select(UserRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row)
    }

    /// Written on disconnect so "last seen" survives the presence TTL.
    pub async fn touch_last_seen(&self, user_id: &str) -> PulseResult<()> {
        let mut conn = self.ctx.db_pool.get().await?;

        diesel::update(users::table.find(user_id))
            .set(users::last_seen_at.eq(Utc::now()))
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}
