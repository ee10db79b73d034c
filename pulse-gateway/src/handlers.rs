use axum::{
    extract::{Extension, Path, Query},
    http::HeaderMap,
    response::Json,
};
use chrono::{DateTime, Utc};
use pulse_core::types::{ConversationView, MessageView, UserView};
use pulse_core::{PulseContext, PulseError, PulseResult};
use pulse_services::conversations::NewConversation;
use pulse_services::media::{UploadGrant, UploadRequest};
use pulse_services::messages::{HistoryPage, MessageDetail, NewMessage};
use pulse_services::users::IdentitySync;
use pulse_services::{ConversationService, MediaService, MessageService, UserService};
use pulse_core::bus::{self, MessageNotice};
use serde::Deserialize;
use tracing;

use crate::auth::{self, Principal};

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pulse-gateway"
    }))
}

/// Identity sync from the OAuth front-door. Verifies the token itself: the
/// auth middleware's user lookup cannot apply before the first sync.
pub async fn auth_sync(
    Extension(ctx): Extension<PulseContext>,
    headers: HeaderMap,
    Json(input): Json<IdentitySync>,
) -> PulseResult<Json<serde_json::Value>> {
    let token = auth::bearer_from_headers(&headers)
        .ok_or_else(|| PulseError::Unauthenticated("missing bearer token".to_string()))?;
    let claims = auth::verify_token(&token, &ctx.config.server.auth_secret)?;

    if !claims.email.eq_ignore_ascii_case(&input.email) {
        return Err(PulseError::Forbidden(
            "token does not match synced identity".to_string(),
        ));
    }

    let user = UserService::new(ctx.clone()).sync_identity(input).await?;
    tracing::debug!("Identity synced for {}", user.id);

    Ok(Json(serde_json::json!({
        "success": true,
        "user": user,
    })))
}

pub async fn auth_me(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
) -> PulseResult<Json<UserView>> {
    let user = UserService::new(ctx.clone()).me(&principal.subject).await?;
    Ok(Json(user))
}

pub async fn create_conversation(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
    Json(input): Json<NewConversation>,
) -> PulseResult<Json<ConversationView>> {
    let view = ConversationService::new(ctx.clone())
        .create(&principal.subject, input)
        .await?;
    Ok(Json(view))
}

pub async fn list_conversations(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
) -> PulseResult<Json<Vec<ConversationView>>> {
    let views = ConversationService::new(ctx.clone())
        .list_for_user(&principal.subject)
        .await?;
    Ok(Json(views))
}

pub async fn get_conversation(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
) -> PulseResult<Json<ConversationView>> {
    let view = ConversationService::new(ctx.clone())
        .get(&conversation_id, &principal.subject)
        .await?;
    Ok(Json(view))
}

/// REST send path. Persist, then publish the same bus notice as the socket
/// path so connected members see the message regardless of entry point.
pub async fn create_message(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
    Json(input): Json<NewMessage>,
) -> PulseResult<Json<MessageView>> {
    let message = MessageService::new(ctx.clone())
        .send(&principal.subject, input)
        .await?;

    let notice = MessageNotice {
        message_id: message.id.clone(),
        conversation_id: message.conversation_id.clone(),
        sender_id: message.sender_id.clone(),
    };
    bus::publish(&ctx.redis_pool, &notice).await?;

    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_messages(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> PulseResult<Json<HistoryPage>> {
    let page = MessageService::new(ctx.clone())
        .list_for_conversation(&conversation_id, &principal.subject, query.cursor, query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn get_message(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
    Path(message_id): Path<String>,
) -> PulseResult<Json<MessageDetail>> {
    let detail = MessageService::new(ctx.clone())
        .get_single(&message_id, &principal.subject)
        .await?;
    Ok(Json(detail))
}

pub async fn media_upload_url(
    Extension(ctx): Extension<PulseContext>,
    Extension(principal): Extension<Principal>,
    Json(input): Json<UploadRequest>,
) -> PulseResult<Json<UploadGrant>> {
    let grant = MediaService::new(ctx.clone())
        .request_upload_url(&principal.subject, input)
        .await?;
    Ok(Json(grant))
}

#[derive(Debug, Deserialize)]
pub struct MediaUrlQuery {
    pub path: String,
}

pub async fn media_url(
    Extension(ctx): Extension<PulseContext>,
    Extension(_principal): Extension<Principal>,
    Query(query): Query<MediaUrlQuery>,
) -> PulseResult<Json<serde_json::Value>> {
    let url = MediaService::new(ctx.clone()).get_media_url(&query.path).await?;
    Ok(Json(serde_json::json!({ "url": url })))
}
