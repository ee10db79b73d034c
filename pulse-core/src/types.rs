use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Message payload classification. Stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "video" => Some(MessageType::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConversationRow {
    pub id: String,
    pub is_group: bool,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::conversation_members)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConversationMemberRow {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub message_type: String,
    pub media_path: Option<String>,
    pub media_meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::message_statuses)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MessageStatusRow {
    pub message_id: String,
    pub user_id: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

// Wire views. Field names follow the REST/WebSocket contract.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<UserRow> for UserView {
    fn from(row: UserRow) -> Self {
        UserView {
            id: row.id,
            email: row.email,
            name: row.display_name,
            image: row.image_url,
            created_at: row.created_at,
            last_seen: row.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub sender: UserView,
}

impl MessageView {
    pub fn from_rows(message: MessageRow, sender: UserRow) -> Self {
        MessageView {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            message_type: message.message_type,
            media_path: message.media_path,
            media_meta: message.media_meta,
            created_at: message.created_at,
            sender: sender.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusView {
    pub message_id: String,
    pub user_id: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<MessageStatusRow> for MessageStatusView {
    fn from(row: MessageStatusRow) -> Self {
        MessageStatusView {
            message_id: row.message_id,
            user_id: row.user_id,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMemberView {
    pub user: UserView,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub members: Vec<ConversationMemberView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips() {
        for t in [MessageType::Text, MessageType::Image, MessageType::Video] {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("audio"), None);
    }

    #[test]
    fn views_serialize_camel_case() {
        let view = UserView {
            id: "u1".into(),
            email: "a@example.com".into(),
            name: "Ada".into(),
            image: None,
            created_at: Utc::now(),
            last_seen: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("image").is_none());
        assert!(json.get("lastSeen").is_none());
    }

    #[test]
    fn message_view_uses_type_field() {
        let now = Utc::now();
        let view = MessageView::from_rows(
            MessageRow {
                id: "m1".into(),
                conversation_id: "c1".into(),
                sender_id: "u1".into(),
                content: Some("hi".into()),
                message_type: "text".into(),
                media_path: None,
                media_meta: None,
                created_at: now,
            },
            UserRow {
                id: "u1".into(),
                email: "a@example.com".into(),
                display_name: "Ada".into(),
                image_url: None,
                created_at: now,
                last_seen_at: None,
            },
        );
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["sender"]["name"], "Ada");
    }
}
