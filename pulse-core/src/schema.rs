use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    users (id) {
        id -> Text,
        email -> Text,
        display_name -> Text,
        image_url -> Nullable<Text>,
        created_at -> Timestamptz,
        last_seen_at -> Nullable<Timestamptz>,
    }
}

table! {
    conversations (id) {
        id -> Text,
        is_group -> Bool,
        name -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    conversation_members (conversation_id, user_id) {
        conversation_id -> Text,
        user_id -> Text,
        role -> Text,
        joined_at -> Timestamptz,
    }
}

table! {
    messages (id) {
        id -> Text,
        conversation_id -> Text,
        sender_id -> Text,
        content -> Nullable<Text>,
        message_type -> Text,
        media_path -> Nullable<Text>,
        media_meta -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

table! {
    message_statuses (message_id, user_id) {
        message_id -> Text,
        user_id -> Text,
        delivered_at -> Nullable<Timestamptz>,
        read_at -> Nullable<Timestamptz>,
    }
}

joinable!(conversation_members -> conversations (conversation_id));
joinable!(conversation_members -> users (user_id));
joinable!(messages -> conversations (conversation_id));
joinable!(messages -> users (sender_id));
joinable!(message_statuses -> messages (message_id));
joinable!(message_statuses -> users (user_id));

allow_tables_to_appear_in_same_query!(
    users,
    conversations,
    conversation_members,
    messages,
    message_statuses,
);
