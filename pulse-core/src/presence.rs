use crate::error::PulseResult;
use crate::redis::{get_connection, RedisPool};

/// A user is online while `user:{id}:online` exists. If an instance dies
/// without running disconnect logic, the key expires on its own.
pub const PRESENCE_TTL_SECS: u64 = 60;

const KEY_PREFIX: &str = "user:";
const KEY_SUFFIX: &str = ":online";

fn presence_key(user_id: &str) -> String {
    format!("{}{}{}", KEY_PREFIX, user_id, KEY_SUFFIX)
}

fn user_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(KEY_PREFIX)?.strip_suffix(KEY_SUFFIX)
}

pub async fn mark_online(pool: &RedisPool, user_id: &str) -> PulseResult<()> {
    let mut conn = get_connection(pool).await?;
    redis::cmd("SET")
        .arg(presence_key(user_id))
        .arg("1")
        .arg("EX")
        .arg(PRESENCE_TTL_SECS)
        .query_async::<()>(&mut conn)
        .await?;
    Ok(())
}

/// Refreshes the TTL in place. Returns false when the key had already
/// expired (the caller may re-mark the user online).
pub async fn heartbeat(pool: &RedisPool, user_id: &str) -> PulseResult<bool> {
    let mut conn = get_connection(pool).await?;
    let refreshed: i64 = redis::cmd("EXPIRE")
        .arg(presence_key(user_id))
        .arg(PRESENCE_TTL_SECS)
        .query_async(&mut conn)
        .await?;
    Ok(refreshed == 1)
}

pub async fn mark_offline(pool: &RedisPool, user_id: &str) -> PulseResult<()> {
    let mut conn = get_connection(pool).await?;
    redis::cmd("DEL")
        .arg(presence_key(user_id))
        .query_async::<()>(&mut conn)
        .await?;
    Ok(())
}

pub async fn is_online(pool: &RedisPool, user_id: &str) -> PulseResult<bool> {
    let mut conn = get_connection(pool).await?;
    let exists: i64 = redis::cmd("EXISTS")
        .arg(presence_key(user_id))
        .query_async(&mut conn)
        .await?;
    Ok(exists == 1)
}

pub async fn list_online(pool: &RedisPool) -> PulseResult<Vec<String>> {
    let mut conn = get_connection(pool).await?;
    let pattern = format!("{}*{}", KEY_PREFIX, KEY_SUFFIX);
    let mut user_ids = Vec::new();
    let mut cursor: u64 = 0;

    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut conn)
            .await?;

        for key in keys {
            if let Some(id) = user_id_from_key(&key) {
                user_ids.push(id.to_string());
            }
        }

        cursor = next;
        if cursor == 0 {
            break;
        }
    }

    Ok(user_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(presence_key("u42"), "user:u42:online");
    }

    #[test]
    fn parses_id_from_key() {
        assert_eq!(user_id_from_key("user:u42:online"), Some("u42"));
        assert_eq!(user_id_from_key("user:u42"), None);
        assert_eq!(user_id_from_key("session:u42:online"), None);
    }

    #[test]
    fn round_trip() {
        let key = presence_key("a-b-c");
        assert_eq!(user_id_from_key(&key), Some("a-b-c"));
    }
}
