use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tracing;
use uuid::Uuid;

pub type ConnId = Uuid;

/// Logical room key for a conversation.
pub fn conversation_room(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

struct RoomMember {
    user_id: String,
    tx: UnboundedSender<String>,
}

/// Gateway-local index from room name to connected members. Joins, leaves
/// and disconnect sweeps serialize on the write lock; broadcasts take the
/// read lock and push onto non-blocking per-connection senders, so fan-out
/// within a room is serialized relative to membership changes.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, HashMap<ConnId, RoomMember>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room: &str, conn_id: ConnId, user_id: &str, tx: UnboundedSender<String>) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room.to_string()).or_default().insert(
            conn_id,
            RoomMember {
                user_id: user_id.to_string(),
                tx,
            },
        );
        tracing::debug!("Connection {} joined {}", conn_id, room);
    }

    pub async fn leave(&self, room: &str, conn_id: ConnId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        tracing::debug!("Connection {} left {}", conn_id, room);
    }

    /// Removes a closed connection from every room it joined.
    pub async fn remove_connection(&self, conn_id: ConnId) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    pub async fn broadcast(&self, room: &str, payload: &Value) {
        self.send_to_room(room, None, payload).await;
    }

    pub async fn broadcast_except(&self, room: &str, skip: ConnId, payload: &Value) {
        self.send_to_room(room, Some(skip), payload).await;
    }

    pub async fn connections_in(&self, room: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    async fn send_to_room(&self, room: &str, skip: Option<ConnId>, payload: &Value) {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room) else {
            return;
        };

        let payload = payload.to_string();
        for (conn_id, member) in members {
            if Some(*conn_id) == skip {
                continue;
            }
            // A send failure means the connection's writer already went
            // away; the disconnect sweep will remove it.
            if member.tx.send(payload.clone()).is_err() {
                tracing::debug!(
                    "Skipping closed connection {} (user {}) in {}",
                    conn_id,
                    member.user_id,
                    room
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn member() -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn broadcast_reaches_all_members() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = member();
        let (tx_b, mut rx_b) = member();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.join("conversation:c1", a, "user-a", tx_a).await;
        registry.join("conversation:c1", b, "user-b", tx_b).await;

        registry
            .broadcast("conversation:c1", &serde_json::json!({"event": "x"}))
            .await;

        assert_eq!(rx_a.recv().await.unwrap(), r#"{"event":"x"}"#);
        assert_eq!(rx_b.recv().await.unwrap(), r#"{"event":"x"}"#);
    }

    #[tokio::test]
    async fn broadcast_except_skips_sender() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = member();
        let (tx_b, mut rx_b) = member();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.join("conversation:c1", a, "user-a", tx_a).await;
        registry.join("conversation:c1", b, "user-b", tx_b).await;

        registry
            .broadcast_except("conversation:c1", a, &serde_json::json!({"event": "typing"}))
            .await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn leave_removes_from_room() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = member();
        let conn = Uuid::new_v4();

        registry.join("conversation:c1", conn, "user-a", tx).await;
        assert_eq!(registry.connections_in("conversation:c1").await, 1);

        registry.leave("conversation:c1", conn).await;
        assert_eq!(registry.connections_in("conversation:c1").await, 0);

        registry
            .broadcast("conversation:c1", &serde_json::json!({"event": "x"}))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_sweeps_every_room() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = member();
        let conn = Uuid::new_v4();

        registry.join("conversation:c1", conn, "user-a", tx.clone()).await;
        registry.join("conversation:c2", conn, "user-a", tx).await;

        registry.remove_connection(conn).await;

        assert_eq!(registry.connections_in("conversation:c1").await, 0);
        assert_eq!(registry.connections_in("conversation:c2").await, 0);
    }

    #[tokio::test]
    async fn one_user_many_connections() {
        let registry = RoomRegistry::new();
        let (tx_1, mut rx_1) = member();
        let (tx_2, mut rx_2) = member();

        registry
            .join("conversation:c1", Uuid::new_v4(), "user-a", tx_1)
            .await;
        registry
            .join("conversation:c1", Uuid::new_v4(), "user-a", tx_2)
            .await;

        registry
            .broadcast("conversation:c1", &serde_json::json!({"event": "x"}))
            .await;

        assert!(rx_1.recv().await.is_some());
        assert!(rx_2.recv().await.is_some());
    }
}
