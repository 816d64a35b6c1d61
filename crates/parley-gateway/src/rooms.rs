use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

/// One connection's claim on a room slot: which connection owns it and the
/// registration epoch it was granted by the registry.
#[derive(Clone, Copy)]
struct Subscription {
    conn_id: Uuid,
    epoch: u64,
}

/// Live room membership: `chat_id -> { user_id -> subscription }`.
///
/// A room is the set of live sessions currently subscribed to one chat's
/// broadcasts. Joins carry the registration epoch: a join from an older
/// epoch never overwrites a newer session's entry, so a connection whose
/// handshake raced a reconnect cannot strip the newer session's rooms.
/// Leaving removes only entries owned by the departing connection. Fan-out
/// always works on a snapshot taken under the read lock — callers iterate
/// it after the lock is released.
#[derive(Clone, Default)]
pub struct Rooms {
    rooms: Arc<RwLock<HashMap<Uuid, HashMap<Uuid, Subscription>>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join_all(&self, chat_ids: &[Uuid], user_id: Uuid, conn_id: Uuid, epoch: u64) {
        let mut rooms = self.rooms.write().await;
        for chat_id in chat_ids {
            let members = rooms.entry(*chat_id).or_default();
            match members.get(&user_id) {
                Some(existing) if existing.epoch > epoch => {}
                _ => {
                    members.insert(user_id, Subscription { conn_id, epoch });
                }
            }
        }
    }

    /// Release every subscription owned by `conn_id`. Entries taken over by
    /// a newer connection of the same user are left untouched.
    pub async fn leave_all(&self, user_id: Uuid, conn_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            if matches!(members.get(&user_id), Some(sub) if sub.conn_id == conn_id) {
                members.remove(&user_id);
            }
            !members.is_empty()
        });
    }

    /// Snapshot of the user ids currently subscribed to a chat.
    pub async fn members(&self, chat_id: Uuid) -> Vec<Uuid> {
        self.rooms
            .read()
            .await
            .get(&chat_id)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }
}
