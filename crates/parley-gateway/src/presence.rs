use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use parley_types::models::PresenceStatus;

#[derive(Debug, Clone, Copy)]
pub struct PresenceEntry {
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// In-memory presence view, a pure function of connection lifecycle plus
/// explicit status events. No polling and no periodic re-broadcast: accuracy
/// is bounded by connect/disconnect/status-event resolution.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    entries: Arc<RwLock<HashMap<Uuid, PresenceEntry>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_online(&self, user_id: Uuid) -> PresenceEntry {
        self.set(user_id, PresenceStatus::Online).await
    }

    pub async fn set_offline(&self, user_id: Uuid) -> PresenceEntry {
        self.set(user_id, PresenceStatus::Offline).await
    }

    pub async fn set(&self, user_id: Uuid, status: PresenceStatus) -> PresenceEntry {
        let entry = PresenceEntry {
            status,
            last_seen: Utc::now(),
        };
        self.entries.write().await.insert(user_id, entry);
        entry
    }

    pub async fn get(&self, user_id: Uuid) -> Option<PresenceEntry> {
        self.entries.read().await.get(&user_id).copied()
    }

    /// Users not currently offline, for the connect-time sync so a fresh
    /// client sees who is already here.
    pub async fn online_snapshot(&self) -> Vec<(Uuid, PresenceEntry)> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.status != PresenceStatus::Offline)
            .map(|(user_id, entry)| (*user_id, *entry))
            .collect()
    }
}
