use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_types::events::ServerEvent;

use crate::registry::Outbound;

/// Per-connection state established during the authentication handshake.
///
/// The chat set is the session's membership cache: loaded once from storage
/// at connect time and never refreshed mid-session. It is the source of
/// truth for event authorization, so a user added to a chat after this
/// session connected is not routable until they reconnect (accepted
/// staleness window).
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: Uuid,
    pub username: String,
    pub conn_id: Uuid,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Outbound>,
    chats: HashSet<Uuid>,
}

impl SessionContext {
    pub fn new(
        user_id: Uuid,
        username: String,
        conn_id: Uuid,
        chats: HashSet<Uuid>,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            user_id,
            username,
            conn_id,
            connected_at: Utc::now(),
            tx,
            chats,
        }
    }

    pub fn is_member(&self, chat_id: Uuid) -> bool {
        self.chats.contains(&chat_id)
    }

    pub fn room_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.chats.iter().copied()
    }

    /// Deliver directly to this connection, bypassing the registry. Used for
    /// acks and error events that must reach the originating connection even
    /// after a newer session has displaced it in the registry.
    pub fn deliver(&self, event: ServerEvent) {
        let _ = self.tx.send(Outbound::Event(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_fixed_at_construction() {
        let chat = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = SessionContext::new(
            Uuid::new_v4(),
            "alice".into(),
            Uuid::new_v4(),
            [chat].into_iter().collect(),
            tx,
        );
        assert!(ctx.is_member(chat));
        assert!(!ctx.is_member(Uuid::new_v4()));
        assert_eq!(ctx.room_ids().collect::<Vec<_>>(), vec![chat]);
    }
}
