use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// Messages flowing to one connection's send loop.
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    /// Delivered to a displaced session so its send loop terminates even
    /// though the connection task still holds sender clones of its own.
    Shutdown,
}

/// The live, reachable endpoint of one authenticated user.
#[derive(Debug)]
pub struct SessionHandle {
    pub conn_id: Uuid,
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub connected_at: DateTime<Utc>,
}

impl SessionHandle {
    /// Ask the owning connection to shut down. Used on the handle returned
    /// by `register` to close the session it displaced.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }
}

/// Single source of truth for "is user X reachable right now".
///
/// One entry per user: a reconnect replaces the previous handle
/// (last-writer-wins), and teardown removes an entry only when it still
/// belongs to the connection being torn down. All mutation happens inside
/// one write-lock critical section; no compound read-modify-write escapes it.
/// The registry emits no presence events of its own.
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    epoch: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `user_id`, displacing any prior handle.
    /// Returns the registration epoch assigned to this session and the
    /// displaced handle so the caller can `close` it.
    ///
    /// The epoch is drawn inside the same critical section as the map
    /// insert, so epoch order always matches registration order. Room joins
    /// carry it: a connection whose handshake is still in flight when a
    /// newer session registers can never overwrite that session's room
    /// subscriptions.
    pub async fn register(
        &self,
        user_id: Uuid,
        handle: SessionHandle,
    ) -> (u64, Option<SessionHandle>) {
        let mut sessions = self.sessions.write().await;
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let displaced = sessions.insert(user_id, handle);
        (epoch, displaced)
    }

    /// Remove the entry for `user_id` only if it still belongs to `conn_id`.
    /// Returns whether an entry was removed. Guards against a stale
    /// disconnect racing a newer reconnect.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&user_id) {
            Some(handle) if handle.conn_id == conn_id => {
                sessions.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&user_id)
    }

    /// Targeted delivery. A missing or dead recipient is a routing miss,
    /// not an error.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(&user_id) {
            Some(handle) => handle.tx.send(Outbound::Event(event)).is_ok(),
            None => false,
        }
    }

    /// Deliver to every connected session, optionally excluding one user.
    /// The sender snapshot is taken under the read lock and released before
    /// any delivery.
    pub async fn broadcast_all(&self, event: &ServerEvent, except: Option<Uuid>) {
        let targets: Vec<mpsc::UnboundedSender<Outbound>> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(user_id, _)| Some(**user_id) != except)
                .map(|(_, handle)| handle.tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(Outbound::Event(event.clone()));
        }
    }

    pub async fn connected_users(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SessionHandle {
                conn_id: Uuid::new_v4(),
                tx,
                connected_at: Utc::now(),
            },
            rx,
        )
    }

    fn dummy_event() -> ServerEvent {
        ServerEvent::Error {
            message: "test".into(),
        }
    }

    #[tokio::test]
    async fn register_replaces_prior_handle() {
        let registry = Registry::new();
        let user = Uuid::new_v4();

        let (first, mut rx1) = handle();
        let first_conn = first.conn_id;
        let (first_epoch, displaced) = registry.register(user, first).await;
        assert!(displaced.is_none());

        let (second, _rx2) = handle();
        let (second_epoch, displaced) = registry.register(user, second).await;
        let displaced = displaced.unwrap();
        assert_eq!(displaced.conn_id, first_conn);
        assert!(second_epoch > first_epoch);
        assert!(registry.is_connected(user).await);

        // closing the displaced handle reaches the stale connection
        displaced.close();
        assert!(matches!(rx1.try_recv(), Ok(Outbound::Shutdown)));
    }

    #[tokio::test]
    async fn stale_unregister_does_not_evict_newer_session() {
        let registry = Registry::new();
        let user = Uuid::new_v4();

        let (first, _rx1) = handle();
        let stale_conn = first.conn_id;
        registry.register(user, first).await;

        let (second, _rx2) = handle();
        registry.register(user, second).await;

        // the old connection's teardown must be a no-op
        assert!(!registry.unregister(user, stale_conn).await);
        assert!(registry.is_connected(user).await);
    }

    #[tokio::test]
    async fn unregister_removes_current_session() {
        let registry = Registry::new();
        let user = Uuid::new_v4();

        let (h, _rx) = handle();
        let conn = h.conn_id;
        registry.register(user, h).await;

        assert!(registry.unregister(user, conn).await);
        assert!(!registry.is_connected(user).await);
        assert!(!registry.send_to_user(user, dummy_event()).await);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_user() {
        let registry = Registry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (ha, mut rx_a) = handle();
        let (hb, mut rx_b) = handle();
        registry.register(alice, ha).await;
        registry.register(bob, hb).await;

        registry.broadcast_all(&dummy_event(), Some(alice)).await;

        assert!(matches!(rx_b.try_recv(), Ok(Outbound::Event(_))));
        assert!(rx_a.try_recv().is_err());
    }
}
