use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task;
use tracing::warn;
use uuid::Uuid;

use parley_types::events::{ClientEvent, ServerEvent};
use parley_types::models::{Message, PresenceStatus};

use crate::presence::PresenceTracker;
use crate::push::PushDispatcher;
use crate::registry::Registry;
use crate::rooms::Rooms;
use crate::session::SessionContext;
use crate::store::{NewMessage, Store, StoreError};

/// Routes inbound client events: validates membership against the session's
/// cache, invokes persistence, and fans the resulting events out to the
/// affected room.
///
/// Events are handled independently; within one chat the relative order of
/// broadcasts is only as strong as the order their persistence calls
/// complete, so two concurrent sends may be delivered in an order that
/// differs from true arrival order under contention. No registry or room
/// lock is ever held across a persistence call: targets are computed from a
/// snapshot, the lock is released, then the broadcast runs.
#[derive(Clone)]
pub struct Router {
    pub registry: Registry,
    pub rooms: Rooms,
    pub presence: PresenceTracker,
    store: Arc<dyn Store>,
    push: Arc<dyn PushDispatcher>,
}

impl Router {
    pub fn new(store: Arc<dyn Store>, push: Arc<dyn PushDispatcher>) -> Self {
        Self {
            registry: Registry::new(),
            rooms: Rooms::new(),
            presence: PresenceTracker::new(),
            store,
            push,
        }
    }

    pub async fn dispatch(&self, ctx: &SessionContext, event: ClientEvent) {
        match event {
            // Handled during the connection handshake
            ClientEvent::Identify { .. } => {}

            ClientEvent::MessageSend {
                chat_id,
                content,
                kind,
                reply_to,
            } => {
                self.handle_send(ctx, chat_id, content, kind, reply_to)
                    .await
            }

            ClientEvent::MessageReact { message_id, emoji } => {
                self.handle_react(ctx, message_id, emoji).await
            }

            ClientEvent::MessageRead {
                message_id,
                chat_id,
            } => self.handle_read(ctx, message_id, chat_id).await,

            ClientEvent::TypingStart { chat_id } => {
                if !ctx.is_member(chat_id) {
                    self.reject(ctx, "access to chat denied");
                    return;
                }
                self.broadcast_room(
                    chat_id,
                    Some(ctx.user_id),
                    ServerEvent::TypingStart {
                        user_id: ctx.user_id,
                        username: ctx.username.clone(),
                        chat_id,
                    },
                )
                .await;
            }

            ClientEvent::TypingStop { chat_id } => {
                if !ctx.is_member(chat_id) {
                    self.reject(ctx, "access to chat denied");
                    return;
                }
                self.broadcast_room(
                    chat_id,
                    Some(ctx.user_id),
                    ServerEvent::TypingStop {
                        user_id: ctx.user_id,
                        chat_id,
                    },
                )
                .await;
            }

            ClientEvent::UserStatus { status } => self.handle_status(ctx, status).await,
        }
    }

    async fn handle_send(
        &self,
        ctx: &SessionContext,
        chat_id: Uuid,
        content: String,
        kind: parley_types::models::MessageKind,
        reply_to: Option<Uuid>,
    ) {
        // Authorization source of truth is the session's membership cache,
        // not a live re-query; its staleness bounds authorization freshness.
        if !ctx.is_member(chat_id) {
            self.reject(ctx, "access to chat denied");
            return;
        }

        let draft = NewMessage {
            chat_id,
            sender_id: ctx.user_id,
            kind,
            content,
            reply_to,
        };
        let message = match self.blocking(move |s| s.create_message(draft)).await {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: failed to persist message: {}", ctx.user_id, e);
                self.reject(ctx, "failed to send message");
                return;
            }
        };

        // Room fan-out includes the sender so every client renders the
        // message through the same path.
        self.broadcast_room(
            chat_id,
            None,
            ServerEvent::MessageNew {
                message: message.clone(),
                chat_id,
            },
        )
        .await;

        ctx.deliver(ServerEvent::MessageSent {
            message_id: message.id,
            chat_id,
            timestamp: message.created_at,
        });

        self.notify_offline_participants(chat_id, message);
    }

    async fn handle_react(&self, ctx: &SessionContext, message_id: Uuid, emoji: String) {
        let meta = match self.blocking(move |s| s.message_ref(message_id)).await {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => {
                self.reject(ctx, "message not found");
                return;
            }
            Err(e) => {
                warn!("{}: reaction lookup failed: {}", ctx.user_id, e);
                self.reject(ctx, "failed to add reaction");
                return;
            }
        };

        if !ctx.is_member(meta.chat_id) {
            self.reject(ctx, "access to chat denied");
            return;
        }

        let user_id = ctx.user_id;
        let reactions = match self
            .blocking(move |s| s.upsert_reaction(message_id, user_id, emoji))
            .await
        {
            Ok(reactions) => reactions,
            Err(e) => {
                warn!("{}: failed to persist reaction: {}", ctx.user_id, e);
                self.reject(ctx, "failed to add reaction");
                return;
            }
        };

        self.broadcast_room(
            meta.chat_id,
            None,
            ServerEvent::MessageReaction {
                message_id,
                reactions,
                chat_id: meta.chat_id,
            },
        )
        .await;
    }

    async fn handle_read(&self, ctx: &SessionContext, message_id: Uuid, chat_id: Uuid) {
        if !ctx.is_member(chat_id) {
            self.reject(ctx, "access to chat denied");
            return;
        }

        let meta = match self.blocking(move |s| s.message_ref(message_id)).await {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => {
                self.reject(ctx, "message not found");
                return;
            }
            Err(e) => {
                warn!("{}: read-marker lookup failed: {}", ctx.user_id, e);
                self.reject(ctx, "failed to mark message read");
                return;
            }
        };

        let user_id = ctx.user_id;
        if let Err(e) = self
            .blocking(move |s| s.mark_read(message_id, user_id))
            .await
        {
            warn!("{}: failed to persist read marker: {}", ctx.user_id, e);
            self.reject(ctx, "failed to mark message read");
            return;
        }

        // Targeted receipt to the original sender's live session only — no
        // room broadcast, and silently dropped if the sender is offline.
        self.registry
            .send_to_user(
                meta.sender_id,
                ServerEvent::MessageRead {
                    message_id,
                    read_by: ctx.user_id,
                    chat_id: meta.chat_id,
                },
            )
            .await;
    }

    async fn handle_status(&self, ctx: &SessionContext, status: PresenceStatus) {
        let last_seen = Utc::now();
        let user_id = ctx.user_id;
        if let Err(e) = self
            .blocking(move |s| s.update_presence(user_id, status, last_seen))
            .await
        {
            warn!("{}: failed to persist status: {}", ctx.user_id, e);
            self.reject(ctx, "failed to update status");
            return;
        }

        self.presence.set(ctx.user_id, status).await;

        // Presence fans out to every connected session, not just shared
        // chats. Deliberately global, matching the product design.
        self.registry
            .broadcast_all(
                &ServerEvent::UserStatus {
                    user_id: ctx.user_id,
                    status,
                    last_seen,
                },
                Some(ctx.user_id),
            )
            .await;
    }

    /// Deliver an event to every live session in a chat's room, optionally
    /// excluding one user. Targets come from a membership snapshot; no lock
    /// is held while sending.
    pub async fn broadcast_room(&self, chat_id: Uuid, skip: Option<Uuid>, event: ServerEvent) {
        let members = self.rooms.members(chat_id).await;
        for user_id in members {
            if Some(user_id) == skip {
                continue;
            }
            self.registry.send_to_user(user_id, event.clone()).await;
        }
    }

    /// Chat memberships for the connect-time cache. A failure here degrades
    /// the connection to zero rooms instead of terminating it.
    pub async fn load_memberships(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.blocking(move |s| s.load_memberships(user_id)).await
    }

    /// Best-effort presence persistence for connect/disconnect transitions.
    pub async fn persist_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .blocking(move |s| s.update_presence(user_id, status, last_seen))
            .await
        {
            warn!("{}: failed to persist presence: {}", user_id, e);
        }
    }

    /// Typed error event to the originating connection only. Never closes
    /// the connection and never reaches other participants.
    pub fn reject(&self, ctx: &SessionContext, message: &str) {
        ctx.deliver(ServerEvent::Error {
            message: message.to_string(),
        });
    }

    /// Fire-and-forget push notification for persisted participants with no
    /// live session. Failures are logged, never surfaced to the sender.
    fn notify_offline_participants(&self, chat_id: Uuid, message: Message) {
        let router = self.clone();
        tokio::spawn(async move {
            let participants = match router.blocking(move |s| s.chat_participants(chat_id)).await {
                Ok(participants) => participants,
                Err(e) => {
                    warn!("push: could not load participants of {}: {}", chat_id, e);
                    return;
                }
            };

            let mut offline = Vec::new();
            for user_id in participants {
                if user_id != message.sender_id && !router.registry.is_connected(user_id).await {
                    offline.push(user_id);
                }
            }
            if !offline.is_empty() {
                router.push.notify(&offline, &message);
            }
        });
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Storage(anyhow::anyhow!("persistence task failed: {}", e)))?
    }
}
