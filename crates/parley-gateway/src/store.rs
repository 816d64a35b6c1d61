use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use parley_types::models::{Message, MessageKind, PresenceStatus, Reaction};

/// Storage failures surfaced to the router. `NotFound` maps to a validation
/// error event; `Storage` covers everything the backend could not complete.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: String,
    pub reply_to: Option<Uuid>,
}

/// Routing metadata for an existing message.
#[derive(Debug, Clone, Copy)]
pub struct MessageRef {
    pub chat_id: Uuid,
    pub sender_id: Uuid,
}

/// Persistence collaborator consumed by the realtime core. Methods are
/// blocking (rusqlite underneath) — the router always invokes them through
/// `tokio::task::spawn_blocking` and never holds a registry or room lock
/// across the call.
pub trait Store: Send + Sync {
    fn create_message(&self, draft: NewMessage) -> Result<Message, StoreError>;
    fn message_ref(&self, message_id: Uuid) -> Result<MessageRef, StoreError>;
    fn upsert_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    ) -> Result<Vec<Reaction>, StoreError>;
    fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;
    fn load_memberships(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
    fn chat_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
    fn update_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

impl Store for parley_db::Database {
    fn create_message(&self, draft: NewMessage) -> Result<Message, StoreError> {
        let id = Uuid::new_v4();
        let kind = kind_str(draft.kind);
        self.insert_message(
            &id.to_string(),
            &draft.chat_id.to_string(),
            &draft.sender_id.to_string(),
            kind,
            &draft.content,
            draft.reply_to.map(|r| r.to_string()).as_deref(),
        )?;
        let row = self
            .get_message(&id.to_string())?
            .ok_or(StoreError::NotFound("message"))?;
        Ok(message_from_row(row))
    }

    fn message_ref(&self, message_id: Uuid) -> Result<MessageRef, StoreError> {
        let (chat_id, sender_id) = self
            .message_meta(&message_id.to_string())?
            .ok_or(StoreError::NotFound("message"))?;
        Ok(MessageRef {
            chat_id: parse_uuid(&chat_id, "chat_id"),
            sender_id: parse_uuid(&sender_id, "sender_id"),
        })
    }

    fn upsert_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    ) -> Result<Vec<Reaction>, StoreError> {
        let rows = parley_db::Database::upsert_reaction(
            self,
            &message_id.to_string(),
            &user_id.to_string(),
            &emoji,
        )?;
        Ok(rows
            .into_iter()
            .map(|r| Reaction {
                user_id: parse_uuid(&r.user_id, "user_id"),
                emoji: r.emoji,
                timestamp: parse_timestamp(&r.created_at),
            })
            .collect())
    }

    fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        parley_db::Database::mark_read(self, &message_id.to_string(), &user_id.to_string())?;
        Ok(())
    }

    fn load_memberships(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids = parley_db::Database::load_memberships(self, &user_id.to_string())?;
        Ok(ids.iter().map(|id| parse_uuid(id, "chat_id")).collect())
    }

    fn chat_participants(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids = self.chat_participant_ids(&chat_id.to_string())?;
        Ok(ids.iter().map(|id| parse_uuid(id, "user_id")).collect())
    }

    fn update_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        parley_db::Database::update_presence(
            self,
            &user_id.to_string(),
            status_str(status),
            &last_seen.to_rfc3339(),
        )?;
        Ok(())
    }
}

pub fn message_from_row(row: parley_db::models::MessageRow) -> Message {
    Message {
        id: parse_uuid(&row.id, "message id"),
        chat_id: parse_uuid(&row.chat_id, "chat_id"),
        sender_id: parse_uuid(&row.sender_id, "sender_id"),
        sender_username: row.sender_username,
        kind: kind_from_str(&row.kind),
        content: row.content,
        reply_to: row.reply_to.as_deref().map(|r| parse_uuid(r, "reply_to")),
        is_edited: row.is_edited,
        is_pinned: row.is_pinned,
        is_deleted: row.is_deleted,
        created_at: parse_timestamp(&row.created_at),
    }
}

pub fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::Video => "video",
        MessageKind::Audio => "audio",
        MessageKind::File => "file",
        MessageKind::Location => "location",
        MessageKind::Contact => "contact",
        MessageKind::Sticker => "sticker",
        MessageKind::Voice => "voice",
        MessageKind::Deleted => "deleted",
    }
}

fn kind_from_str(s: &str) -> MessageKind {
    match s {
        "text" => MessageKind::Text,
        "image" => MessageKind::Image,
        "video" => MessageKind::Video,
        "audio" => MessageKind::Audio,
        "file" => MessageKind::File,
        "location" => MessageKind::Location,
        "contact" => MessageKind::Contact,
        "sticker" => MessageKind::Sticker,
        "voice" => MessageKind::Voice,
        "deleted" => MessageKind::Deleted,
        other => {
            warn!("Unknown message kind '{}', treating as text", other);
            MessageKind::Text
        }
    }
}

pub fn status_str(status: PresenceStatus) -> &'static str {
    match status {
        PresenceStatus::Online => "online",
        PresenceStatus::Offline => "offline",
        PresenceStatus::Away => "away",
        PresenceStatus::Busy => "busy",
    }
}

pub fn status_from_str(s: &str) -> PresenceStatus {
    match s {
        "online" => PresenceStatus::Online,
        "offline" => PresenceStatus::Offline,
        "away" => PresenceStatus::Away,
        "busy" => PresenceStatus::Busy,
        other => {
            warn!("Unknown presence status '{}', treating as offline", other);
            PresenceStatus::Offline
        }
    }
}

pub fn parse_uuid(s: &str, what: &str) -> Uuid {
    s.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, s, e);
        Uuid::default()
    })
}

/// SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS" without timezone;
/// RFC 3339 values appear where we wrote them ourselves. Accept both.
pub fn parse_timestamp(s: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", s, e);
            DateTime::default()
        })
}
