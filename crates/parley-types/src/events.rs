use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageKind, PresenceStatus, Reaction};

/// Events sent FROM client TO server over the WebSocket gateway.
/// Wire names follow the `namespace:action` convention of the mobile clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// Authenticate the connection. Must be the first frame.
    #[serde(rename = "identify")]
    Identify { token: String },

    #[serde(rename = "message:send", rename_all = "camelCase")]
    MessageSend {
        chat_id: Uuid,
        content: String,
        #[serde(rename = "type", default)]
        kind: MessageKind,
        #[serde(default)]
        reply_to: Option<Uuid>,
    },

    #[serde(rename = "message:react", rename_all = "camelCase")]
    MessageReact { message_id: Uuid, emoji: String },

    #[serde(rename = "message:read", rename_all = "camelCase")]
    MessageRead { message_id: Uuid, chat_id: Uuid },

    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart { chat_id: Uuid },

    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { chat_id: Uuid },

    #[serde(rename = "user:status")]
    UserStatus { status: PresenceStatus },
}

/// Events sent FROM server TO clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Server confirms successful authentication.
    #[serde(rename = "ready", rename_all = "camelCase")]
    Ready { user_id: Uuid, username: String },

    /// A new message was posted; delivered to every live session in the
    /// chat's room, the sender included.
    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew { message: Message, chat_id: Uuid },

    /// Delivery acknowledgement, sent to the originator only.
    #[serde(rename = "message:sent", rename_all = "camelCase")]
    MessageSent {
        message_id: Uuid,
        chat_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Full updated reaction set for a message, delivered to the room.
    #[serde(rename = "message:reaction", rename_all = "camelCase")]
    MessageReaction {
        message_id: Uuid,
        reactions: Vec<Reaction>,
        chat_id: Uuid,
    },

    /// A message's content changed via the REST edit endpoint.
    #[serde(rename = "message:edited", rename_all = "camelCase")]
    MessageEdited { message: Message, chat_id: Uuid },

    /// A message was soft-deleted; clients render the tombstone in place.
    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted { message_id: Uuid, chat_id: Uuid },

    /// Read receipt, targeted at the message's original sender only.
    #[serde(rename = "message:read", rename_all = "camelCase")]
    MessageRead {
        message_id: Uuid,
        read_by: Uuid,
        chat_id: Uuid,
    },

    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart {
        user_id: Uuid,
        username: String,
        chat_id: Uuid,
    },

    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { user_id: Uuid, chat_id: Uuid },

    /// Presence transition, delivered to every other connected session.
    #[serde(rename = "user:status", rename_all = "camelCase")]
    UserStatus {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },

    /// Validation or persistence failure, delivered to the originating
    /// connection only. Never closes the connection.
    #[serde(rename = "message:error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_wire_names() {
        let json = r#"{"type":"message:send","data":{"chatId":"6a6f1f64-9861-4c0b-9de9-0a4c1e2f3b4c","content":"hi"}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::MessageSend {
                content,
                kind,
                reply_to,
                ..
            } => {
                assert_eq!(content, "hi");
                assert_eq!(kind, MessageKind::Text); // defaults when omitted
                assert!(reply_to.is_none());
            }
            other => panic!("decoded wrong variant: {:?}", other),
        }
    }

    #[test]
    fn server_error_wire_shape() {
        let event = ServerEvent::Error {
            message: "access to chat denied".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message:error");
        assert_eq!(json["data"]["message"], "access to chat denied");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(PresenceStatus::Away).unwrap();
        assert_eq!(json, "away");
    }
}
