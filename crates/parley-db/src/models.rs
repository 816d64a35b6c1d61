/// Database row types — these map directly to SQLite rows.
/// Distinct from the parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub status: String,
    pub last_seen: String,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub owner_id: Option<String>,
    pub created_at: String,
}

pub struct ParticipantRow {
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub status: String,
    pub last_seen: String,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub kind: String,
    pub content: String,
    pub reply_to: Option<String>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub is_pinned: bool,
    pub created_at: String,
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}
