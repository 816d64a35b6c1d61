use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'offline',
            is_online   INTEGER NOT NULL DEFAULT 0,
            last_seen   TEXT NOT NULL DEFAULT (datetime('now')),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL CHECK (kind IN ('private', 'group', 'channel')),
            name        TEXT,
            owner_id    TEXT REFERENCES users(id),
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chat_participants (
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            role        TEXT NOT NULL DEFAULT 'member',
            is_active   INTEGER NOT NULL DEFAULT 1,
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON chat_participants(user_id, is_active);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            sender_id   TEXT NOT NULL REFERENCES users(id),
            kind        TEXT NOT NULL DEFAULT 'text',
            content     TEXT NOT NULL,
            reply_to    TEXT REFERENCES messages(id),
            is_edited   INTEGER NOT NULL DEFAULT 0,
            is_deleted  INTEGER NOT NULL DEFAULT 0,
            deleted_at  TEXT,
            is_pinned   INTEGER NOT NULL DEFAULT 0,
            pinned_by   TEXT REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at);

        -- Append-only prior-content history for edited messages
        CREATE TABLE IF NOT EXISTS message_edits (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            content     TEXT NOT NULL,
            edited_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One reaction per user per message; re-reacting overwrites
        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
