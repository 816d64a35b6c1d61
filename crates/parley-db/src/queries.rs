use crate::Database;
use crate::models::{ChatRow, MessageRow, ParticipantRow, ReactionRow, UserRow};
use anyhow::{Result, anyhow};
use parley_types::models::TOMBSTONE_CONTENT;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn update_presence(&self, user_id: &str, status: &str, last_seen: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET status = ?2, is_online = ?3, last_seen = ?4 WHERE id = ?1",
                rusqlite::params![user_id, status, (status == "online") as i64, last_seen],
            )?;
            if changed == 0 {
                return Err(anyhow!("User not found: {}", user_id));
            }
            Ok(())
        })
    }

    // -- Chats --

    pub fn create_chat(
        &self,
        id: &str,
        kind: &str,
        name: Option<&str>,
        owner_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chats (id, kind, name, owner_id) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, kind, name, owner_id],
            )?;
            Ok(())
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT id, kind, name, owner_id, created_at FROM chats
                 WHERE id = ?1 AND is_active = 1",
            )?
            .query_row([id], |row| {
                Ok(ChatRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    name: row.get(2)?,
                    owner_id: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .optional()
        })
    }

    pub fn add_participant(&self, chat_id: &str, user_id: &str, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_participants (chat_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id, user_id) DO UPDATE SET is_active = 1, role = excluded.role",
                (chat_id, user_id, role),
            )?;
            Ok(())
        })
    }

    pub fn remove_participant(&self, chat_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chat_participants SET is_active = 0 WHERE chat_id = ?1 AND user_id = ?2",
                (chat_id, user_id),
            )?;
            Ok(())
        })
    }

    /// Find an existing private chat between two users, if one exists.
    pub fn find_private_chat(&self, user_a: &str, user_b: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.prepare(
                "SELECT c.id FROM chats c
                 INNER JOIN chat_participants p1 ON c.id = p1.chat_id
                 INNER JOIN chat_participants p2 ON c.id = p2.chat_id
                 WHERE c.kind = 'private' AND c.is_active = 1
                 AND p1.user_id = ?1 AND p2.user_id = ?2
                 AND p1.is_active = 1 AND p2.is_active = 1",
            )?
            .query_row([user_a, user_b], |row| row.get(0))
            .optional()
        })
    }

    pub fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT c.id, c.kind, c.name, c.owner_id, c.created_at
                 FROM chats c
                 INNER JOIN chat_participants cp ON c.id = cp.chat_id
                 WHERE cp.user_id = ?1 AND c.is_active = 1 AND cp.is_active = 1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ChatRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        name: row.get(2)?,
                        owner_id: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_participants(&self, chat_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, cp.role, u.status, u.last_seen
                 FROM chat_participants cp
                 INNER JOIN users u ON cp.user_id = u.id
                 WHERE cp.chat_id = ?1 AND cp.is_active = 1",
            )?;
            let rows = stmt
                .query_map([chat_id], |row| {
                    Ok(ParticipantRow {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        role: row.get(2)?,
                        status: row.get(3)?,
                        last_seen: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Active participant ids of a chat (for push-notification targeting).
    pub fn chat_participant_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM chat_participants WHERE chat_id = ?1 AND is_active = 1",
            )?;
            let rows = stmt
                .query_map([chat_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_participant(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .prepare(
                    "SELECT 1 FROM chat_participants
                     WHERE chat_id = ?1 AND user_id = ?2 AND is_active = 1",
                )?
                .query_row([chat_id, user_id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn is_admin(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let role: Option<String> = conn
                .prepare(
                    "SELECT role FROM chat_participants
                     WHERE chat_id = ?1 AND user_id = ?2 AND is_active = 1",
                )?
                .query_row([chat_id, user_id], |row| row.get(0))
                .optional()?;
            Ok(matches!(role.as_deref(), Some("admin") | Some("owner")))
        })
    }

    /// Chat ids of every active chat the user participates in. Loaded once
    /// per connection to seed the session's membership cache.
    pub fn load_memberships(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM chats c
                 INNER JOIN chat_participants cp ON c.id = cp.chat_id
                 WHERE cp.user_id = ?1 AND c.is_active = 1 AND cp.is_active = 1",
            )?;
            let rows = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        chat_id: &str,
        sender_id: &str,
        kind: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender_id, kind, content, reply_to)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, chat_id, sender_id, kind, content, reply_to],
            )?;
            conn.execute(
                "UPDATE chats SET updated_at = datetime('now') WHERE id = ?1",
                [chat_id],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.prepare(&format!("{MESSAGE_SELECT} WHERE m.id = ?1"))?
                .query_row([id], map_message_row)
                .optional()
        })
    }

    /// Routing metadata only: (chat_id, sender_id). Cheaper than a full fetch
    /// for membership checks and read-receipt targeting.
    pub fn message_meta(&self, id: &str) -> Result<Option<(String, String)>> {
        self.with_conn(|conn| {
            conn.prepare("SELECT chat_id, sender_id FROM messages WHERE id = ?1")?
                .query_row([id], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()
        })
    }

    /// Newest-first page of a chat's history. Soft-deleted rows are included
    /// as tombstones so ordering stays stable for all readers.
    pub fn get_chat_messages(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let (sql, params): (String, Vec<&dyn rusqlite::types::ToSql>) = match before {
                Some(ref cursor) => (
                    format!(
                        "{MESSAGE_SELECT} WHERE m.chat_id = ?1 AND m.created_at < ?2
                         ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?3"
                    ),
                    vec![&chat_id, cursor, &limit],
                ),
                None => (
                    format!(
                        "{MESSAGE_SELECT} WHERE m.chat_id = ?1
                         ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?2"
                    ),
                    vec![&chat_id, &limit],
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params.as_slice(), map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replace a message's content, appending the prior content to the
    /// append-only edit history.
    pub fn edit_message(&self, id: &str, new_content: &str) -> Result<()> {
        self.with_conn(|conn| {
            let prior: Option<String> = conn
                .prepare("SELECT content FROM messages WHERE id = ?1 AND is_deleted = 0")?
                .query_row([id], |row| row.get(0))
                .optional()?;
            let prior = prior.ok_or_else(|| anyhow!("Message not found: {}", id))?;

            conn.execute(
                "INSERT INTO message_edits (message_id, content) VALUES (?1, ?2)",
                (id, prior),
            )?;
            conn.execute(
                "UPDATE messages SET content = ?2, is_edited = 1 WHERE id = ?1",
                (id, new_content),
            )?;
            Ok(())
        })
    }

    /// Soft delete: the row keeps its id and ordering position, the content
    /// is replaced with the tombstone marker.
    pub fn soft_delete_message(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET is_deleted = 1, deleted_at = datetime('now'),
                     content = ?2, kind = 'deleted'
                 WHERE id = ?1 AND is_deleted = 0",
                (id, TOMBSTONE_CONTENT),
            )?;
            if changed == 0 {
                return Err(anyhow!("Message not found: {}", id));
            }
            Ok(())
        })
    }

    pub fn set_pinned(&self, id: &str, pinned: bool, pinned_by: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_pinned = ?2, pinned_by = ?3
                 WHERE id = ?1 AND is_deleted = 0",
                rusqlite::params![id, pinned as i64, pinned_by],
            )?;
            if changed == 0 {
                return Err(anyhow!("Message not found: {}", id));
            }
            Ok(())
        })
    }

    // -- Reactions --

    /// Upsert keyed by (message, user): a second reaction from the same user
    /// overwrites the first. Returns the full updated reaction set.
    pub fn upsert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Vec<ReactionRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?1, ?2, ?3)
                 ON CONFLICT(message_id, user_id)
                 DO UPDATE SET emoji = excluded.emoji, created_at = datetime('now')",
                (message_id, user_id, emoji),
            )?;
            query_reactions(conn, message_id)
        })
    }

    pub fn reactions_for_message(&self, message_id: &str) -> Result<Vec<ReactionRow>> {
        self.with_conn(|conn| query_reactions(conn, message_id))
    }

    /// Batch-fetch reactions for a set of message ids (history pages).
    pub fn reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, emoji, created_at FROM reactions
                 WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), map_reaction_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Read markers --

    /// Idempotent: re-marking an already-read message is a no-op.
    pub fn mark_read(&self, message_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?1, ?2)",
                (message_id, user_id),
            )?;
            Ok(())
        })
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.chat_id, m.sender_id, u.username,
        m.kind, m.content, m.reply_to, m.is_edited, m.is_deleted, m.is_pinned, m.created_at
     FROM messages m
     LEFT JOIN users u ON m.sender_id = u.id";

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        kind: row.get(4)?,
        content: row.get(5)?,
        reply_to: row.get(6)?,
        is_edited: row.get(7)?,
        is_deleted: row.get(8)?,
        is_pinned: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    conn.prepare(&format!(
        "SELECT id, username, password, status, last_seen, created_at
         FROM users WHERE {} = ?1",
        column
    ))?
    .query_row([value], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            username: row.get(1)?,
            password: row.get(2)?,
            status: row.get(3)?,
            last_seen: row.get(4)?,
            created_at: row.get(5)?,
        })
    })
    .optional()
}

fn map_reaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReactionRow> {
    Ok(ReactionRow {
        message_id: row.get(0)?,
        user_id: row.get(1)?,
        emoji: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn query_reactions(conn: &Connection, message_id: &str) -> Result<Vec<ReactionRow>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, user_id, emoji, created_at FROM reactions
         WHERE message_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map([message_id], map_reaction_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Database;
    use parley_types::models::TOMBSTONE_CONTENT;

    fn db_with_chat() -> (Database, String, String, String) {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u-alice", "alice", "hash").unwrap();
        db.create_user("u-bob", "bob", "hash").unwrap();
        db.create_chat("c1", "private", None, None).unwrap();
        db.add_participant("c1", "u-alice", "member").unwrap();
        db.add_participant("c1", "u-bob", "member").unwrap();
        (db, "c1".into(), "u-alice".into(), "u-bob".into())
    }

    #[test]
    fn user_lookup_by_username_and_id() {
        let (db, _, alice, _) = db_with_chat();

        let by_name = db.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, alice);
        assert_eq!(by_name.password, "hash");
        assert_eq!(by_name.status, "offline");

        let by_id = db.get_user_by_id(&alice).unwrap().unwrap();
        assert_eq!(by_id.username, "alice");

        assert!(db.get_user_by_username("nobody").unwrap().is_none());
        assert!(db.get_user_by_id("u-nobody").unwrap().is_none());
    }

    #[test]
    fn memberships_reflect_active_participation() {
        let (db, chat, alice, bob) = db_with_chat();
        assert_eq!(db.load_memberships(&alice).unwrap(), vec![chat.clone()]);

        db.remove_participant(&chat, &bob).unwrap();
        assert!(db.load_memberships(&bob).unwrap().is_empty());
        assert!(!db.is_participant(&chat, &bob).unwrap());

        // rejoin reactivates the same row
        db.add_participant(&chat, &bob, "member").unwrap();
        assert!(db.is_participant(&chat, &bob).unwrap());
    }

    #[test]
    fn tombstone_keeps_identity_and_position() {
        let (db, chat, alice, _) = db_with_chat();
        db.insert_message("m1", &chat, &alice, "text", "first", None)
            .unwrap();
        db.insert_message("m2", &chat, &alice, "text", "second", None)
            .unwrap();

        db.soft_delete_message("m1").unwrap();

        let m1 = db.get_message("m1").unwrap().unwrap();
        assert!(m1.is_deleted);
        assert_eq!(m1.content, TOMBSTONE_CONTENT);
        assert_eq!(m1.kind, "deleted");

        let page = db.get_chat_messages(&chat, 50, None).unwrap();
        let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]); // deleted row still holds its slot

        // deleting twice is an error, not a silent overwrite
        assert!(db.soft_delete_message("m1").is_err());
    }

    #[test]
    fn edit_appends_prior_content() {
        let (db, chat, alice, _) = db_with_chat();
        db.insert_message("m1", &chat, &alice, "text", "helo", None)
            .unwrap();
        db.edit_message("m1", "hello").unwrap();
        db.edit_message("m1", "hello!").unwrap();

        let m = db.get_message("m1").unwrap().unwrap();
        assert!(m.is_edited);
        assert_eq!(m.content, "hello!");

        let history: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT content FROM message_edits WHERE message_id = 'm1' ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(history, vec!["helo", "hello"]);
    }

    #[test]
    fn reaction_upsert_is_last_write_wins() {
        let (db, chat, alice, bob) = db_with_chat();
        db.insert_message("m1", &chat, &alice, "text", "hi", None)
            .unwrap();

        db.upsert_reaction("m1", &bob, "👍").unwrap();
        let set = db.upsert_reaction("m1", &bob, "❤️").unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].emoji, "❤️");

        db.upsert_reaction("m1", &alice, "👍").unwrap();
        assert_eq!(db.reactions_for_message("m1").unwrap().len(), 2);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (db, chat, alice, bob) = db_with_chat();
        db.insert_message("m1", &chat, &alice, "text", "hi", None)
            .unwrap();

        db.mark_read("m1", &bob).unwrap();
        db.mark_read("m1", &bob).unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM message_reads WHERE message_id = 'm1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn private_chat_lookup_finds_existing_pair() {
        let (db, chat, alice, bob) = db_with_chat();
        assert_eq!(db.find_private_chat(&alice, &bob).unwrap(), Some(chat));
        assert_eq!(db.find_private_chat(&alice, "u-nobody").unwrap(), None);
    }
}
