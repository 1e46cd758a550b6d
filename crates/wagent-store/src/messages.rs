use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, instrument};

use wagent_core::types::{MessageStatus, Role};

use crate::error::{Result, StoreError};
use crate::types::MessageRecord;

/// Manager for the append-only message log.
///
/// `(chat_key, turn, role)` is unique; a conflicting insert is an
/// idempotent replay of a redelivered queue message, not an error.
pub struct MessageStore {
    db: Mutex<Connection>,
}

const SELECT_COLS: &str =
    "chat_key, turn, role, content, status, delivery_ack, created_at";

impl MessageStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Insert one message. Returns `false` when the `(chat_key, turn,
    /// role)` row already existed (replay).
    #[instrument(skip(self, content))]
    pub fn insert(
        &self,
        chat_key: &str,
        turn: i64,
        role: Role,
        content: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "INSERT OR IGNORE INTO messages
             (chat_key, turn, role, content, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![chat_key, turn, role.as_str(), content, status.as_str(), now],
        )?;
        if n == 0 {
            debug!("duplicate (chat_key, turn, role) — treating as replay");
        }
        Ok(n > 0)
    }

    /// Persist a completed user/assistant exchange atomically: the user
    /// message at `turn`, the pending assistant message at `turn + 1`,
    /// and the conversation's `last_turn` in one transaction.
    #[instrument(skip(self, user_text, assistant_text))]
    pub fn insert_exchange(
        &self,
        chat_key: &str,
        turn: i64,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO messages
             (chat_key, turn, role, content, status, created_at)
             VALUES (?1, ?2, 'user', ?3, 'completed', ?4)",
            rusqlite::params![chat_key, turn, user_text, now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO messages
             (chat_key, turn, role, content, status, created_at)
             VALUES (?1, ?2, 'assistant', ?3, 'pending', ?4)",
            rusqlite::params![chat_key, turn + 1, assistant_text, now],
        )?;
        tx.execute(
            "UPDATE conversations
             SET last_turn = MAX(last_turn, ?1), updated_at = ?2
             WHERE chat_key = ?3",
            rusqlite::params![turn + 1, now, chat_key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Update a message's status, optionally replacing its text (used
    /// for partial sends where the text becomes the delivered subset).
    #[instrument(skip(self, new_text))]
    pub fn update_status(
        &self,
        chat_key: &str,
        turn: i64,
        role: Role,
        status: MessageStatus,
        new_text: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = match new_text {
            Some(text) => db.execute(
                "UPDATE messages SET status = ?1, content = ?2
                 WHERE chat_key = ?3 AND turn = ?4 AND role = ?5",
                rusqlite::params![status.as_str(), text, chat_key, turn, role.as_str()],
            )?,
            None => db.execute(
                "UPDATE messages SET status = ?1
                 WHERE chat_key = ?2 AND turn = ?3 AND role = ?4",
                rusqlite::params![status.as_str(), chat_key, turn, role.as_str()],
            )?,
        };
        if n == 0 {
            return Err(StoreError::NotFound(format!(
                "{chat_key} turn {turn} {role}"
            )));
        }
        Ok(())
    }

    /// Best-effort delivery mark from a WAHA `message.ack` event.
    pub fn set_delivery_ack(&self, chat_key: &str, turn: i64, ack: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE messages SET delivery_ack = ?1
             WHERE chat_key = ?2 AND turn = ?3 AND role = 'assistant'",
            rusqlite::params![ack, chat_key, turn],
        )?;
        Ok(())
    }

    /// Fetch a single message row.
    pub fn get(&self, chat_key: &str, turn: i64, role: Role) -> Result<Option<MessageRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!(
                "SELECT {SELECT_COLS} FROM messages
                 WHERE chat_key = ?1 AND turn = ?2 AND role = ?3"
            ),
            rusqlite::params![chat_key, turn, role.as_str()],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// The last `limit` messages of a chat in chronological order.
    pub fn recent(&self, chat_key: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {SELECT_COLS} FROM (
                 SELECT * FROM messages
                 WHERE chat_key = ?1
                 ORDER BY turn DESC, role DESC
                 LIMIT ?2
             ) ORDER BY turn ASC, role ASC",
        ))?;
        let rows = stmt.query_map(rusqlite::params![chat_key, limit as i64], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MessageRecord>> {
    let role_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let parsed = role_str
        .parse::<Role>()
        .and_then(|role| status_str.parse::<MessageStatus>().map(|status| (role, status)));
    Ok(match parsed {
        Err(e) => Err(StoreError::CorruptColumn(e)),
        Ok((role, status)) => Ok(MessageRecord {
            chat_key: row.get(0)?,
            turn: row.get(1)?,
            role,
            content: row.get(3)?,
            status,
            delivery_ack: row.get(5)?,
            created_at: row.get(6)?,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationStore;
    use crate::db;
    use tempfile::NamedTempFile;

    fn stores() -> (MessageStore, ConversationStore, NamedTempFile) {
        // Exchange updates the conversations table, so both managers
        // need to see the same database file.
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let messages = MessageStore::new(db::open(path).unwrap());
        let conversations = ConversationStore::new(db::open(path).unwrap());
        (messages, conversations, file)
    }

    #[test]
    fn duplicate_insert_is_replay() {
        let (m, _c, _f) = stores();
        assert!(m
            .insert("u1:wa1:c1", 0, Role::User, "hi", MessageStatus::Completed)
            .unwrap());
        assert!(!m
            .insert("u1:wa1:c1", 0, Role::User, "hi again", MessageStatus::Completed)
            .unwrap());
        // Original content wins.
        assert_eq!(m.get("u1:wa1:c1", 0, Role::User).unwrap().unwrap().content, "hi");
    }

    #[test]
    fn exchange_is_atomic_and_advances_turn() {
        let (m, c, _f) = stores();
        c.get_or_create("u1:wa1:c1", "s1").unwrap();
        m.insert_exchange("u1:wa1:c1", 0, "question", "answer").unwrap();

        let user = m.get("u1:wa1:c1", 0, Role::User).unwrap().unwrap();
        let assistant = m.get("u1:wa1:c1", 1, Role::Assistant).unwrap().unwrap();
        assert_eq!(user.status, MessageStatus::Completed);
        assert_eq!(assistant.status, MessageStatus::Pending);
        assert_eq!(c.get("u1:wa1:c1").unwrap().unwrap().last_turn, 1);

        // Redelivery replays without duplicating or regressing.
        m.insert_exchange("u1:wa1:c1", 0, "question", "answer").unwrap();
        assert_eq!(c.get("u1:wa1:c1").unwrap().unwrap().last_turn, 1);
        assert_eq!(m.recent("u1:wa1:c1", 10).unwrap().len(), 2);
    }

    #[test]
    fn partial_update_replaces_text() {
        let (m, _c, _f) = stores();
        m.insert("u1:wa1:c1", 1, Role::Assistant, "a\n\nb\n\nc", MessageStatus::Pending)
            .unwrap();
        m.update_status("u1:wa1:c1", 1, Role::Assistant, MessageStatus::Partial, Some("a\n\nb"))
            .unwrap();
        let rec = m.get("u1:wa1:c1", 1, Role::Assistant).unwrap().unwrap();
        assert_eq!(rec.status, MessageStatus::Partial);
        assert_eq!(rec.content, "a\n\nb");
    }

    #[test]
    fn recent_is_chronological() {
        let (m, _c, _f) = stores();
        for turn in 0..6i64 {
            m.insert("u1:wa1:c1", turn, Role::User, &format!("u{turn}"), MessageStatus::Completed)
                .unwrap();
            m.insert(
                "u1:wa1:c1",
                turn + 1,
                Role::Assistant,
                &format!("a{turn}"),
                MessageStatus::Sent,
            )
            .unwrap();
        }
        let recent = m.recent("u1:wa1:c1", 4).unwrap();
        assert_eq!(recent.len(), 4);
        for pair in recent.windows(2) {
            assert!(pair[0].turn <= pair[1].turn);
        }
    }
}
