use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::types::ConversationRecord;

/// Manager for per-ChatKey conversation rows.
pub struct ConversationStore {
    db: Mutex<Connection>,
}

impl ConversationStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Return the conversation for a ChatKey, creating it lazily on
    /// first contact (upsert pattern).
    #[instrument(skip(self))]
    pub fn get_or_create(&self, chat_key: &str, session_id: &str) -> Result<ConversationRecord> {
        if let Some(conv) = self.get(chat_key)? {
            debug!("conversation exists");
            return Ok(conv);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO conversations
             (chat_key, session_id, last_turn, auto_reply, created_at, updated_at)
             VALUES (?1, ?2, 0, 1, ?3, ?3)",
            rusqlite::params![chat_key, session_id, now],
        )?;

        // Read back — handles the race where two tasks insert simultaneously
        let conv = db.query_row(
            "SELECT chat_key, session_id, last_turn, auto_reply, created_at, updated_at
             FROM conversations WHERE chat_key = ?1",
            rusqlite::params![chat_key],
            row_to_conversation,
        )?;
        Ok(conv)
    }

    /// Fetch a conversation, `None` if it has never been created.
    pub fn get(&self, chat_key: &str) -> Result<Option<ConversationRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT chat_key, session_id, last_turn, auto_reply, created_at, updated_at
             FROM conversations WHERE chat_key = ?1",
            rusqlite::params![chat_key],
            row_to_conversation,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Set the conversation-level auto-reply flag. Idempotent.
    #[instrument(skip(self))]
    pub fn set_auto_reply(&self, chat_key: &str, session_id: &str, enabled: bool) -> Result<()> {
        // The row may not exist yet when a pause arrives before any
        // normal message; create it so the flag has somewhere to live.
        self.get_or_create(chat_key, session_id)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations SET auto_reply = ?1, updated_at = ?2 WHERE chat_key = ?3",
            rusqlite::params![enabled as i64, now, chat_key],
        )?;
        Ok(())
    }

    /// Advance `last_turn`. The MAX guard keeps the column monotonic
    /// even under redelivered queue messages.
    #[instrument(skip(self))]
    pub fn advance_turn(&self, chat_key: &str, turn: i64) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE conversations
             SET last_turn = MAX(last_turn, ?1), updated_at = ?2
             WHERE chat_key = ?3",
            rusqlite::params![turn, now, chat_key],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(chat_key.to_string()));
        }
        Ok(())
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        chat_key: row.get(0)?,
        session_id: row.get(1)?,
        last_turn: row.get(2)?,
        auto_reply: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn store() -> ConversationStore {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        ConversationStore::new(conn)
    }

    #[test]
    fn lazy_create_once() {
        let s = store();
        let a = s.get_or_create("u1:wa1:c1", "s1").unwrap();
        let b = s.get_or_create("u1:wa1:c1", "s1").unwrap();
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(a.last_turn, 0);
        assert!(a.auto_reply);
    }

    #[test]
    fn last_turn_is_monotonic() {
        let s = store();
        s.get_or_create("u1:wa1:c1", "s1").unwrap();
        s.advance_turn("u1:wa1:c1", 3).unwrap();
        // A redelivered message with an older turn must not move it back.
        s.advance_turn("u1:wa1:c1", 1).unwrap();
        assert_eq!(s.get("u1:wa1:c1").unwrap().unwrap().last_turn, 3);
        s.advance_turn("u1:wa1:c1", 4).unwrap();
        assert_eq!(s.get("u1:wa1:c1").unwrap().unwrap().last_turn, 4);
    }

    #[test]
    fn pause_before_first_message_creates_row() {
        let s = store();
        s.set_auto_reply("u1:wa1:c9", "s1", false).unwrap();
        let conv = s.get("u1:wa1:c9").unwrap().unwrap();
        assert!(!conv.auto_reply);
        assert_eq!(conv.last_turn, 0);
    }
}
