use std::sync::Mutex;

use rusqlite::Connection;
use tracing::instrument;

use crate::error::Result;
use crate::types::BufferSnapshot;

/// Persistence for merge-buffer snapshots.
///
/// The merger writes a snapshot after every buffer mutation and deletes
/// it on flush, so a crashed process can re-arm its windows on startup
/// without losing buffered messages.
pub struct BufferStore {
    db: Mutex<Connection>,
}

impl BufferStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Upsert the snapshot for one chat.
    #[instrument(skip(self, snapshot), fields(chat_key = %snapshot.chat_key))]
    pub fn save(&self, snapshot: &BufferSnapshot) -> Result<()> {
        let messages = serde_json::to_string(&snapshot.messages)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO merge_buffers
             (chat_key, session_id, agent_id, messages, started_at_ms, last_message_at_ms, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(chat_key) DO UPDATE SET
                 session_id = excluded.session_id,
                 agent_id = excluded.agent_id,
                 messages = excluded.messages,
                 started_at_ms = excluded.started_at_ms,
                 last_message_at_ms = excluded.last_message_at_ms,
                 updated_at = excluded.updated_at",
            rusqlite::params![
                snapshot.chat_key,
                snapshot.session_id,
                snapshot.agent_id,
                messages,
                snapshot.started_at_ms,
                snapshot.last_message_at_ms,
                now
            ],
        )?;
        Ok(())
    }

    /// Remove the snapshot after a successful flush.
    pub fn delete(&self, chat_key: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM merge_buffers WHERE chat_key = ?1",
            rusqlite::params![chat_key],
        )?;
        Ok(())
    }

    /// All persisted snapshots, for startup rehydration.
    pub fn load_all(&self) -> Result<Vec<BufferSnapshot>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT chat_key, session_id, agent_id, messages, started_at_ms, last_message_at_ms
             FROM merge_buffers",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (chat_key, session_id, agent_id, messages_json, started_at_ms, last_message_at_ms) =
                row?;
            let messages = serde_json::from_str(&messages_json)?;
            out.push(BufferSnapshot {
                chat_key,
                session_id,
                agent_id,
                messages,
                started_at_ms,
                last_message_at_ms,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::types::BufferedMessage;

    fn snapshot(chat_key: &str) -> BufferSnapshot {
        BufferSnapshot {
            chat_key: chat_key.to_string(),
            session_id: "s1".to_string(),
            agent_id: None,
            messages: vec![BufferedMessage {
                message_id: "m1".to_string(),
                text: "你好".to_string(),
                timestamp_ms: 1000,
                has_media: false,
            }],
            started_at_ms: 1000,
            last_message_at_ms: 1000,
        }
    }

    #[test]
    fn save_load_delete() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        let s = BufferStore::new(conn);

        s.save(&snapshot("u1:wa1:c1")).unwrap();
        s.save(&snapshot("u1:wa1:c2")).unwrap();

        let mut updated = snapshot("u1:wa1:c1");
        updated.messages.push(BufferedMessage {
            message_id: "m2".to_string(),
            text: "我想".to_string(),
            timestamp_ms: 1300,
            has_media: false,
        });
        updated.last_message_at_ms = 1300;
        s.save(&updated).unwrap();

        let all = s.load_all().unwrap();
        assert_eq!(all.len(), 2);
        let one = all.iter().find(|b| b.chat_key == "u1:wa1:c1").unwrap();
        assert_eq!(one.messages.len(), 2);
        assert_eq!(one.last_message_at_ms, 1300);

        s.delete("u1:wa1:c1").unwrap();
        assert_eq!(s.load_all().unwrap().len(), 1);
    }
}
