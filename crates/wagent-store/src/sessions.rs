use std::sync::Mutex;

use rusqlite::Connection;
use tracing::instrument;
use uuid::Uuid;

use wagent_core::types::ConnectionStatus;

use crate::error::{Result, StoreError};
use crate::types::SessionRecord;

/// Thread-safe manager for tenant WhatsApp-account sessions.
///
/// Wraps a single SQLite connection in a `Mutex`, matching the other
/// store managers; sufficient for the single-node target.
pub struct SessionStore {
    db: Mutex<Connection>,
}

const SELECT_COLS: &str = "id, user_id, wa_account_id, endpoint_url, api_key_sealed,
       webhook_secret, status, auto_reply, agent_id, created_at, updated_at";

impl SessionStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Create a session row at onboarding time. The WAHA API key must
    /// already be sealed by the caller.
    #[instrument(skip(self, api_key_sealed, webhook_secret))]
    pub fn create(
        &self,
        user_id: &str,
        wa_account_id: &str,
        endpoint_url: &str,
        api_key_sealed: &str,
        webhook_secret: &str,
        agent_id: Option<&str>,
    ) -> Result<SessionRecord> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions
             (id, user_id, wa_account_id, endpoint_url, api_key_sealed,
              webhook_secret, status, auto_reply, agent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'connecting', 1, ?7, ?8, ?8)",
            rusqlite::params![
                id,
                user_id,
                wa_account_id,
                endpoint_url,
                api_key_sealed,
                webhook_secret,
                agent_id,
                now
            ],
        )?;
        drop(db);
        self.get_by_account(wa_account_id)?
            .ok_or_else(|| StoreError::NotFound(wa_account_id.to_string()))
    }

    /// Look up the session for a WAHA account id. `None` when unknown.
    pub fn get_by_account(&self, wa_account_id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {SELECT_COLS} FROM sessions WHERE wa_account_id = ?1"),
            rusqlite::params![wa_account_id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Look up a session by primary key.
    pub fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {SELECT_COLS} FROM sessions WHERE id = ?1"),
            rusqlite::params![session_id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Update the WAHA connection status (driven by `session.status` events).
    #[instrument(skip(self))]
    pub fn set_status(&self, wa_account_id: &str, status: ConnectionStatus) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE wa_account_id = ?3",
            rusqlite::params![status.as_str(), now, wa_account_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(wa_account_id.to_string()));
        }
        Ok(())
    }

    /// Set the session-level auto-reply flag. Idempotent (set-to-value).
    #[instrument(skip(self))]
    pub fn set_auto_reply(&self, session_id: &str, enabled: bool) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE sessions SET auto_reply = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![enabled as i64, now, session_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Remove a session on account removal.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<SessionRecord>> {
    let status_str: String = row.get(6)?;
    Ok(match status_str.parse::<ConnectionStatus>() {
        Err(e) => Err(StoreError::CorruptColumn(e)),
        Ok(status) => Ok(SessionRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            wa_account_id: row.get(2)?,
            endpoint_url: row.get(3)?,
            api_key_sealed: row.get(4)?,
            webhook_secret: row.get(5)?,
            status,
            auto_reply: row.get::<_, i64>(7)? != 0,
            agent_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        }),
    })
}
