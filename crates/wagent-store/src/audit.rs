use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;

use wagent_core::config::AUDIT_TTL_DAYS;

use crate::error::Result;
use crate::types::AuditEntry;

/// TTL'd log of intervention state changes (~30 day retention).
///
/// Expired rows are swept opportunistically on write rather than by a
/// background task.
pub struct AuditStore {
    db: Mutex<Connection>,
}

impl AuditStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Append an audit entry. Callers treat failures as non-fatal.
    pub fn record(&self, action: &str, target: &str) -> Result<()> {
        let now = chrono::Utc::now();
        let expires = now + chrono::Duration::days(AUDIT_TTL_DAYS);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO intervention_audit (action, target, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![action, target, now.to_rfc3339(), expires.to_rfc3339()],
        )?;

        // Opportunistic sweep of expired rows.
        let swept = db.execute(
            "DELETE FROM intervention_audit WHERE expires_at < ?1",
            rusqlite::params![now.to_rfc3339()],
        )?;
        if swept > 0 {
            debug!(count = swept, "expired audit entries swept");
        }
        Ok(())
    }

    /// Most recent entries for a target, newest first.
    pub fn recent(&self, target: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT action, target, created_at FROM intervention_audit
             WHERE target = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![target, limit as i64], |row| {
            Ok(AuditEntry {
                action: row.get(0)?,
                target: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
