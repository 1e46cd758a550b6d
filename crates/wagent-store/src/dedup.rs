use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;

use wagent_core::config::DEDUP_TTL_HOURS;

use crate::error::Result;

/// Webhook idempotency keys with a 24 h TTL.
///
/// The key is the WAHA `payload.id` when present. When it is absent the
/// ingress falls back to `waAccountId:timestamp`, which is not
/// collision-proof under high concurrency; accepted as-is.
pub struct DedupStore {
    db: Mutex<Connection>,
}

impl DedupStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Record `key` if unseen. Returns `true` for a fresh key and
    /// `false` for a duplicate within the TTL.
    pub fn check_and_insert(&self, key: &str) -> Result<bool> {
        let now = chrono::Utc::now();
        let expires = now + chrono::Duration::hours(DEDUP_TTL_HOURS);
        let db = self.db.lock().unwrap();

        // Sweep first so an expired key counts as fresh again.
        let swept = db.execute(
            "DELETE FROM webhook_dedup WHERE expires_at < ?1",
            rusqlite::params![now.to_rfc3339()],
        )?;
        if swept > 0 {
            debug!(count = swept, "expired dedup keys swept");
        }

        let inserted = db.execute(
            "INSERT OR IGNORE INTO webhook_dedup (dedup_key, expires_at) VALUES (?1, ?2)",
            rusqlite::params![key, expires.to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn first_seen_then_duplicate() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        let s = DedupStore::new(conn);

        assert!(s.check_and_insert("msg-1").unwrap());
        assert!(!s.check_and_insert("msg-1").unwrap());
        assert!(s.check_and_insert("msg-2").unwrap());
    }

    #[test]
    fn expired_key_is_fresh_again() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        // Force an already-expired row, bypassing the manager.
        conn.execute(
            "INSERT INTO webhook_dedup (dedup_key, expires_at) VALUES ('old', '2000-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        let s = DedupStore::new(conn);
        assert!(s.check_and_insert("old").unwrap());
    }
}
