use std::sync::Mutex;

use rusqlite::Connection;

use wagent_core::types::JobStage;

use crate::error::Result;

/// Rolling metrics are retained for 14 days.
const METRICS_RETENTION_DAYS: i64 = 14;

/// Daily rolling per-stage counters for operator dashboards.
///
/// Bumped by the queue workers after every stage attempt; never on the
/// hot path of a WAHA webhook ack.
pub struct MetricsStore {
    db: Mutex<Connection>,
}

/// One day's aggregate for a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyStageMetrics {
    pub day: String,
    pub stage: String,
    pub processed: i64,
    pub failed: i64,
    pub total_latency_ms: i64,
}

impl MetricsStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Record one stage attempt. `ok` covers completed and suppressed;
    /// failures bump both counters' denominators.
    pub fn bump(&self, stage: JobStage, ok: bool, latency_ms: u64) -> Result<()> {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO rolling_metrics (day, stage, processed, failed, total_latency_ms)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(day, stage) DO UPDATE SET
                 processed = processed + 1,
                 failed = failed + ?3,
                 total_latency_ms = total_latency_ms + ?4",
            rusqlite::params![day, stage.as_str(), (!ok) as i64, latency_ms as i64],
        )?;

        // Opportunistic sweep of rows past retention.
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(METRICS_RETENTION_DAYS))
            .format("%Y-%m-%d")
            .to_string();
        db.execute(
            "DELETE FROM rolling_metrics WHERE day < ?1",
            rusqlite::params![cutoff],
        )?;
        Ok(())
    }

    /// Today's counters for one stage, if anything ran.
    pub fn today(&self, stage: JobStage) -> Result<Option<DailyStageMetrics>> {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT day, stage, processed, failed, total_latency_ms
             FROM rolling_metrics WHERE day = ?1 AND stage = ?2",
            rusqlite::params![day, stage.as_str()],
            |row| {
                Ok(DailyStageMetrics {
                    day: row.get(0)?,
                    stage: row.get(1)?,
                    processed: row.get(2)?,
                    failed: row.get(3)?,
                    total_latency_ms: row.get(4)?,
                })
            },
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn bump_accumulates() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        let s = MetricsStore::new(conn);

        s.bump(JobStage::Retrieve, true, 120).unwrap();
        s.bump(JobStage::Retrieve, false, 80).unwrap();
        s.bump(JobStage::Infer, true, 900).unwrap();

        let retrieve = s.today(JobStage::Retrieve).unwrap().unwrap();
        assert_eq!(retrieve.processed, 2);
        assert_eq!(retrieve.failed, 1);
        assert_eq!(retrieve.total_latency_ms, 200);

        let reply = s.today(JobStage::Reply).unwrap();
        assert!(reply.is_none());
    }
}
