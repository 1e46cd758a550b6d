use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{instrument, warn};
use uuid::Uuid;

use wagent_core::types::{JobStage, JobStatus};

use crate::error::{Result, StoreError};
use crate::types::JobRecord;

/// Manager for the durable job ledger.
///
/// Rows provide idempotency hints, not strict locking: workers check
/// for a terminal row before starting and supersede stale `processing`
/// rows instead of waiting on them.
pub struct JobStore {
    db: Mutex<Connection>,
}

const SELECT_COLS: &str =
    "id, chat_key, turn, stage, status, attempt, payload, result, error, created_at, updated_at";

impl JobStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Open a new `processing` job row for a stage attempt.
    #[instrument(skip(self, payload))]
    pub fn begin(
        &self,
        chat_key: &str,
        turn: i64,
        stage: JobStage,
        attempt: u32,
        payload: &serde_json::Value,
    ) -> Result<JobRecord> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let payload_json = serde_json::to_string(payload)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO jobs
             (id, chat_key, turn, stage, status, attempt, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'processing', ?5, ?6, ?7, ?7)",
            rusqlite::params![id, chat_key, turn, stage.as_str(), attempt, payload_json, now],
        )?;
        drop(db);
        self.get(&id)?.ok_or_else(|| StoreError::NotFound(id))
    }

    pub fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {SELECT_COLS} FROM jobs WHERE id = ?1"),
            rusqlite::params![id],
            row_to_job,
        ) {
            Ok(j) => Ok(Some(j?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Transition a job to a new status. Terminal rows are immutable:
    /// an attempted transition away from `completed`/`suppressed` is
    /// logged and ignored.
    #[instrument(skip(self, result, error))]
    pub fn finish(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let current = self.get(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.status.is_terminal() {
            warn!(job_id = %id, status = %current.status, "ignoring transition on terminal job");
            return Ok(());
        }

        let now = chrono::Utc::now().to_rfc3339();
        let result_json = result.map(serde_json::to_string).transpose()?;
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE jobs SET status = ?1, result = ?2, error = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![status.as_str(), result_json, error, now, id],
        )?;
        Ok(())
    }

    /// Return the terminal row for `(chat_key, turn, stage)`, if any.
    /// Consumers skip work when this returns `Some`.
    pub fn find_terminal(
        &self,
        chat_key: &str,
        turn: i64,
        stage: JobStage,
    ) -> Result<Option<JobRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!(
                "SELECT {SELECT_COLS} FROM jobs
                 WHERE chat_key = ?1 AND turn = ?2 AND stage = ?3
                   AND status IN ('completed', 'suppressed')
                 ORDER BY updated_at DESC LIMIT 1"
            ),
            rusqlite::params![chat_key, turn, stage.as_str()],
            row_to_job,
        ) {
            Ok(j) => Ok(Some(j?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Mark `processing` rows older than `stale_secs` as failed so a
    /// redelivery can supersede them. Run at worker startup and before
    /// each claim.
    #[instrument(skip(self))]
    pub fn supersede_stale(&self, stale_secs: i64) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(stale_secs)).to_rfc3339();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET status = 'failed', error = 'superseded: stale processing',
                    updated_at = ?1
             WHERE status = 'processing' AND updated_at < ?2",
            rusqlite::params![now, cutoff],
        )?;
        if n > 0 {
            warn!(count = n, "stale processing jobs superseded");
        }
        Ok(n)
    }

    /// All rows for one `(chat_key, turn)` pair, oldest first (post-mortem view).
    pub fn history(&self, chat_key: &str, turn: i64) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {SELECT_COLS} FROM jobs
             WHERE chat_key = ?1 AND turn = ?2
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![chat_key, turn], row_to_job)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<JobRecord>> {
    let stage_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let payload: Option<String> = row.get(6)?;
    let result: Option<String> = row.get(7)?;

    let parsed = stage_str
        .parse::<JobStage>()
        .and_then(|stage| status_str.parse::<JobStatus>().map(|status| (stage, status)));
    Ok(match parsed {
        Err(e) => Err(StoreError::CorruptColumn(e)),
        Ok((stage, status)) => Ok(JobRecord {
            id: row.get(0)?,
            chat_key: row.get(1)?,
            turn: row.get(2)?,
            stage,
            status,
            attempt: row.get(5)?,
            payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
            result: result.and_then(|r| serde_json::from_str(&r).ok()),
            error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        }),
    })
}
