use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;
use crate::types::ChunkRecord;

/// Read-mostly access to knowledge-base chunk texts.
///
/// Chunks are written by the ingestion side (out of scope here); the
/// retrieve stage only hydrates matches by `vector_id`.
pub struct ChunkStore {
    db: Mutex<Connection>,
}

impl ChunkStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Insert a chunk row (used by ingestion and tests).
    pub fn put(
        &self,
        vector_id: &str,
        kb_id: &str,
        document_id: &str,
        chunk_index: i64,
        content: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO kb_chunks
             (vector_id, kb_id, document_id, chunk_index, content)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![vector_id, kb_id, document_id, chunk_index, content],
        )?;
        Ok(())
    }

    /// Hydrate chunk rows for a set of vector ids. Ids without a stored
    /// chunk are silently absent from the result; the caller drops the
    /// corresponding vector matches.
    pub fn hydrate(&self, vector_ids: &[String]) -> Result<Vec<ChunkRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT vector_id, kb_id, document_id, chunk_index, content
             FROM kb_chunks WHERE vector_id = ?1",
        )?;
        let mut out = Vec::with_capacity(vector_ids.len());
        for id in vector_ids {
            match stmt.query_row(rusqlite::params![id], |row| {
                Ok(ChunkRecord {
                    vector_id: row.get(0)?,
                    kb_id: row.get(1)?,
                    document_id: row.get(2)?,
                    chunk_index: row.get(3)?,
                    content: row.get(4)?,
                })
            }) {
                Ok(chunk) => out.push(chunk),
                Err(rusqlite::Error::QueryReturnedNoRows) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}
