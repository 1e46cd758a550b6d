use std::sync::Mutex;

use rusqlite::Connection;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::types::{AgentProfile, KbBinding, ProviderCredentials};

/// The retrieve stage caps knowledge-base bindings per agent.
pub const MAX_KBS_PER_AGENT: usize = 3;

/// Manager for agent profiles, their KB bindings, and tenant
/// LLM-provider credentials.
pub struct AgentStore {
    db: Mutex<Connection>,
}

impl AgentStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self, system_prompt))]
    pub fn create(
        &self,
        user_id: &str,
        name: &str,
        system_prompt: &str,
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<AgentProfile> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO agents
             (id, user_id, name, system_prompt, model, temperature, max_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![id, user_id, name, system_prompt, model, temperature, max_tokens, now],
        )?;
        Ok(AgentProfile {
            id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
        })
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<AgentProfile>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, user_id, name, system_prompt, model, temperature, max_tokens
             FROM agents WHERE id = ?1",
            rusqlite::params![agent_id],
            row_to_agent,
        ) {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Resolve the agent for a merged request, in order of preference:
    /// the explicitly requested agent, the session's bound agent, any
    /// agent owned by the tenant. `None` means the turn cannot proceed.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        session_bound: Option<&str>,
        user_id: &str,
    ) -> Result<Option<AgentProfile>> {
        if let Some(id) = requested {
            if let Some(agent) = self.get(id)? {
                return Ok(Some(agent));
            }
        }
        if let Some(id) = session_bound {
            if let Some(agent) = self.get(id)? {
                return Ok(Some(agent));
            }
        }
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, user_id, name, system_prompt, model, temperature, max_tokens
             FROM agents WHERE user_id = ?1 ORDER BY created_at ASC LIMIT 1",
            rusqlite::params![user_id],
            row_to_agent,
        ) {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Bind a knowledge base to an agent (upsert on the join table).
    pub fn bind_kb(&self, agent_id: &str, kb_id: &str, priority: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO agent_kb_links (agent_id, kb_id, priority)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id, kb_id) DO UPDATE SET priority = excluded.priority",
            rusqlite::params![agent_id, kb_id, priority],
        )?;
        Ok(())
    }

    /// The agent's KB bindings, highest priority first, capped at
    /// [`MAX_KBS_PER_AGENT`].
    pub fn kb_bindings(&self, agent_id: &str) -> Result<Vec<KbBinding>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT agent_id, kb_id, priority FROM agent_kb_links
             WHERE agent_id = ?1
             ORDER BY priority DESC, kb_id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![agent_id, MAX_KBS_PER_AGENT as i64],
            |row| {
                Ok(KbBinding {
                    agent_id: row.get(0)?,
                    kb_id: row.get(1)?,
                    priority: row.get(2)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Store (or replace) a tenant's LLM-provider credentials. The API
    /// key must already be sealed.
    pub fn set_credentials(
        &self,
        user_id: &str,
        api_key_sealed: &str,
        base_url: &str,
        embedding_model: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO provider_credentials (user_id, api_key_sealed, base_url, embedding_model)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 api_key_sealed = excluded.api_key_sealed,
                 base_url = excluded.base_url,
                 embedding_model = excluded.embedding_model",
            rusqlite::params![user_id, api_key_sealed, base_url, embedding_model],
        )?;
        Ok(())
    }

    /// Fetch a tenant's provider credentials. `None` means the retrieve
    /// stage fails the turn (retryable — the tenant may be mid-setup).
    pub fn credentials(&self, user_id: &str) -> Result<Option<ProviderCredentials>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT user_id, api_key_sealed, base_url, embedding_model
             FROM provider_credentials WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| {
                Ok(ProviderCredentials {
                    user_id: row.get(0)?,
                    api_key_sealed: row.get(1)?,
                    base_url: row.get(2)?,
                    embedding_model: row.get(3)?,
                })
            },
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentProfile> {
    Ok(AgentProfile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        system_prompt: row.get(3)?,
        model: row.get(4)?,
        temperature: row.get(5)?,
        max_tokens: row.get::<_, i64>(6)? as u32,
    })
}
