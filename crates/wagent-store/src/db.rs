use rusqlite::{Connection, Result};

/// Open a database connection and initialise the schema.
///
/// Each manager owns its own connection on the same file; SQLite's
/// busy timeout absorbs short write contention between them.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_sessions_table(conn)?;
    create_conversations_table(conn)?;
    create_messages_table(conn)?;
    create_jobs_table(conn)?;
    create_agents_tables(conn)?;
    create_chunks_table(conn)?;
    create_audit_table(conn)?;
    create_dedup_table(conn)?;
    create_buffers_table(conn)?;
    create_metrics_table(conn)?;
    Ok(())
}

fn create_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id             TEXT PRIMARY KEY,
            user_id        TEXT NOT NULL,
            wa_account_id  TEXT NOT NULL UNIQUE,
            endpoint_url   TEXT NOT NULL,
            api_key_sealed TEXT NOT NULL,
            webhook_secret TEXT NOT NULL,
            status         TEXT NOT NULL DEFAULT 'connecting',
            auto_reply     INTEGER NOT NULL DEFAULT 1,
            agent_id       TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);",
    )
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            chat_key   TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            last_turn  INTEGER NOT NULL DEFAULT 0,
            auto_reply INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_key     TEXT NOT NULL,
            turn         INTEGER NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            status       TEXT NOT NULL,
            delivery_ack TEXT,
            created_at   TEXT NOT NULL,
            UNIQUE(chat_key, turn, role)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_key, turn);",
    )
}

fn create_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            id         TEXT PRIMARY KEY,
            chat_key   TEXT NOT NULL,
            turn       INTEGER NOT NULL,
            stage      TEXT NOT NULL,
            status     TEXT NOT NULL DEFAULT 'pending',
            attempt    INTEGER NOT NULL DEFAULT 1,
            payload    TEXT,
            result     TEXT,
            error      TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_key
            ON jobs(chat_key, turn, stage, status);",
    )
}

fn create_agents_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agents (
            id            TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            name          TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            model         TEXT NOT NULL,
            temperature   REAL NOT NULL DEFAULT 0.7,
            max_tokens    INTEGER NOT NULL DEFAULT 1024,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agents_user
            ON agents(user_id);
        CREATE TABLE IF NOT EXISTS agent_kb_links (
            agent_id TEXT NOT NULL,
            kb_id    TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (agent_id, kb_id)
        );
        CREATE TABLE IF NOT EXISTS provider_credentials (
            user_id         TEXT PRIMARY KEY,
            api_key_sealed  TEXT NOT NULL,
            base_url        TEXT NOT NULL,
            embedding_model TEXT NOT NULL
        );",
    )
}

fn create_chunks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kb_chunks (
            vector_id   TEXT PRIMARY KEY,
            kb_id       TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_kb
            ON kb_chunks(kb_id);",
    )
}

fn create_audit_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS intervention_audit (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            action     TEXT NOT NULL,
            target     TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_expiry
            ON intervention_audit(expires_at);",
    )
}

fn create_dedup_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS webhook_dedup (
            dedup_key  TEXT PRIMARY KEY,
            expires_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dedup_expiry
            ON webhook_dedup(expires_at);",
    )
}

fn create_buffers_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS merge_buffers (
            chat_key           TEXT PRIMARY KEY,
            session_id         TEXT NOT NULL,
            agent_id           TEXT,
            messages           TEXT NOT NULL,
            started_at_ms      INTEGER NOT NULL,
            last_message_at_ms INTEGER NOT NULL,
            updated_at         TEXT NOT NULL
        );",
    )
}

fn create_metrics_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rolling_metrics (
            day              TEXT NOT NULL,
            stage            TEXT NOT NULL,
            processed        INTEGER NOT NULL DEFAULT 0,
            failed           INTEGER NOT NULL DEFAULT 0,
            total_latency_ms INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (day, stage)
        );",
    )
}
