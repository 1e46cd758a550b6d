use serde::{Deserialize, Serialize};

use wagent_core::types::{ConnectionStatus, JobStage, JobStatus, MessageStatus, Role};

/// A tenant's WhatsApp account: one WAHA session plus its agent binding.
///
/// `api_key_sealed` holds the AES-GCM sealed WAHA API key; callers open
/// it through `wagent_core::crypto::KeySealer` on demand.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub wa_account_id: String,
    pub endpoint_url: String,
    pub api_key_sealed: String,
    pub webhook_secret: String,
    pub status: ConnectionStatus,
    pub auto_reply: bool,
    pub agent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One row per ChatKey, lazily created on first inbound message.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub chat_key: String,
    pub session_id: String,
    /// Monotonic; only the infer stage advances it.
    pub last_turn: i64,
    pub auto_reply: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Append-only message row, unique on (chat_key, turn, role).
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub chat_key: String,
    pub turn: i64,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    /// Best-effort WAHA delivery ack (e.g. "delivered", "read").
    pub delivery_ack: Option<String>,
    pub created_at: String,
}

/// Durable ledger entry for one pipeline stage attempt.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub chat_key: String,
    pub turn: i64,
    pub stage: JobStage,
    pub status: JobStatus,
    pub attempt: u32,
    pub payload: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// An agent profile: the prompt and sampling parameters used at infer time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// One agent→KB binding from the `agent_kb_links` join table.
#[derive(Debug, Clone)]
pub struct KbBinding {
    pub agent_id: String,
    pub kb_id: String,
    pub priority: i64,
}

/// A tenant's LLM-provider credentials.
///
/// `api_key_sealed` is opened on demand, never cached beyond the request.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub user_id: String,
    pub api_key_sealed: String,
    pub base_url: String,
    pub embedding_model: String,
}

/// A knowledge-base chunk hydrated by its vector id.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub vector_id: String,
    pub kb_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
}

/// One intervention state change, kept ~30 days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub action: String,
    pub target: String,
    pub created_at: String,
}

/// A single buffered inbound message inside a merge window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// WAHA message id (used for tracing, not dedup — that happened at ingress).
    pub message_id: String,
    pub text: String,
    /// Sender timestamp, epoch milliseconds. Flush sorts by this.
    pub timestamp_ms: i64,
    pub has_media: bool,
}

/// Persisted snapshot of one chat's merge buffer.
///
/// Written after every buffer mutation so a restart can re-arm the
/// flush alarm instead of losing buffered messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub chat_key: String,
    pub session_id: String,
    /// Agent override carried by the burst, if any message had one.
    pub agent_id: Option<String>,
    pub messages: Vec<BufferedMessage>,
    pub started_at_ms: i64,
    pub last_message_at_ms: i64,
}
