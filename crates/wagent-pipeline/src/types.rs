use serde::{Deserialize, Serialize};

use wagent_core::types::Role;
use wagent_store::types::AgentProfile;

/// One hydrated knowledge-base chunk carried into the infer stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub vector_id: String,
    pub kb_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub score: f64,
    pub content: String,
}

/// One history entry carried into the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

/// Retrieve-stage output / infer-stage input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
    pub chat_key: String,
    pub user_message: String,
    pub context: Vec<ContextChunk>,
    pub agent: AgentProfile,
    pub chat_history: Vec<HistoryMessage>,
    /// The user message's turn; the assistant reply lands at `turn + 1`.
    pub turn: i64,
    pub session_id: String,
    pub timestamp_ms: i64,
}

/// Infer-stage output / reply-stage input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub chat_key: String,
    pub ai_response: String,
    /// The assistant message's turn.
    pub turn: i64,
    pub session_id: String,
    pub wa_account_id: String,
    pub whatsapp_chat_id: String,
    pub metadata: ReplyMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMetadata {
    pub tokens_used: u32,
    pub inference_ms: u64,
    pub model: String,
    pub agent_id: String,
}
