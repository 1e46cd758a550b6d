use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use wagent_core::ChatKey;

/// One inbound WhatsApp message after ingress validation and dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingChatMessage {
    pub chat_key: ChatKey,
    pub session_id: String,
    /// WAHA message id, for tracing.
    pub message_id: String,
    pub text: String,
    /// Sender timestamp, epoch milliseconds.
    pub timestamp_ms: i64,
    pub has_media: bool,
    /// Optional agent override carried through from the webhook payload.
    pub agent_id: Option<String>,
}

/// The merger's output: one logical query per burst of messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedRequest {
    pub chat_key: String,
    pub session_id: String,
    pub merged_text: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub message_count: usize,
    pub has_media: bool,
    pub agent_id: Option<String>,
}

/// Where flushed requests go (the retrieve queue, in production).
///
/// A rejected delivery keeps the buffer alive; the actor retries with
/// backoff rather than dropping messages.
#[async_trait]
pub trait MergeSink: Send + Sync {
    async fn deliver(&self, request: MergedRequest) -> std::result::Result<(), String>;
}
