use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use wagent_core::config::{
    WagentConfig, EMBEDDING_TIMEOUT_SECS, LLM_TIMEOUT_SECS, WAHA_TIMEOUT_SECS,
};
use wagent_core::crypto::KeySealer;
use wagent_intervention::InterventionController;
use wagent_llm::openai::OpenAiProvider;
use wagent_llm::{LlmProvider, VectorSearch};
use wagent_store::agents::AgentStore;
use wagent_store::chunks::ChunkStore;
use wagent_store::conversations::ConversationStore;
use wagent_store::jobs::JobStore;
use wagent_store::messages::MessageStore;
use wagent_store::sessions::SessionStore;
use wagent_store::types::ProviderCredentials;
use wagent_waha::{WahaClient, WahaTransport};

use crate::queue::StageQueue;
use crate::types::{InferRequest, ReplyRequest};

/// Builds an LLM provider from tenant credentials. Indirection keeps
/// stage tests offline.
pub trait ProviderFactory: Send + Sync {
    fn provider(&self, creds: &ProviderCredentials, api_key: String) -> Arc<dyn LlmProvider>;
}

/// Builds a WAHA transport from a session's endpoint and opened key.
pub trait WahaFactory: Send + Sync {
    fn transport(&self, endpoint_url: &str, api_key: String) -> Arc<dyn WahaTransport>;
}

/// Default factory: OpenAI-compatible HTTP provider with the standard
/// call timeouts.
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn provider(&self, creds: &ProviderCredentials, api_key: String) -> Arc<dyn LlmProvider> {
        Arc::new(OpenAiProvider::new(
            api_key,
            creds.base_url.clone(),
            Duration::from_secs(LLM_TIMEOUT_SECS),
            Duration::from_secs(EMBEDDING_TIMEOUT_SECS),
        ))
    }
}

/// Default factory: real WAHA REST client.
pub struct HttpWahaFactory;

impl WahaFactory for HttpWahaFactory {
    fn transport(&self, endpoint_url: &str, api_key: String) -> Arc<dyn WahaTransport> {
        Arc::new(WahaClient::new(
            endpoint_url.to_string(),
            api_key,
            Duration::from_secs(WAHA_TIMEOUT_SECS),
        ))
    }
}

/// Everything the three stage handlers share. One instance per process,
/// passed as `Arc<PipelineContext>`.
pub struct PipelineContext {
    pub config: WagentConfig,
    pub sealer: KeySealer,
    pub sessions: Arc<SessionStore>,
    pub conversations: Arc<ConversationStore>,
    pub messages: Arc<MessageStore>,
    pub jobs: Arc<JobStore>,
    pub agents: Arc<AgentStore>,
    pub chunks: Arc<ChunkStore>,
    pub intervention: Arc<InterventionController>,
    pub vector: Arc<dyn VectorSearch>,
    pub providers: Arc<dyn ProviderFactory>,
    pub waha: Arc<dyn WahaFactory>,
    pub infer_queue: StageQueue<InferRequest>,
    pub reply_queue: StageQueue<ReplyRequest>,
    /// Root shutdown signal; in-flight humanizer sleeps abort on it.
    pub cancel: CancellationToken,
}
