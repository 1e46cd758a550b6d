//! Shared fixtures for stage-handler tests: an on-disk store, canned
//! LLM / vector / WAHA implementations, and a ready PipelineContext.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use wagent_core::config::WagentConfig;
use wagent_core::crypto::KeySealer;
use wagent_intervention::InterventionController;
use wagent_llm::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use wagent_llm::vector::{VectorMatch, VectorSearch};
use wagent_store::agents::AgentStore;
use wagent_store::audit::AuditStore;
use wagent_store::chunks::ChunkStore;
use wagent_store::conversations::ConversationStore;
use wagent_store::db;
use wagent_store::jobs::JobStore;
use wagent_store::messages::MessageStore;
use wagent_store::sessions::SessionStore;
use wagent_store::types::{AgentProfile, ProviderCredentials, SessionRecord};
use wagent_waha::types::SendResult;
use wagent_waha::{WahaError, WahaTransport};

use crate::context::{PipelineContext, ProviderFactory, WahaFactory};
use crate::queue::{stage_queue, StageReceiver};
use crate::types::{InferRequest, ReplyRequest};

pub(crate) const TEST_SEALING_KEY: &str = "unit-test-sealing-key-0123456789abcdef";

/// Scripted LLM: embeddings are fixed, completions pop from a queue
/// (falling back to a canned answer).
pub(crate) struct MockLlm {
    pub completions: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            completions: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_completion(&self, result: Result<ChatResponse, ProviderError>) {
        self.completions.lock().unwrap().push_back(result);
    }

    pub fn canned(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            model: "mock-model".to_string(),
            tokens_in: 10,
            tokens_out: 20,
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::canned("canned reply")))
    }

    async fn embed(&self, _model: &str, _input: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![0.1; 8])
    }
}

pub(crate) struct MockProviderFactory {
    pub llm: Arc<MockLlm>,
}

impl ProviderFactory for MockProviderFactory {
    fn provider(&self, _creds: &ProviderCredentials, _api_key: String) -> Arc<dyn LlmProvider> {
        Arc::clone(&self.llm) as Arc<dyn LlmProvider>
    }
}

/// Canned vector index keyed by kb id.
pub(crate) struct MockVector {
    pub by_kb: Mutex<HashMap<String, Vec<VectorMatch>>>,
}

impl MockVector {
    pub fn new() -> Self {
        Self {
            by_kb: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, kb_id: &str, matches: Vec<VectorMatch>) {
        self.by_kb
            .lock()
            .unwrap()
            .insert(kb_id.to_string(), matches);
    }
}

#[async_trait]
impl VectorSearch for MockVector {
    async fn query(
        &self,
        _vector: &[f32],
        top_k: usize,
        kb_id: &str,
    ) -> Result<Vec<VectorMatch>, ProviderError> {
        let mut matches = self
            .by_kb
            .lock()
            .unwrap()
            .get(kb_id)
            .cloned()
            .unwrap_or_default();
        matches.truncate(top_k);
        Ok(matches)
    }
}

/// Scripted WAHA transport: `None` = success, `Some(reason)` = rejected
/// send. Typing calls are recorded, never fail.
pub(crate) struct MockWaha {
    pub send_script: Mutex<VecDeque<Option<String>>>,
    pub sent: Mutex<Vec<String>>,
    pub typing_events: Mutex<Vec<&'static str>>,
}

impl MockWaha {
    pub fn new() -> Self {
        Self {
            send_script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            typing_events: Mutex::new(Vec::new()),
        }
    }

    pub fn script_sends(&self, script: Vec<Option<String>>) {
        *self.send_script.lock().unwrap() = script.into();
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl WahaTransport for MockWaha {
    async fn start_typing(&self, _session: &str, _chat_id: &str) -> wagent_waha::Result<()> {
        self.typing_events.lock().unwrap().push("start");
        Ok(())
    }

    async fn stop_typing(&self, _session: &str, _chat_id: &str) -> wagent_waha::Result<()> {
        self.typing_events.lock().unwrap().push("stop");
        Ok(())
    }

    async fn send_text(
        &self,
        _session: &str,
        _chat_id: &str,
        text: &str,
    ) -> wagent_waha::Result<SendResult> {
        let next = self.send_script.lock().unwrap().pop_front().flatten();
        match next {
            Some(reason) => Err(WahaError::SendRejected(reason)),
            None => {
                self.sent.lock().unwrap().push(text.to_string());
                Ok(SendResult {
                    success: true,
                    error: None,
                    id: Some("waha-msg".to_string()),
                })
            }
        }
    }
}

pub(crate) struct MockWahaFactory {
    pub waha: Arc<MockWaha>,
}

impl WahaFactory for MockWahaFactory {
    fn transport(&self, _endpoint_url: &str, _api_key: String) -> Arc<dyn WahaTransport> {
        Arc::clone(&self.waha) as Arc<dyn WahaTransport>
    }
}

pub(crate) struct Harness {
    pub ctx: Arc<PipelineContext>,
    pub infer_rx: StageReceiver<InferRequest>,
    pub reply_rx: StageReceiver<ReplyRequest>,
    pub llm: Arc<MockLlm>,
    pub waha: Arc<MockWaha>,
    pub vector: Arc<MockVector>,
    pub audit: Arc<AuditStore>,
    pub session: SessionRecord,
    pub agent: AgentProfile,
    _file: NamedTempFile,
}

impl Harness {
    pub fn new() -> Self {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let open = |p: &str| db::open(p).unwrap();

        let sealer = KeySealer::new(TEST_SEALING_KEY).unwrap();
        let sessions = Arc::new(SessionStore::new(open(&path)));
        let conversations = Arc::new(ConversationStore::new(open(&path)));
        let messages = Arc::new(MessageStore::new(open(&path)));
        let jobs = Arc::new(JobStore::new(open(&path)));
        let agents = Arc::new(AgentStore::new(open(&path)));
        let chunks = Arc::new(ChunkStore::new(open(&path)));
        let audit = Arc::new(AuditStore::new(open(&path)));
        let intervention = Arc::new(InterventionController::new(
            Arc::clone(&sessions),
            Arc::clone(&conversations),
            Arc::clone(&audit),
        ));

        let sealed_waha = sealer.seal("waha-api-key").unwrap();
        let session = sessions
            .create("u1", "wa1", "http://waha:3000", &sealed_waha, "hook-secret", None)
            .unwrap();
        let sealed_llm = sealer.seal("llm-api-key").unwrap();
        agents
            .set_credentials("u1", &sealed_llm, "https://llm.local/v1", "text-embedding-3-small")
            .unwrap();
        let agent = agents
            .create("u1", "support", "You are a helpful assistant", "mock-model", 0.7, 512)
            .unwrap();

        let llm = Arc::new(MockLlm::new());
        let waha = Arc::new(MockWaha::new());
        let vector = Arc::new(MockVector::new());

        let (infer_queue, infer_rx) = stage_queue::<InferRequest>("q_infer", 64);
        let (reply_queue, reply_rx) = stage_queue::<ReplyRequest>("q_reply", 64);

        let mut config = WagentConfig::default();
        config.encryption_key = TEST_SEALING_KEY.to_string();

        let ctx = Arc::new(PipelineContext {
            config,
            sealer,
            sessions,
            conversations,
            messages,
            jobs,
            agents,
            chunks,
            intervention,
            vector: Arc::clone(&vector) as Arc<dyn VectorSearch>,
            providers: Arc::new(MockProviderFactory {
                llm: Arc::clone(&llm),
            }),
            waha: Arc::new(MockWahaFactory {
                waha: Arc::clone(&waha),
            }),
            infer_queue,
            reply_queue,
            cancel: CancellationToken::new(),
        });

        Self {
            ctx,
            infer_rx,
            reply_rx,
            llm,
            waha,
            vector,
            audit,
            session,
            agent,
            _file: file,
        }
    }
}
