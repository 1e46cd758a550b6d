//! Retrieve stage: gate, resolve the agent, embed the merged query,
//! search the bound knowledge bases, assemble context and history.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use wagent_core::types::{JobStage, JobStatus, MessageStatus, Role};
use wagent_core::ChatKey;
use wagent_llm::VectorMatch;
use wagent_merger::MergedRequest;

use crate::context::PipelineContext;
use crate::queue::{Delivery, StageHandler, StageOutcome};
use crate::types::{ContextChunk, HistoryMessage, InferRequest};

/// topK per knowledge base.
const TOP_K_PER_KB: usize = 5;
/// Merged matches kept after the cross-KB sort.
const MAX_CONTEXT_MATCHES: usize = 8;
/// History window loaded for the prompt.
const HISTORY_MESSAGES: usize = 10;

/// The retrieve queue is the merger's flush sink.
#[async_trait]
impl wagent_merger::MergeSink for crate::queue::StageQueue<MergedRequest> {
    async fn deliver(&self, request: MergedRequest) -> Result<(), String> {
        self.enqueue(request)
    }
}

pub struct RetrieveStage {
    ctx: Arc<PipelineContext>,
}

impl RetrieveStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    fn fail_job(&self, job_id: &str, reason: &str, transient: bool) -> StageOutcome {
        if let Err(e) = self
            .ctx
            .jobs
            .finish(job_id, JobStatus::Failed, None, Some(reason))
        {
            warn!(job_id, error = %e, "job failure record failed");
        }
        if transient {
            StageOutcome::Transient(reason.to_string())
        } else {
            StageOutcome::Permanent(reason.to_string())
        }
    }
}

#[async_trait]
impl StageHandler<MergedRequest> for RetrieveStage {
    fn stage(&self) -> JobStage {
        JobStage::Retrieve
    }

    #[instrument(skip(self, delivery), fields(chat_key = %delivery.payload.chat_key, attempt = delivery.attempt))]
    async fn handle(&self, delivery: &Delivery<MergedRequest>) -> StageOutcome {
        let req = &delivery.payload;

        let chat_key = match ChatKey::parse(&req.chat_key) {
            Ok(k) => k,
            Err(e) => return StageOutcome::Permanent(format!("bad chat key: {e}")),
        };

        // The user turn index comes from the conversation row.
        let conversation = match self
            .ctx
            .conversations
            .get_or_create(&req.chat_key, &req.session_id)
        {
            Ok(c) => c,
            Err(e) => return StageOutcome::Transient(format!("conversation load: {e}")),
        };
        let turn = conversation.last_turn;

        // Redelivered after a prior success: ack and move on. The
        // payload comparison keeps this narrow; a new message that
        // happens to map onto an abandoned turn must still run.
        let payload = serde_json::to_value(req).unwrap_or_default();
        match self.ctx.jobs.find_terminal(&req.chat_key, turn, JobStage::Retrieve) {
            Ok(Some(job)) if job.payload.as_ref() == Some(&payload) => {
                info!("terminal retrieve job exists for this payload, skipping");
                return StageOutcome::Done;
            }
            Ok(_) => {}
            Err(e) => return StageOutcome::Transient(format!("ledger check: {e}")),
        }
        let job = match self
            .ctx
            .jobs
            .begin(&req.chat_key, turn, JobStage::Retrieve, delivery.attempt, &payload)
        {
            Ok(j) => j,
            Err(e) => return StageOutcome::Transient(format!("job open: {e}")),
        };

        // Auto-reply gate. Suppression is terminal and not an error;
        // the user message is still recorded for the transcript.
        match self.ctx.intervention.should_auto_reply(&chat_key) {
            Ok(decision) if !decision.allow => {
                if let Err(e) = self.ctx.messages.insert(
                    &req.chat_key,
                    turn,
                    Role::User,
                    &req.merged_text,
                    MessageStatus::Suppressed,
                ) {
                    warn!(error = %e, "suppressed user message record failed");
                }
                // The suppressed message still consumes its turn, or the
                // next message would collide with this one's ledger keys.
                if let Err(e) = self.ctx.conversations.advance_turn(&req.chat_key, turn + 1) {
                    warn!(error = %e, "turn advance after suppression failed");
                }
                let result = serde_json::json!({"reason": decision.reason.as_str()});
                if let Err(e) =
                    self.ctx
                        .jobs
                        .finish(&job.id, JobStatus::Suppressed, Some(&result), None)
                {
                    warn!(error = %e, "job suppression record failed");
                }
                info!(reason = %decision.reason, "auto-reply suppressed at retrieve");
                return StageOutcome::Suppressed;
            }
            Ok(_) => {}
            Err(e) => return self.fail_job(&job.id, &format!("gate check: {e}"), true),
        }

        let session = match self.ctx.sessions.get(&req.session_id) {
            Ok(Some(s)) => s,
            Ok(None) => return self.fail_job(&job.id, "session row missing", false),
            Err(e) => return self.fail_job(&job.id, &format!("session load: {e}"), true),
        };

        // Agent resolution failure is fatal for the turn.
        let agent = match self.ctx.agents.resolve(
            req.agent_id.as_deref(),
            session.agent_id.as_deref(),
            &session.user_id,
        ) {
            Ok(Some(a)) => a,
            Ok(None) => return self.fail_job(&job.id, "no agent available for tenant", false),
            Err(e) => return self.fail_job(&job.id, &format!("agent resolve: {e}"), true),
        };

        // Missing credentials retry: the tenant may be mid-setup.
        let creds = match self.ctx.agents.credentials(&session.user_id) {
            Ok(Some(c)) => c,
            Ok(None) => return self.fail_job(&job.id, "provider credentials missing", true),
            Err(e) => return self.fail_job(&job.id, &format!("credentials load: {e}"), true),
        };
        let api_key = match self.ctx.sealer.open(&creds.api_key_sealed) {
            Ok(k) => k,
            Err(e) => return self.fail_job(&job.id, &format!("credential unseal: {e}"), false),
        };

        let provider = self.ctx.providers.provider(&creds, api_key);
        let query_vector = match provider.embed(&creds.embedding_model, &req.merged_text).await {
            Ok(v) => v,
            Err(e) => {
                return self.fail_job(&job.id, &format!("embedding: {e}"), e.is_transient())
            }
        };

        // Up to 3 KBs by binding priority, topK = 5 each.
        let bindings = match self.ctx.agents.kb_bindings(&agent.id) {
            Ok(b) => b,
            Err(e) => return self.fail_job(&job.id, &format!("kb bindings: {e}"), true),
        };
        let mut matches: Vec<VectorMatch> = Vec::new();
        for binding in &bindings {
            match self
                .ctx
                .vector
                .query(&query_vector, TOP_K_PER_KB, &binding.kb_id)
                .await
            {
                Ok(mut found) => matches.append(&mut found),
                Err(e) => {
                    return self.fail_job(
                        &job.id,
                        &format!("vector search {}: {e}", binding.kb_id),
                        e.is_transient(),
                    )
                }
            }
        }

        let context = match self.rank_and_hydrate(matches) {
            Ok(c) => c,
            Err(e) => return self.fail_job(&job.id, &e, true),
        };

        let chat_history = match self.ctx.messages.recent(&req.chat_key, HISTORY_MESSAGES) {
            Ok(rows) => rows
                .into_iter()
                .map(|m| HistoryMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            Err(e) => return self.fail_job(&job.id, &format!("history load: {e}"), true),
        };

        let infer_request = InferRequest {
            chat_key: req.chat_key.clone(),
            user_message: req.merged_text.clone(),
            context,
            agent,
            chat_history,
            turn,
            session_id: req.session_id.clone(),
            timestamp_ms: req.ended_at_ms,
        };
        let context_count = infer_request.context.len();

        if let Err(e) = self.ctx.infer_queue.enqueue(infer_request) {
            return self.fail_job(&job.id, &format!("infer enqueue: {e}"), true);
        }

        let result = serde_json::json!({
            "context_chunks": context_count,
            "kbs_searched": bindings.len(),
        });
        if let Err(e) = self
            .ctx
            .jobs
            .finish(&job.id, JobStatus::Completed, Some(&result), None)
        {
            warn!(error = %e, "job completion record failed");
        }
        info!(context_count, turn, "retrieve complete");
        StageOutcome::Done
    }
}

impl RetrieveStage {
    /// Dedupe by chunk id, sort by score descending (ties: lower chunk
    /// index, then earlier document id), cap, then hydrate texts —
    /// matches whose chunk row is gone are dropped.
    fn rank_and_hydrate(&self, matches: Vec<VectorMatch>) -> Result<Vec<ContextChunk>, String> {
        let mut best: HashMap<String, VectorMatch> = HashMap::new();
        for m in matches {
            match best.get(&m.id) {
                Some(seen) if seen.score >= m.score => {}
                _ => {
                    best.insert(m.id.clone(), m);
                }
            }
        }

        let mut ranked: Vec<VectorMatch> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| meta_chunk_index(a).cmp(&meta_chunk_index(b)))
                .then_with(|| meta_document_id(a).cmp(&meta_document_id(b)))
        });
        ranked.truncate(MAX_CONTEXT_MATCHES);

        let ids: Vec<String> = ranked.iter().map(|m| m.id.clone()).collect();
        let rows = self
            .ctx
            .chunks
            .hydrate(&ids)
            .map_err(|e| format!("chunk hydrate: {e}"))?;
        let by_id: HashMap<&str, _> = rows.iter().map(|c| (c.vector_id.as_str(), c)).collect();

        Ok(ranked
            .iter()
            .filter_map(|m| {
                by_id.get(m.id.as_str()).map(|chunk| ContextChunk {
                    vector_id: chunk.vector_id.clone(),
                    kb_id: chunk.kb_id.clone(),
                    document_id: chunk.document_id.clone(),
                    chunk_index: chunk.chunk_index,
                    score: m.score,
                    content: chunk.content.clone(),
                })
            })
            .collect())
    }
}

fn meta_chunk_index(m: &VectorMatch) -> i64 {
    m.metadata
        .as_ref()
        .and_then(|v| v.get("chunk_index"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

fn meta_document_id(m: &VectorMatch) -> String {
    m.metadata
        .as_ref()
        .and_then(|v| v.get("document_id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
