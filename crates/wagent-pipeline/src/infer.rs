//! Infer stage: prompt assembly, the provider call, and the atomic
//! persistence of the user/assistant exchange.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use wagent_core::types::{JobStage, JobStatus, MessageStatus, Role};
use wagent_core::ChatKey;
use wagent_llm::{ChatMessage, ChatRequest, ChatRole};

use crate::context::PipelineContext;
use crate::queue::{Delivery, StageHandler, StageOutcome};
use crate::types::{ContextChunk, HistoryMessage, InferRequest, ReplyMetadata, ReplyRequest};

/// Prompt history cap: 20 turns of user+assistant exchange.
const MAX_HISTORY_ENTRIES: usize = 40;

pub struct InferStage {
    ctx: Arc<PipelineContext>,
}

impl InferStage {
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
impl StageHandler<InferRequest> for InferStage {
    fn stage(&self) -> JobStage {
        JobStage::Infer
    }

    #[instrument(skip(self, delivery), fields(chat_key = %delivery.payload.chat_key, turn = delivery.payload.turn, attempt = delivery.attempt))]
    async fn handle(&self, delivery: &Delivery<InferRequest>) -> StageOutcome {
        let req = &delivery.payload;

        let chat_key = match ChatKey::parse(&req.chat_key) {
            Ok(k) => k,
            Err(e) => return StageOutcome::Permanent(format!("bad chat key: {e}")),
        };

        // Skip only genuine redeliveries (same payload); a new request
        // landing on an abandoned turn still runs.
        let payload = serde_json::to_value(req).unwrap_or_default();
        match self
            .ctx
            .jobs
            .find_terminal(&req.chat_key, req.turn, JobStage::Infer)
        {
            Ok(Some(job)) if job.payload.as_ref() == Some(&payload) => {
                info!("terminal infer job exists for this payload, skipping");
                return StageOutcome::Done;
            }
            Ok(_) => {}
            Err(e) => return StageOutcome::Transient(format!("ledger check: {e}")),
        }
        let job = match self.ctx.jobs.begin(
            &req.chat_key,
            req.turn,
            JobStage::Infer,
            delivery.attempt,
            &payload,
        ) {
            Ok(j) => j,
            Err(e) => return StageOutcome::Transient(format!("job open: {e}")),
        };

        // The chat may have been paused while the request sat in the
        // queue; recheck before spending provider tokens.
        match self.ctx.intervention.should_auto_reply(&chat_key) {
            Ok(decision) if !decision.allow => {
                if let Err(e) = self.ctx.messages.insert(
                    &req.chat_key,
                    req.turn,
                    Role::User,
                    &req.user_message,
                    MessageStatus::Suppressed,
                ) {
                    warn!(error = %e, "suppressed user message record failed");
                }
                // Consume the turn so later messages get fresh keys.
                if let Err(e) = self
                    .ctx
                    .conversations
                    .advance_turn(&req.chat_key, req.turn + 1)
                {
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
                info!(reason = %decision.reason, "auto-reply suppressed at infer");
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
        let creds = match self.ctx.agents.credentials(&session.user_id) {
            Ok(Some(c)) => c,
            Ok(None) => return self.fail_job(&job.id, "provider credentials missing", true),
            Err(e) => return self.fail_job(&job.id, &format!("credentials load: {e}"), true),
        };
        let api_key = match self.ctx.sealer.open(&creds.api_key_sealed) {
            Ok(k) => k,
            Err(e) => return self.fail_job(&job.id, &format!("credential unseal: {e}"), false),
        };

        let messages = build_prompt(
            &req.agent.system_prompt,
            &req.context,
            &req.chat_history,
            &req.user_message,
        );
        let chat_request = ChatRequest {
            model: req.agent.model.clone(),
            messages,
            temperature: req.agent.temperature,
            max_tokens: req.agent.max_tokens,
        };

        let provider = self.ctx.providers.provider(&creds, api_key);
        let started = Instant::now();
        let response = match provider.send(&chat_request).await {
            Ok(r) => r,
            Err(e) => {
                return self.fail_job(&job.id, &format!("provider: {e}"), e.is_transient())
            }
        };
        let inference_ms = started.elapsed().as_millis() as u64;

        // One transaction: user message, pending assistant message,
        // advanced turn. A failure here leaves no assistant row behind.
        if let Err(e) = self.ctx.messages.insert_exchange(
            &req.chat_key,
            req.turn,
            &req.user_message,
            &response.content,
        ) {
            return self.fail_job(&job.id, &format!("exchange persist: {e}"), true);
        }

        let reply_request = ReplyRequest {
            chat_key: req.chat_key.clone(),
            ai_response: response.content.clone(),
            turn: req.turn + 1,
            session_id: req.session_id.clone(),
            wa_account_id: chat_key.wa_account_id.clone(),
            whatsapp_chat_id: chat_key.whatsapp_chat_id.clone(),
            metadata: ReplyMetadata {
                tokens_used: response.tokens_in + response.tokens_out,
                inference_ms,
                model: response.model.clone(),
                agent_id: req.agent.id.clone(),
            },
        };
        if let Err(e) = self.ctx.reply_queue.enqueue(reply_request) {
            return self.fail_job(&job.id, &format!("reply enqueue: {e}"), true);
        }

        let result = serde_json::json!({
            "model": response.model,
            "tokens_in": response.tokens_in,
            "tokens_out": response.tokens_out,
            "inference_ms": inference_ms,
        });
        if let Err(e) = self
            .ctx
            .jobs
            .finish(&job.id, JobStatus::Completed, Some(&result), None)
        {
            warn!(error = %e, "job completion record failed");
        }
        info!(inference_ms, turn = req.turn, "infer complete");
        StageOutcome::Done
    }
}

/// Assemble the provider prompt: system prompt, numbered context block
/// (omitted when empty), capped history, then the user turn.
fn build_prompt(
    system_prompt: &str,
    context: &[ContextChunk],
    history: &[HistoryMessage],
    user_message: &str,
) -> Vec<ChatMessage> {
    let mut system = system_prompt.to_string();
    if !context.is_empty() {
        system.push_str("\n\n--- Relevant Information ---\n");
        for (i, chunk) in context.iter().enumerate() {
            system.push_str(&format!("[{}] {}\n", i + 1, chunk.content));
        }
        system.push_str(
            "---\nPrefer the information above when it is relevant to the user's question.",
        );
    }

    let mut messages = vec![ChatMessage {
        role: ChatRole::System,
        content: system,
    }];

    let start = history.len().saturating_sub(MAX_HISTORY_ENTRIES);
    for entry in &history[start..] {
        messages.push(ChatMessage {
            role: match entry.role {
                Role::User => ChatRole::User,
                Role::Assistant => ChatRole::Assistant,
            },
            content: entry.content.clone(),
        });
    }

    messages.push(ChatMessage {
        role: ChatRole::User,
        content: user_message.to_string(),
    });
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> ContextChunk {
        ContextChunk {
            vector_id: "v".to_string(),
            kb_id: "kb".to_string(),
            document_id: "d".to_string(),
            chunk_index: 0,
            score: 0.9,
            content: content.to_string(),
        }
    }

    #[test]
    fn empty_context_omits_information_block() {
        let messages = build_prompt("You are helpful.", &[], &[], "hi");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "You are helpful.");
        assert!(!messages[0].content.contains("Relevant Information"));
    }

    #[test]
    fn context_chunks_are_numbered() {
        let messages = build_prompt(
            "You are helpful.",
            &[chunk("alpha"), chunk("beta")],
            &[],
            "hi",
        );
        let system = &messages[0].content;
        assert!(system.starts_with("You are helpful."));
        assert!(system.contains("[1] alpha"));
        assert!(system.contains("[2] beta"));
        assert!(system.contains("Prefer the information above"));
    }

    #[test]
    fn history_keeps_chronological_order_and_cap() {
        let history: Vec<HistoryMessage> = (0..50)
            .map(|i| HistoryMessage {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("m{i}"),
            })
            .collect();
        let messages = build_prompt("sys", &[], &history, "now");
        // system + capped history + user
        assert_eq!(messages.len(), 1 + MAX_HISTORY_ENTRIES + 1);
        assert_eq!(messages[1].content, "m10");
        assert_eq!(messages[messages.len() - 2].content, "m49");
        assert_eq!(messages.last().unwrap().content, "now");
    }

    mod handler {
        use super::*;
        use crate::testutil::{Harness, MockLlm};
        use wagent_core::types::MessageStatus;
        use wagent_llm::provider::ProviderError;

        fn infer_request(h: &Harness, text: &str, turn: i64) -> InferRequest {
            InferRequest {
                chat_key: "u1:wa1:c1@c.us".to_string(),
                user_message: text.to_string(),
                context: Vec::new(),
                agent: h.agent.clone(),
                chat_history: Vec::new(),
                turn,
                session_id: h.session.id.clone(),
                timestamp_ms: 1234,
            }
        }

        async fn run(h: &Harness, req: InferRequest) -> StageOutcome {
            let stage = InferStage::new(Arc::clone(&h.ctx));
            stage
                .handle(&Delivery {
                    payload: req,
                    attempt: 1,
                })
                .await
        }

        #[tokio::test]
        async fn happy_path_persists_exchange_and_dispatches_reply() {
            let h = Harness::new();
            h.ctx
                .conversations
                .get_or_create("u1:wa1:c1@c.us", &h.session.id)
                .unwrap();
            h.llm.push_completion(Ok(MockLlm::canned("the answer")));

            let outcome = run(&h, infer_request(&h, "the question", 0)).await;
            assert_eq!(outcome, StageOutcome::Done);

            let user = h
                .ctx
                .messages
                .get("u1:wa1:c1@c.us", 0, Role::User)
                .unwrap()
                .unwrap();
            assert_eq!(user.status, MessageStatus::Completed);
            let assistant = h
                .ctx
                .messages
                .get("u1:wa1:c1@c.us", 1, Role::Assistant)
                .unwrap()
                .unwrap();
            assert_eq!(assistant.status, MessageStatus::Pending);
            assert_eq!(assistant.content, "the answer");

            let conv = h.ctx.conversations.get("u1:wa1:c1@c.us").unwrap().unwrap();
            assert_eq!(conv.last_turn, 1);

            let reply = h.reply_rx.recv().await.unwrap().payload;
            assert_eq!(reply.turn, 1);
            assert_eq!(reply.ai_response, "the answer");
            assert_eq!(reply.wa_account_id, "wa1");
            assert_eq!(reply.whatsapp_chat_id, "c1@c.us");
            assert_eq!(reply.metadata.tokens_used, 30);
        }

        #[tokio::test]
        async fn recheck_suppresses_before_provider_call() {
            let h = Harness::new();
            let chat_key = ChatKey::parse("u1:wa1:c1@c.us").unwrap();
            h.ctx.intervention.pause_conversation(&chat_key).unwrap();

            let outcome = run(&h, infer_request(&h, "too late", 0)).await;
            assert_eq!(outcome, StageOutcome::Suppressed);

            // No provider tokens spent, no assistant row, no reply queued.
            assert!(h.llm.requests.lock().unwrap().is_empty());
            assert!(h
                .ctx
                .messages
                .get("u1:wa1:c1@c.us", 1, Role::Assistant)
                .unwrap()
                .is_none());
            assert_eq!(h.ctx.reply_queue.depth(), 0);
            let user = h
                .ctx
                .messages
                .get("u1:wa1:c1@c.us", 0, Role::User)
                .unwrap()
                .unwrap();
            assert_eq!(user.status, MessageStatus::Suppressed);
            let conv = h.ctx.conversations.get("u1:wa1:c1@c.us").unwrap().unwrap();
            assert_eq!(conv.last_turn, 1);
        }

        #[tokio::test]
        async fn provider_failure_leaves_no_assistant_message() {
            let h = Harness::new();
            h.ctx
                .conversations
                .get_or_create("u1:wa1:c1@c.us", &h.session.id)
                .unwrap();
            h.llm.push_completion(Err(ProviderError::Api {
                status: 503,
                message: "overloaded".to_string(),
            }));

            let outcome = run(&h, infer_request(&h, "q", 0)).await;
            assert!(matches!(outcome, StageOutcome::Transient(_)));
            assert!(h
                .ctx
                .messages
                .get("u1:wa1:c1@c.us", 1, Role::Assistant)
                .unwrap()
                .is_none());
            assert_eq!(h.ctx.reply_queue.depth(), 0);
        }

        #[tokio::test]
        async fn auth_failure_is_permanent() {
            let h = Harness::new();
            h.ctx
                .conversations
                .get_or_create("u1:wa1:c1@c.us", &h.session.id)
                .unwrap();
            h.llm.push_completion(Err(ProviderError::Api {
                status: 401,
                message: "bad key".to_string(),
            }));

            let outcome = run(&h, infer_request(&h, "q", 0)).await;
            assert!(matches!(outcome, StageOutcome::Permanent(_)));
        }

        #[tokio::test]
        async fn redelivery_after_completion_skips_provider() {
            let h = Harness::new();
            h.ctx
                .conversations
                .get_or_create("u1:wa1:c1@c.us", &h.session.id)
                .unwrap();
            h.llm.push_completion(Ok(MockLlm::canned("first")));

            assert_eq!(run(&h, infer_request(&h, "q", 0)).await, StageOutcome::Done);
            assert_eq!(run(&h, infer_request(&h, "q", 0)).await, StageOutcome::Done);

            // One provider call, one reply, one assistant row.
            assert_eq!(h.llm.requests.lock().unwrap().len(), 1);
            assert_eq!(h.ctx.reply_queue.depth(), 1);
        }

        #[tokio::test]
        async fn prompt_carries_context_and_sampling_params() {
            let h = Harness::new();
            h.ctx
                .conversations
                .get_or_create("u1:wa1:c1@c.us", &h.session.id)
                .unwrap();
            h.llm.push_completion(Ok(MockLlm::canned("ok")));

            let mut req = infer_request(&h, "how much?", 0);
            req.context = vec![ContextChunk {
                vector_id: "v1".to_string(),
                kb_id: "kb1".to_string(),
                document_id: "d".to_string(),
                chunk_index: 0,
                score: 0.9,
                content: "price is 42".to_string(),
            }];
            assert_eq!(run(&h, req).await, StageOutcome::Done);

            let sent = h.llm.requests.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].model, "mock-model");
            assert!((sent[0].temperature - 0.7).abs() < 1e-9);
            assert_eq!(sent[0].max_tokens, 512);
            assert!(sent[0].messages[0].content.contains("[1] price is 42"));
            assert_eq!(sent[0].messages.last().unwrap().content, "how much?");
        }
    }
}
