//! Reply stage: safety trim, segmentation, typing rhythm, and the
//! per-segment WAHA send loop with retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{info, instrument, warn};

use wagent_core::types::{JobStage, JobStatus, MessageStatus, Role};
use wagent_core::ChatKey;
use wagent_intervention::safety_trim;
use wagent_waha::WahaTransport;

use crate::context::PipelineContext;
use crate::humanize::{self, TYPING_SLEEP_CAP};
use crate::queue::{Delivery, StageHandler, StageOutcome};
use crate::types::ReplyRequest;

/// sendText attempts per segment.
const SEND_ATTEMPTS: u32 = 3;
/// Random extra delay added to each send retry (0–500 ms).
const SEND_JITTER_MAX_MS: u64 = 500;

pub struct ReplyStage {
    ctx: Arc<PipelineContext>,
}

impl ReplyStage {
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

    /// Sleep that aborts on shutdown. `false` means cancelled.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[async_trait]
impl StageHandler<ReplyRequest> for ReplyStage {
    fn stage(&self) -> JobStage {
        JobStage::Reply
    }

    #[instrument(skip(self, delivery), fields(chat_key = %delivery.payload.chat_key, turn = delivery.payload.turn, attempt = delivery.attempt))]
    async fn handle(&self, delivery: &Delivery<ReplyRequest>) -> StageOutcome {
        let req = &delivery.payload;

        let chat_key = match ChatKey::parse(&req.chat_key) {
            Ok(k) => k,
            Err(e) => return StageOutcome::Permanent(format!("bad chat key: {e}")),
        };

        match self
            .ctx
            .jobs
            .find_terminal(&req.chat_key, req.turn, JobStage::Reply)
        {
            Ok(Some(_)) => {
                info!("terminal reply job exists, skipping");
                return StageOutcome::Done;
            }
            Ok(None) => {}
            Err(e) => return StageOutcome::Transient(format!("ledger check: {e}")),
        }

        let payload = serde_json::to_value(req).unwrap_or_default();
        let job = match self.ctx.jobs.begin(
            &req.chat_key,
            req.turn,
            JobStage::Reply,
            delivery.attempt,
            &payload,
        ) {
            Ok(j) => j,
            Err(e) => return StageOutcome::Transient(format!("job open: {e}")),
        };

        // Final gate before anything reaches WhatsApp.
        match self.ctx.intervention.should_auto_reply(&chat_key) {
            Ok(decision) if !decision.allow => {
                if let Err(e) = self.ctx.messages.update_status(
                    &req.chat_key,
                    req.turn,
                    Role::Assistant,
                    MessageStatus::Suppressed,
                    None,
                ) {
                    warn!(error = %e, "assistant suppression record failed");
                }
                let result = serde_json::json!({"reason": decision.reason.as_str()});
                if let Err(e) =
                    self.ctx
                        .jobs
                        .finish(&job.id, JobStatus::Suppressed, Some(&result), None)
                {
                    warn!(error = %e, "job suppression record failed");
                }
                info!(reason = %decision.reason, "auto-reply suppressed at reply");
                return StageOutcome::Suppressed;
            }
            Ok(_) => {}
            Err(e) => return self.fail_job(&job.id, &format!("gate check: {e}"), true),
        }

        // Keep the agent from issuing punctuation commands against its
        // own conversation.
        let trimmed = safety_trim(&req.ai_response).to_string();
        let segments = humanize::segment(&trimmed);
        if segments.is_empty() {
            if let Err(e) = self.ctx.messages.update_status(
                &req.chat_key,
                req.turn,
                Role::Assistant,
                MessageStatus::Failed,
                None,
            ) {
                warn!(error = %e, "assistant failure record failed");
            }
            return self.fail_job(&job.id, "nothing to send after safety trim", false);
        }

        let session = match self.ctx.sessions.get(&req.session_id) {
            Ok(Some(s)) => s,
            Ok(None) => return self.fail_job(&job.id, "session row missing", false),
            Err(e) => return self.fail_job(&job.id, &format!("session load: {e}"), true),
        };
        let waha_key = match self.ctx.sealer.open(&session.api_key_sealed) {
            Ok(k) => k,
            Err(e) => return self.fail_job(&job.id, &format!("credential unseal: {e}"), false),
        };
        let transport = self.ctx.waha.transport(&session.endpoint_url, waha_key);

        // ── Send loop ─────────────────────────────────────────────────
        let total = segments.len();
        let mut sent: Vec<String> = Vec::with_capacity(total);
        let mut segment_errors: Vec<serde_json::Value> = Vec::new();
        let mut total_typing_ms: u64 = 0;
        let mut wpm_sum = 0.0;

        for (index, segment) in segments.iter().enumerate() {
            // The plan's thinking pause precedes this segment, so it
            // scales on this segment's length.
            let plan = humanize::plan(index, total, segment.chars().count());
            wpm_sum += plan.wpm;

            if !self.sleep(plan.thinking_delay).await {
                return self.fail_job(&job.id, "cancelled during thinking delay", true);
            }

            if self.ctx.config.humanizer.typing_indicator {
                if let Err(e) = transport
                    .start_typing(&req.wa_account_id, &req.whatsapp_chat_id)
                    .await
                {
                    warn!(error = %e, "startTyping failed");
                }
                let typing = plan.typing_duration.min(TYPING_SLEEP_CAP);
                total_typing_ms += typing.as_millis() as u64;
                if !self.sleep(typing).await {
                    return self.fail_job(&job.id, "cancelled during typing", true);
                }
                if let Err(e) = transport
                    .stop_typing(&req.wa_account_id, &req.whatsapp_chat_id)
                    .await
                {
                    warn!(error = %e, "stopTyping failed");
                }
            }

            if !self.sleep(plan.post_delay).await {
                return self.fail_job(&job.id, "cancelled during post delay", true);
            }

            match self.send_with_retry(transport.as_ref(), req, segment).await {
                Ok(()) => sent.push(segment.clone()),
                Err(reason) => {
                    warn!(segment = index, reason, "segment send failed after retries");
                    segment_errors.push(serde_json::json!({
                        "segment": index,
                        "error": reason,
                    }));
                    // A dead first segment means the chat never saw the
                    // reply start; bail out instead of sending a tail.
                    if index == 0 {
                        break;
                    }
                }
            }
        }

        // ── Result bookkeeping ────────────────────────────────────────
        let status = if sent.len() == total {
            MessageStatus::Sent
        } else if !sent.is_empty() {
            MessageStatus::Partial
        } else {
            MessageStatus::Failed
        };
        let new_text = (status == MessageStatus::Partial).then(|| sent.join("\n\n"));
        if let Err(e) = self.ctx.messages.update_status(
            &req.chat_key,
            req.turn,
            Role::Assistant,
            status,
            new_text.as_deref(),
        ) {
            warn!(error = %e, "assistant status update failed");
        }

        let result = serde_json::json!({
            "segments_total": total,
            "segments_sent": sent.len(),
            "segment_errors": segment_errors,
            "total_typing_ms": total_typing_ms,
            "avg_wpm": wpm_sum / total as f64,
            "model": req.metadata.model,
            "inference_ms": req.metadata.inference_ms,
        });

        if sent.is_empty() {
            if let Err(e) =
                self.ctx
                    .jobs
                    .finish(&job.id, JobStatus::Failed, Some(&result), Some("no segment delivered"))
            {
                warn!(error = %e, "job failure record failed");
            }
            return StageOutcome::Transient("no segment delivered".to_string());
        }

        if let Err(e) = self
            .ctx
            .jobs
            .finish(&job.id, JobStatus::Completed, Some(&result), None)
        {
            warn!(error = %e, "job completion record failed");
        }
        info!(
            segments_sent = sent.len(),
            segments_total = total,
            status = %status,
            "reply complete"
        );
        StageOutcome::Done
    }
}

impl ReplyStage {
    /// Up to [`SEND_ATTEMPTS`] tries per segment with exponential
    /// backoff (`retry_delay · 2^n`) plus 0–500 ms jitter.
    async fn send_with_retry(
        &self,
        transport: &dyn WahaTransport,
        req: &ReplyRequest,
        text: &str,
    ) -> Result<(), String> {
        let base = self.ctx.config.humanizer.retry_delay_ms;
        let mut last_error = String::new();

        for attempt in 0..SEND_ATTEMPTS {
            match transport
                .send_text(&req.wa_account_id, &req.whatsapp_chat_id, text)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    if !e.is_transient() || attempt + 1 == SEND_ATTEMPTS {
                        break;
                    }
                    let jitter = rand::thread_rng().gen_range(0..=SEND_JITTER_MAX_MS);
                    let delay = Duration::from_millis(base * (1 << attempt) + jitter);
                    if !self.sleep(delay).await {
                        return Err("cancelled during send retry".to_string());
                    }
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;
    use crate::types::ReplyMetadata;

    fn reply_request(h: &Harness, text: &str) -> ReplyRequest {
        ReplyRequest {
            chat_key: "u1:wa1:c1@c.us".to_string(),
            ai_response: text.to_string(),
            turn: 1,
            session_id: h.session.id.clone(),
            wa_account_id: "wa1".to_string(),
            whatsapp_chat_id: "c1@c.us".to_string(),
            metadata: ReplyMetadata {
                tokens_used: 30,
                inference_ms: 900,
                model: "mock-model".to_string(),
                agent_id: h.agent.id.clone(),
            },
        }
    }

    fn seed_assistant(h: &Harness, text: &str) {
        h.ctx
            .conversations
            .get_or_create("u1:wa1:c1@c.us", &h.session.id)
            .unwrap();
        h.ctx
            .messages
            .insert_exchange("u1:wa1:c1@c.us", 0, "question", text)
            .unwrap();
    }

    async fn run(h: &Harness, req: ReplyRequest) -> StageOutcome {
        let stage = ReplyStage::new(Arc::clone(&h.ctx));
        stage
            .handle(&Delivery {
                payload: req,
                attempt: 1,
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn full_send_marks_message_sent() {
        let h = Harness::new();
        seed_assistant(&h, "Here is your answer.");
        let outcome = run(&h, reply_request(&h, "Here is your answer.")).await;
        assert_eq!(outcome, StageOutcome::Done);

        // Safety trim strips the trailing period before sending.
        assert_eq!(h.waha.sent_texts(), vec!["Here is your answer".to_string()]);
        let msg = h
            .ctx
            .messages
            .get("u1:wa1:c1@c.us", 1, Role::Assistant)
            .unwrap()
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);

        // Typing indicator bracketed the send.
        let events = h.waha.typing_events.lock().unwrap().clone();
        assert_eq!(events, vec!["start", "stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_send_keeps_delivered_prefix() {
        let h = Harness::new();
        // Three paragraphs, each too big to concatenate with a neighbour.
        let p = "This sentence is about forty characters. ".repeat(15);
        let text = format!("{}\n\n{}\n\n{}", p.trim(), p.trim(), p.trim());
        seed_assistant(&h, &text);

        // Segment 3 fails on every attempt (3 tries).
        h.waha.script_sends(vec![
            None,
            None,
            Some("chat gone".to_string()),
            Some("chat gone".to_string()),
            Some("chat gone".to_string()),
        ]);

        let outcome = run(&h, reply_request(&h, &text)).await;
        assert_eq!(outcome, StageOutcome::Done);
        assert_eq!(h.waha.sent_texts().len(), 2);

        let msg = h
            .ctx
            .messages
            .get("u1:wa1:c1@c.us", 1, Role::Assistant)
            .unwrap()
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Partial);
        assert_eq!(msg.content, h.waha.sent_texts().join("\n\n"));

        // Job result records 2/3 and the segment error.
        let job = h
            .ctx
            .jobs
            .find_terminal("u1:wa1:c1@c.us", 1, JobStage::Reply)
            .unwrap()
            .unwrap();
        let result = job.result.unwrap();
        assert_eq!(result["segments_total"], 3);
        assert_eq!(result["segments_sent"], 2);
        assert_eq!(result["segment_errors"][0]["segment"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_segment_failure_aborts_rest() {
        let h = Harness::new();
        let p = "This sentence is about forty characters. ".repeat(15);
        let text = format!("{}\n\n{}\n\n{}", p.trim(), p.trim(), p.trim());
        seed_assistant(&h, &text);

        // Every attempt of segment 1 fails; segments 2 and 3 must never
        // be attempted.
        h.waha.script_sends(vec![
            Some("down".to_string()),
            Some("down".to_string()),
            Some("down".to_string()),
        ]);

        let outcome = run(&h, reply_request(&h, &text)).await;
        assert!(matches!(outcome, StageOutcome::Transient(_)));
        assert!(h.waha.sent_texts().is_empty());

        let msg = h
            .ctx
            .messages
            .get("u1:wa1:c1@c.us", 1, Role::Assistant)
            .unwrap()
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn send_retries_transient_rejections() {
        let h = Harness::new();
        seed_assistant(&h, "hello there");
        // First two attempts rejected, third lands.
        h.waha.script_sends(vec![
            Some("flaky".to_string()),
            Some("flaky".to_string()),
            None,
        ]);

        let outcome = run(&h, reply_request(&h, "hello there")).await;
        assert_eq!(outcome, StageOutcome::Done);
        assert_eq!(h.waha.sent_texts(), vec!["hello there".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn suppressed_chat_sends_nothing() {
        let h = Harness::new();
        seed_assistant(&h, "should not go out");
        let chat_key = ChatKey::parse("u1:wa1:c1@c.us").unwrap();
        h.ctx.intervention.pause_conversation(&chat_key).unwrap();

        let outcome = run(&h, reply_request(&h, "should not go out")).await;
        assert_eq!(outcome, StageOutcome::Suppressed);
        assert!(h.waha.sent_texts().is_empty());

        let msg = h
            .ctx
            .messages
            .get("u1:wa1:c1@c.us", 1, Role::Assistant)
            .unwrap()
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Suppressed);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_after_success_is_a_noop() {
        let h = Harness::new();
        seed_assistant(&h, "once only");
        assert_eq!(run(&h, reply_request(&h, "once only")).await, StageOutcome::Done);
        assert_eq!(run(&h, reply_request(&h, "once only")).await, StageOutcome::Done);
        // The terminal job row short-circuits the second delivery.
        assert_eq!(h.waha.sent_texts().len(), 1);
    }
}
