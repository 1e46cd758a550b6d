//! Cross-stage flow tests: one merged request driven through
//! retrieve → infer → reply by pumping the queues by hand.

use std::sync::Arc;

use wagent_core::types::{JobStage, JobStatus, MessageStatus, Role};
use wagent_core::ChatKey;
use wagent_merger::MergedRequest;

use crate::infer::InferStage;
use crate::queue::{Delivery, StageHandler, StageOutcome};
use crate::reply::ReplyStage;
use crate::retrieve::RetrieveStage;
use crate::testutil::{Harness, MockLlm};

const CHAT: &str = "u1:wa1:c1@c.us";

fn merged(h: &Harness, text: &str) -> MergedRequest {
    MergedRequest {
        chat_key: CHAT.to_string(),
        session_id: h.session.id.clone(),
        merged_text: text.to_string(),
        started_at_ms: 0,
        ended_at_ms: 2600,
        message_count: 3,
        has_media: false,
        agent_id: None,
    }
}

/// Drive one merged request through all three stages, returning each
/// stage's outcome. Stops early when a stage does not enqueue further
/// work.
async fn drive(h: &Harness, request: MergedRequest) -> Vec<StageOutcome> {
    let mut outcomes = Vec::new();

    let retrieve = RetrieveStage::new(Arc::clone(&h.ctx));
    outcomes.push(
        retrieve
            .handle(&Delivery {
                payload: request,
                attempt: 1,
            })
            .await,
    );
    if h.ctx.infer_queue.depth() == 0 {
        return outcomes;
    }

    let infer = InferStage::new(Arc::clone(&h.ctx));
    let delivery = h.infer_rx.recv().await.unwrap();
    outcomes.push(infer.handle(&delivery).await);
    if h.ctx.reply_queue.depth() == 0 {
        return outcomes;
    }

    let reply = ReplyStage::new(Arc::clone(&h.ctx));
    let delivery = h.reply_rx.recv().await.unwrap();
    outcomes.push(reply.handle(&delivery).await);
    outcomes
}

#[tokio::test(start_paused = true)]
async fn merged_burst_produces_one_sent_reply() {
    let h = Harness::new();
    h.llm
        .push_completion(Ok(MockLlm::canned("你好！价格是42元")));

    let outcomes = drive(&h, merged(&h, "你好 我想 问价格")).await;
    assert_eq!(
        outcomes,
        vec![StageOutcome::Done, StageOutcome::Done, StageOutcome::Done]
    );

    // Exactly one assistant message at turn 1, status sent.
    let assistant = h
        .ctx
        .messages
        .get(CHAT, 1, Role::Assistant)
        .unwrap()
        .unwrap();
    assert_eq!(assistant.status, MessageStatus::Sent);
    assert_eq!(h.waha.sent_texts().len(), 1);
    assert_eq!(h.waha.sent_texts()[0], "你好！价格是42元");

    // All three job rows terminal.
    for stage in [JobStage::Retrieve, JobStage::Infer] {
        let job = h.ctx.jobs.find_terminal(CHAT, 0, stage).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    let reply_job = h
        .ctx
        .jobs
        .find_terminal(CHAT, 1, JobStage::Reply)
        .unwrap()
        .unwrap();
    assert_eq!(reply_job.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn punctuation_pause_then_resume() {
    let h = Harness::new();
    let chat_key = ChatKey::parse(CHAT).unwrap();

    // "Stop the bot," — the dispatcher applies the punctuation command
    // before the merged request reaches the pipeline.
    h.ctx
        .intervention
        .apply_punctuation(&chat_key, "Stop the bot,")
        .unwrap();
    let outcomes = drive(&h, merged(&h, "Stop the bot,")).await;
    assert_eq!(outcomes, vec![StageOutcome::Suppressed]);

    // The suppressed user message is on record; nothing went out.
    let user = h.ctx.messages.get(CHAT, 0, Role::User).unwrap().unwrap();
    assert_eq!(user.status, MessageStatus::Suppressed);
    assert!(h.waha.sent_texts().is_empty());

    // Follow-up without a resume stays silent too.
    let outcomes = drive(&h, merged(&h, "hello?")).await;
    assert_eq!(outcomes, vec![StageOutcome::Suppressed]);
    assert!(h.waha.sent_texts().is_empty());

    // "Please help." resumes and the pipeline runs end to end, with
    // the assistant's trailing period trimmed before sending.
    h.ctx
        .intervention
        .apply_punctuation(&chat_key, "Please help.")
        .unwrap();
    h.llm.push_completion(Ok(MockLlm::canned("Of course.")));
    let outcomes = drive(&h, merged(&h, "Please help.")).await;
    assert_eq!(
        outcomes,
        vec![StageOutcome::Done, StageOutcome::Done, StageOutcome::Done]
    );
    assert_eq!(h.waha.sent_texts(), vec!["Of course".to_string()]);

    // The audit trail shows the pause and the resume, newest first.
    let entries = h.audit.recent(&chat_key.format(), 10).unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["conversation_resume", "conversation_pause"]);
}

#[tokio::test(start_paused = true)]
async fn session_pause_suppresses_at_retrieve_without_llm_call() {
    let h = Harness::new();
    h.ctx.intervention.pause_session(&h.session.id).unwrap();

    let outcomes = drive(&h, merged(&h, "anyone there")).await;
    assert_eq!(outcomes, vec![StageOutcome::Suppressed]);

    // No provider call, no WAHA call, suppressed retrieve job.
    assert!(h.llm.requests.lock().unwrap().is_empty());
    assert!(h.waha.sent_texts().is_empty());
    let job = h
        .ctx
        .jobs
        .find_terminal(CHAT, 0, JobStage::Retrieve)
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Suppressed);
}

#[tokio::test(start_paused = true)]
async fn turns_advance_across_exchanges() {
    let h = Harness::new();

    h.llm.push_completion(Ok(MockLlm::canned("first answer")));
    drive(&h, merged(&h, "first question")).await;
    h.llm.push_completion(Ok(MockLlm::canned("second answer")));
    drive(&h, merged(&h, "second question")).await;

    let conv = h.ctx.conversations.get(CHAT).unwrap().unwrap();
    assert_eq!(conv.last_turn, 2);

    // u0, a1, u1, a2: assistant replies in ascending turn order.
    assert_eq!(
        h.ctx.messages.get(CHAT, 0, Role::User).unwrap().unwrap().content,
        "first question"
    );
    assert_eq!(
        h.ctx.messages.get(CHAT, 1, Role::Assistant).unwrap().unwrap().content,
        "first answer"
    );
    assert_eq!(
        h.ctx.messages.get(CHAT, 1, Role::User).unwrap().unwrap().content,
        "second question"
    );
    assert_eq!(
        h.ctx.messages.get(CHAT, 2, Role::Assistant).unwrap().unwrap().content,
        "second answer"
    );
    assert_eq!(h.waha.sent_texts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn second_exchange_sees_history() {
    let h = Harness::new();

    h.llm.push_completion(Ok(MockLlm::canned("my name is Bot")));
    drive(&h, merged(&h, "what is your name")).await;
    h.llm.push_completion(Ok(MockLlm::canned("you asked my name")));
    drive(&h, merged(&h, "what did I ask")).await;

    let requests = h.llm.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let second = &requests[1];
    // History carries the first exchange in chronological order.
    let contents: Vec<&str> = second.messages.iter().map(|m| m.content.as_str()).collect();
    let name_q = contents.iter().position(|c| *c == "what is your name").unwrap();
    let name_a = contents.iter().position(|c| *c == "my name is Bot").unwrap();
    assert!(name_q < name_a);
    assert_eq!(*contents.last().unwrap(), "what did I ask");
}
