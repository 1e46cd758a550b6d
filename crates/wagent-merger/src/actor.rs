//! Per-ChatKey merge actor.
//!
//! One task per chat serializes that chat's inbound messages; different
//! chats run in parallel. The flush alarm slides on every new message
//! and the buffer is persisted after every mutation so a restart can
//! re-arm the window from disk.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wagent_core::ChatKey;
use wagent_store::buffers::BufferStore;
use wagent_store::types::{BufferSnapshot, BufferedMessage};

use crate::flush::{flushes_immediately, merge_texts};
use crate::types::{IncomingChatMessage, MergeSink, MergedRequest};

/// Initial retry delay when the sink rejects a flush.
const ENQUEUE_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Retry delay cap.
const ENQUEUE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Live window state; `None` between bursts.
struct BufferState {
    session_id: String,
    agent_id: Option<String>,
    messages: Vec<BufferedMessage>,
    started_at_ms: i64,
    last_message_at_ms: i64,
    deadline: Instant,
}

pub(crate) struct ChatActor {
    chat_key: ChatKey,
    window: Duration,
    buffers: Arc<BufferStore>,
    sink: Arc<dyn MergeSink>,
    rx: mpsc::Receiver<IncomingChatMessage>,
    cancel: CancellationToken,
    state: Option<BufferState>,
}

impl ChatActor {
    pub(crate) fn new(
        chat_key: ChatKey,
        window: Duration,
        buffers: Arc<BufferStore>,
        sink: Arc<dyn MergeSink>,
        rx: mpsc::Receiver<IncomingChatMessage>,
        cancel: CancellationToken,
        snapshot: Option<BufferSnapshot>,
    ) -> Self {
        let state = snapshot.map(|snap| {
            // Re-arm from the persisted window; fire immediately when overdue.
            let now_ms = chrono::Utc::now().timestamp_millis();
            let due_ms = snap.last_message_at_ms + window.as_millis() as i64;
            let remaining = Duration::from_millis(due_ms.saturating_sub(now_ms).max(0) as u64);
            BufferState {
                session_id: snap.session_id,
                agent_id: snap.agent_id,
                messages: snap.messages,
                started_at_ms: snap.started_at_ms,
                last_message_at_ms: snap.last_message_at_ms,
                deadline: Instant::now() + remaining,
            }
        });
        Self {
            chat_key,
            window,
            buffers,
            sink,
            rx,
            cancel,
            state,
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let deadline = self.state.as_ref().map(|s| s.deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Buffer already persisted after every mutation;
                    // nothing further to save.
                    debug!(chat_key = %self.chat_key, "merge actor cancelled");
                    break;
                }
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(msg) => self.on_message(msg).await,
                        None => break,
                    }
                }
                _ = alarm(deadline) => {
                    self.flush().await;
                }
            }
        }
    }

    async fn on_message(&mut self, msg: IncomingChatMessage) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window = self.window;
        let state = self.state.get_or_insert_with(|| BufferState {
            session_id: msg.session_id.clone(),
            agent_id: None,
            messages: Vec::new(),
            started_at_ms: now_ms,
            last_message_at_ms: now_ms,
            deadline: Instant::now() + window,
        });

        state.messages.push(BufferedMessage {
            message_id: msg.message_id,
            text: msg.text.clone(),
            timestamp_ms: msg.timestamp_ms,
            has_media: msg.has_media,
        });
        state.last_message_at_ms = now_ms;
        // Sliding window: each message pushes the alarm out again.
        state.deadline = Instant::now() + window;
        if msg.agent_id.is_some() {
            state.agent_id = msg.agent_id;
        }

        self.persist();

        // Sentence terminator or sheer length ends the burst right away.
        if flushes_immediately(&msg.text) {
            self.flush().await;
        }
    }

    /// Emit the merged request and clear the buffer. Messages arriving
    /// afterwards start a fresh window.
    async fn flush(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };

        state.messages.sort_by_key(|m| m.timestamp_ms);
        let merged_text = merge_texts(state.messages.iter().map(|m| m.text.as_str()));
        let request = MergedRequest {
            chat_key: self.chat_key.format(),
            session_id: state.session_id.clone(),
            merged_text,
            started_at_ms: state.started_at_ms,
            ended_at_ms: chrono::Utc::now().timestamp_millis(),
            message_count: state.messages.len(),
            has_media: state.messages.iter().any(|m| m.has_media),
            agent_id: state.agent_id.clone(),
        };

        info!(
            chat_key = %self.chat_key,
            message_count = request.message_count,
            "flushing merge window"
        );

        // The buffer is never dropped on sink failure: retry with
        // backoff until delivery succeeds or shutdown wins.
        let mut delay = ENQUEUE_BACKOFF_BASE;
        loop {
            match self.sink.deliver(request.clone()).await {
                Ok(()) => {
                    if let Err(e) = self.buffers.delete(&self.chat_key.format()) {
                        warn!(chat_key = %self.chat_key, error = %e, "buffer snapshot delete failed");
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        chat_key = %self.chat_key,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "merge flush enqueue failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            // Keep the buffer; the persisted snapshot
                            // replays it after restart.
                            self.state = Some(state);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(ENQUEUE_BACKOFF_MAX);
                }
            }
        }
    }

    fn persist(&self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let snapshot = BufferSnapshot {
            chat_key: self.chat_key.format(),
            session_id: state.session_id.clone(),
            agent_id: state.agent_id.clone(),
            messages: state.messages.clone(),
            started_at_ms: state.started_at_ms,
            last_message_at_ms: state.last_message_at_ms,
        };
        if let Err(e) = self.buffers.save(&snapshot) {
            error!(chat_key = %self.chat_key, error = %e, "buffer snapshot save failed");
        }
    }
}

/// Sleep until the flush deadline, or forever when no window is open.
async fn alarm(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
