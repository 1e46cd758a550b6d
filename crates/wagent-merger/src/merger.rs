use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wagent_core::ChatKey;
use wagent_store::buffers::BufferStore;
use wagent_store::types::BufferSnapshot;

use crate::actor::ChatActor;
use crate::error::{MergerError, Result};
use crate::types::{IncomingChatMessage, MergeSink};

/// Mailbox depth per chat actor.
const ACTOR_MAILBOX: usize = 64;

/// Routes inbound messages to per-ChatKey merge actors, spawning them
/// on demand.
///
/// Same-key messages serialize through one actor's mailbox; different
/// keys run in parallel.
pub struct ChatMerger {
    window: Duration,
    actors: DashMap<String, mpsc::Sender<IncomingChatMessage>>,
    buffers: Arc<BufferStore>,
    sink: Arc<dyn MergeSink>,
    cancel: CancellationToken,
}

impl ChatMerger {
    pub fn new(
        window_ms: u64,
        buffers: Arc<BufferStore>,
        sink: Arc<dyn MergeSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            actors: DashMap::new(),
            buffers,
            sink,
            cancel,
        }
    }

    /// Respawn actors for every persisted buffer snapshot. Overdue
    /// windows flush immediately. Returns the number of chats restored.
    pub fn rehydrate(&self) -> Result<usize> {
        let snapshots = self.buffers.load_all()?;
        let count = snapshots.len();
        for snapshot in snapshots {
            let chat_key = match ChatKey::parse(&snapshot.chat_key) {
                Ok(k) => k,
                Err(e) => {
                    warn!(chat_key = %snapshot.chat_key, error = %e, "skipping corrupt buffer snapshot");
                    continue;
                }
            };
            let tx = self.spawn_actor(chat_key, Some(snapshot));
            self.actors.insert(tx.0, tx.1);
        }
        if count > 0 {
            info!(count, "merge buffers rehydrated");
        }
        Ok(count)
    }

    /// Hand one inbound message to its chat's actor, spawning the actor
    /// when absent or respawning it if its mailbox is gone.
    pub async fn submit(&self, mut msg: IncomingChatMessage) -> Result<()> {
        let key = msg.chat_key.format();
        loop {
            let tx = self
                .actors
                .entry(key.clone())
                .or_insert_with(|| self.spawn_actor(msg.chat_key.clone(), None).1)
                .clone();

            match tx.send(msg).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    if self.cancel.is_cancelled() {
                        return Err(MergerError::ActorUnavailable(key));
                    }
                    // The actor exited (mailbox closed); drop the stale
                    // entry and try again with a fresh one.
                    warn!(chat_key = %key, "chat actor gone, respawning");
                    self.actors.remove(&key);
                    msg = returned;
                }
            }
        }
    }

    /// Number of live chat actors (for the health endpoint).
    pub fn active_chats(&self) -> usize {
        self.actors.len()
    }

    fn spawn_actor(
        &self,
        chat_key: ChatKey,
        snapshot: Option<BufferSnapshot>,
    ) -> (String, mpsc::Sender<IncomingChatMessage>) {
        let (tx, rx) = mpsc::channel(ACTOR_MAILBOX);
        let actor = ChatActor::new(
            chat_key.clone(),
            self.window,
            Arc::clone(&self.buffers),
            Arc::clone(&self.sink),
            rx,
            self.cancel.clone(),
            snapshot,
        );
        tokio::spawn(actor.run());
        (chat_key.format(), tx)
    }
}
