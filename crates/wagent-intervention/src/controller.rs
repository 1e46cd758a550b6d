//! Dual-layer auto-reply gate.
//!
//! Session level dominates conversation level: a paused session keeps
//! every chat under it silent regardless of per-chat state. End users
//! drive the conversation layer through a punctuation side-channel
//! (trailing comma pauses, trailing period resumes).

use std::sync::Arc;

use tracing::{info, instrument, warn};

use wagent_core::ChatKey;
use wagent_store::audit::AuditStore;
use wagent_store::conversations::ConversationStore;
use wagent_store::sessions::SessionStore;

use crate::error::{InterventionError, Result};
use crate::types::{Decision, DecisionReason, InterventionAction};

/// Characters that pause a conversation when trailing an inbound message.
const PAUSE_SUFFIXES: [char; 2] = [',', '，'];
/// Characters that resume a conversation when trailing an inbound message.
const RESUME_SUFFIXES: [char; 2] = ['.', '。'];

pub struct InterventionController {
    sessions: Arc<SessionStore>,
    conversations: Arc<ConversationStore>,
    audit: Arc<AuditStore>,
}

impl InterventionController {
    pub fn new(
        sessions: Arc<SessionStore>,
        conversations: Arc<ConversationStore>,
        audit: Arc<AuditStore>,
    ) -> Self {
        Self {
            sessions,
            conversations,
            audit,
        }
    }

    /// Whether the pipeline may produce an assistant reply for this chat.
    ///
    /// A missing Conversation row counts as enabled — the chat simply
    /// has not been paused yet.
    #[instrument(skip(self), fields(chat_key = %chat_key))]
    pub fn should_auto_reply(&self, chat_key: &ChatKey) -> Result<Decision> {
        let session = self
            .sessions
            .get_by_account(&chat_key.wa_account_id)?
            .ok_or_else(|| InterventionError::UnknownSession(chat_key.wa_account_id.clone()))?;

        if !session.auto_reply {
            return Ok(Decision::denied(DecisionReason::SessionPaused));
        }

        match self.conversations.get(&chat_key.format())? {
            Some(conv) if !conv.auto_reply => {
                Ok(Decision::denied(DecisionReason::ConversationPaused))
            }
            _ => Ok(Decision::allowed(DecisionReason::Enabled)),
        }
    }

    /// Pause auto-reply for a whole session (admin operation).
    #[instrument(skip(self))]
    pub fn pause_session(&self, session_id: &str) -> Result<()> {
        self.sessions.set_auto_reply(session_id, false)?;
        self.record_audit(InterventionAction::SessionPause, session_id);
        Ok(())
    }

    /// Resume auto-reply for a whole session.
    #[instrument(skip(self))]
    pub fn resume_session(&self, session_id: &str) -> Result<()> {
        self.sessions.set_auto_reply(session_id, true)?;
        self.record_audit(InterventionAction::SessionResume, session_id);
        Ok(())
    }

    /// Pause auto-reply for one chat.
    #[instrument(skip(self), fields(chat_key = %chat_key))]
    pub fn pause_conversation(&self, chat_key: &ChatKey) -> Result<()> {
        let session_id = self.session_id_for(chat_key)?;
        self.conversations
            .set_auto_reply(&chat_key.format(), &session_id, false)?;
        self.record_audit(InterventionAction::ConversationPause, &chat_key.format());
        Ok(())
    }

    /// Resume auto-reply for one chat.
    #[instrument(skip(self), fields(chat_key = %chat_key))]
    pub fn resume_conversation(&self, chat_key: &ChatKey) -> Result<()> {
        let session_id = self.session_id_for(chat_key)?;
        self.conversations
            .set_auto_reply(&chat_key.format(), &session_id, true)?;
        self.record_audit(InterventionAction::ConversationResume, &chat_key.format());
        Ok(())
    }

    /// Apply the punctuation side-channel for an inbound user message.
    ///
    /// Must run **before** the auto-reply gate is consulted for the
    /// same message, so "stop," suppresses the reply to itself.
    /// Returns the action applied, if any.
    #[instrument(skip(self, text), fields(chat_key = %chat_key))]
    pub fn apply_punctuation(
        &self,
        chat_key: &ChatKey,
        text: &str,
    ) -> Result<Option<InterventionAction>> {
        let trimmed = text.trim();
        let Some(last) = trimmed.chars().last() else {
            return Ok(None);
        };

        if PAUSE_SUFFIXES.contains(&last) {
            self.pause_conversation(chat_key)?;
            info!("conversation paused via punctuation command");
            return Ok(Some(InterventionAction::ConversationPause));
        }
        if RESUME_SUFFIXES.contains(&last) {
            self.resume_conversation(chat_key)?;
            info!("conversation resumed via punctuation command");
            return Ok(Some(InterventionAction::ConversationResume));
        }
        Ok(None)
    }

    fn session_id_for(&self, chat_key: &ChatKey) -> Result<String> {
        let session = self
            .sessions
            .get_by_account(&chat_key.wa_account_id)?
            .ok_or_else(|| InterventionError::UnknownSession(chat_key.wa_account_id.clone()))?;
        Ok(session.id)
    }

    /// Audit failures are logged and never block the state change.
    fn record_audit(&self, action: InterventionAction, target: &str) {
        if let Err(e) = self.audit.record(action.as_str(), target) {
            warn!(action = %action, target, error = %e, "audit write failed");
        }
    }
}

/// Strip a single trailing intervention character from outbound
/// assistant text, so the agent cannot accidentally pause or resume its
/// own conversation. Exactly one character is removed.
pub fn safety_trim(text: &str) -> &str {
    let trimmed = text.trim_end();
    match trimmed.chars().last() {
        Some(c) if PAUSE_SUFFIXES.contains(&c) || RESUME_SUFFIXES.contains(&c) => {
            &trimmed[..trimmed.len() - c.len_utf8()]
        }
        _ => trimmed,
    }
}
