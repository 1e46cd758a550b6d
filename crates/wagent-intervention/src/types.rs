use std::fmt;

/// The auto-reply gate's verdict for one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub reason: DecisionReason,
}

impl Decision {
    pub fn allowed(reason: DecisionReason) -> Self {
        Self {
            allow: true,
            reason,
        }
    }

    pub fn denied(reason: DecisionReason) -> Self {
        Self {
            allow: false,
            reason,
        }
    }
}

/// Why the gate allowed or denied.
///
/// Session level dominates conversation level, so `SessionPaused` is
/// reported even when the conversation is also paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Enabled,
    SessionPaused,
    ConversationPaused,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Enabled => "enabled",
            DecisionReason::SessionPaused => "session_paused",
            DecisionReason::ConversationPaused => "conversation_paused",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change applied by the controller, named for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterventionAction {
    SessionPause,
    SessionResume,
    ConversationPause,
    ConversationResume,
}

impl InterventionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionAction::SessionPause => "session_pause",
            InterventionAction::SessionResume => "session_resume",
            InterventionAction::ConversationPause => "conversation_pause",
            InterventionAction::ConversationResume => "conversation_resume",
        }
    }
}

impl fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
