use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, WagentError};

/// Canonical identifier for one WhatsApp conversation.
///
/// Format: `{user_id}:{wa_account_id}:{whatsapp_chat_id}`.
///
/// This is the unit of routing and locking: the merger serializes all
/// work for one ChatKey and runs different ChatKeys in parallel. The
/// WhatsApp chat id is the final component and may itself contain
/// colons, so parsing splits on the first two separators only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatKey {
    /// The tenant that owns the WhatsApp account.
    pub user_id: String,
    /// The WAHA account (session) the message arrived through.
    pub wa_account_id: String,
    /// The WhatsApp chat identifier (e.g. `8613800000000@c.us`).
    pub whatsapp_chat_id: String,
}

impl ChatKey {
    pub fn new(
        user_id: impl Into<String>,
        wa_account_id: impl Into<String>,
        whatsapp_chat_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            wa_account_id: wa_account_id.into(),
            whatsapp_chat_id: whatsapp_chat_id.into(),
        }
    }

    /// Return the canonical wire-format string.
    pub fn format(&self) -> String {
        format!(
            "{}:{}:{}",
            self.user_id, self.wa_account_id, self.whatsapp_chat_id
        )
    }

    /// Parse a wire-format key back into a `ChatKey`.
    ///
    /// The chat-id component may contain colons; only the first two
    /// separators are structural.
    pub fn parse(s: &str) -> Result<Self> {
        let first = s
            .find(':')
            .ok_or_else(|| WagentError::InvalidChatKey(s.to_string()))?;
        let user_id = &s[..first];
        let rest = &s[first + 1..];

        let second = rest
            .find(':')
            .ok_or_else(|| WagentError::InvalidChatKey(s.to_string()))?;
        let wa_account_id = &rest[..second];
        let whatsapp_chat_id = &rest[second + 1..];

        if user_id.is_empty() || wa_account_id.is_empty() || whatsapp_chat_id.is_empty() {
            return Err(WagentError::InvalidChatKey(s.to_string()));
        }

        Ok(Self {
            user_id: user_id.to_string(),
            wa_account_id: wa_account_id.to_string(),
            whatsapp_chat_id: whatsapp_chat_id.to_string(),
        })
    }
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// WAHA connection lifecycle for a tenant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    ScanQr,
    Working,
    Failed,
    Stopped,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::ScanQr => "scan_qr",
            ConnectionStatus::Working => "working",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(ConnectionStatus::Connecting),
            "scan_qr" => Ok(ConnectionStatus::ScanQr),
            "working" => Ok(ConnectionStatus::Working),
            "failed" => Ok(ConnectionStatus::Failed),
            "stopped" => Ok(ConnectionStatus::Stopped),
            other => Err(format!("unknown connection status: {}", other)),
        }
    }
}

/// Who authored a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Lifecycle of a persisted message.
///
/// `Sent`, `Partial`, `Suppressed` and `Failed` apply to assistant
/// messages; user messages only ever reach `Completed` or `Suppressed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Completed,
    Sent,
    Partial,
    Suppressed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Completed => "completed",
            MessageStatus::Sent => "sent",
            MessageStatus::Partial => "partial",
            MessageStatus::Suppressed => "suppressed",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "completed" => Ok(MessageStatus::Completed),
            "sent" => Ok(MessageStatus::Sent),
            "partial" => Ok(MessageStatus::Partial),
            "suppressed" => Ok(MessageStatus::Suppressed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {}", other)),
        }
    }
}

/// The pipeline stage a job row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Retrieve,
    Infer,
    Reply,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Retrieve => "retrieve",
            JobStage::Infer => "infer",
            JobStage::Reply => "reply",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "retrieve" => Ok(JobStage::Retrieve),
            "infer" => Ok(JobStage::Infer),
            "reply" => Ok(JobStage::Reply),
            other => Err(format!("unknown job stage: {}", other)),
        }
    }
}

/// Lifecycle of a job-ledger row.
///
/// `Completed` and `Suppressed` are terminal. `Failed` may be retried,
/// but each retry creates a fresh row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Suppressed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Suppressed => "suppressed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Suppressed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "suppressed" => Ok(JobStatus::Suppressed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}
