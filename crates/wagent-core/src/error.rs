use thiserror::Error;

#[derive(Debug, Error)]
pub enum WagentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid chat key: {0}")]
    InvalidChatKey(String),

    #[error("Webhook signature verification failed: {0}")]
    BadSignature(String),

    #[error("Unknown WAHA account: {0}")]
    UnknownAccount(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("WAHA gateway error: {0}")]
    Waha(String),

    #[error("Vector index error: {0}")]
    VectorIndex(String),

    #[error("Credential sealing error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WagentError {
    /// Short error code string used in HTTP error bodies and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            WagentError::Config(_) => "CONFIG_ERROR",
            WagentError::InvalidChatKey(_) => "INVALID_CHAT_KEY",
            WagentError::BadSignature(_) => "BAD_SIGNATURE",
            WagentError::UnknownAccount(_) => "UNKNOWN_ACCOUNT",
            WagentError::Database(_) => "DATABASE_ERROR",
            WagentError::LlmProvider(_) => "LLM_PROVIDER_ERROR",
            WagentError::Waha(_) => "WAHA_ERROR",
            WagentError::VectorIndex(_) => "VECTOR_INDEX_ERROR",
            WagentError::Crypto(_) => "CRYPTO_ERROR",
            WagentError::Serialization(_) => "SERIALIZATION_ERROR",
            WagentError::Io(_) => "IO_ERROR",
            WagentError::Timeout { .. } => "TIMEOUT",
            WagentError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, WagentError>;
