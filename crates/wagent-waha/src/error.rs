use thiserror::Error;

#[derive(Debug, Error)]
pub enum WahaError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WAHA API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("send rejected: {0}")]
    SendRejected(String),

    #[error("WAHA version {found} below required {required}")]
    VersionTooOld { found: String, required: String },

    #[error("parse error: {0}")]
    Parse(String),
}

impl WahaError {
    /// Whether retrying the call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            WahaError::Http(_) => true,
            WahaError::Api { status, .. } => *status >= 500,
            WahaError::SendRejected(_) => true,
            WahaError::VersionTooOld { .. } => false,
            WahaError::Parse(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WahaError>;
