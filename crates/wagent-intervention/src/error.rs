use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterventionError {
    /// The ChatKey does not belong to any known session.
    #[error("unknown session for account: {0}")]
    UnknownSession(String),

    #[error("store error: {0}")]
    Store(#[from] wagent_store::StoreError),
}

pub type Result<T> = std::result::Result<T, InterventionError>;
