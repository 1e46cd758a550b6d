use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergerError {
    /// The per-chat actor's mailbox is gone (shutdown in progress).
    #[error("chat actor unavailable: {0}")]
    ActorUnavailable(String),

    #[error("store error: {0}")]
    Store(#[from] wagent_store::StoreError),
}

pub type Result<T> = std::result::Result<T, MergerError>;
