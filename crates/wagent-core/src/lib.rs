pub mod config;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{Result, WagentError};
pub use types::ChatKey;
