pub mod actor;
pub mod error;
pub mod flush;
pub mod merger;
pub mod types;

pub use error::{MergerError, Result};
pub use merger::ChatMerger;
pub use types::{IncomingChatMessage, MergeSink, MergedRequest};
