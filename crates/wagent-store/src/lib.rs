pub mod agents;
pub mod audit;
pub mod buffers;
pub mod chunks;
pub mod conversations;
pub mod db;
pub mod dedup;
pub mod error;
pub mod jobs;
pub mod messages;
pub mod metrics;
pub mod sessions;
pub mod types;

pub use error::{Result, StoreError};
