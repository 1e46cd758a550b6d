pub mod context;
#[cfg(test)]
mod flow_tests;
pub mod humanize;
pub mod infer;
pub mod queue;
pub mod reply;
pub mod retrieve;
#[cfg(test)]
pub(crate) mod testutil;
pub mod types;

pub use context::PipelineContext;
pub use queue::{Delivery, StageHandler, StageOutcome, StageQueue};
pub use types::{ContextChunk, InferRequest, ReplyRequest};
