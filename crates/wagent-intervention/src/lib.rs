pub mod controller;
pub mod error;
pub mod types;

pub use controller::{safety_trim, InterventionController};
pub use error::{InterventionError, Result};
pub use types::{Decision, DecisionReason, InterventionAction};
