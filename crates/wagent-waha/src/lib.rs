pub mod client;
pub mod error;
pub mod types;

pub use client::{WahaClient, WahaTransport};
pub use error::{Result, WahaError};
pub use types::{SendResult, SessionStatusInfo};
