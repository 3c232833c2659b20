// Infrastructure shared by every part of the engine

pub mod config;
pub mod errors;

pub use config::{BackoffStrategy, EngineConfig, RetryPolicy};
pub use errors::{Result, StagehandError};
