//! Run orchestrator: admission-controlled execution of work requests with
//! forced cancellation and external batch job tracking.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod store;

pub use config::{EngineConfig, SchedulerConfig, ServerConfig};
pub use engine::{CancelOutcome, Engine, QueueStatus, RecoveryReport};
pub use error::{ConfigError, EngineError};
