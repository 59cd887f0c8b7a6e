//! Error types for the run orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the engine's caller-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Capacity exceeded: {running} running, {queued} queued, limit {limit}")]
    CapacityExceeded {
        running: usize,
        queued: usize,
        limit: usize,
    },

    #[error("Request {id} not found")]
    NotFound { id: Uuid },

    #[error("Request {id} is {state}, cannot cancel")]
    InvalidTransition { id: Uuid, state: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised by a unit of work. Captured by the run supervisor, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("{0}")]
    Failed(String),

    #[error("Interrupted by cancellation")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Batch scheduler command errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Could not parse {command} output: {output}")]
    Parse { command: String, output: String },

    #[error("No batch script found (tried {tried})")]
    NoScript { tried: String },
}

impl SchedulerError {
    /// Whether a retry may succeed (process could not be started or hung).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Timeout { .. })
    }
}
