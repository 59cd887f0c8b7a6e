//! Configuration types.
//!
//! Every config has a `Default` and a `from_env()` constructor. Environment
//! variables share the `ORCHESTRATOR_` prefix.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration: admission limits and cancellation timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of simultaneously running requests (K).
    pub max_concurrent_runs: usize,
    /// Maximum number of queued requests beyond the running ones (M).
    pub max_queue_size: usize,
    /// Root directory; each run gets `<work_dir>/<request_id>/`.
    pub work_dir: PathBuf,
    /// How long to wait for a forcibly terminated unit to stop.
    pub terminate_timeout: Duration,
    /// Poll interval while waiting for termination.
    pub terminate_poll_interval: Duration,
    /// Lookup attempts for state that may not exist yet (token, admission).
    pub token_wait_attempts: u32,
    /// Initial backoff between those attempts.
    pub token_wait_backoff: Duration,
    /// Default page size for recent requests.
    pub recent_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 3,
            max_queue_size: 10,
            work_dir: PathBuf::from("."),
            terminate_timeout: Duration::from_secs(5),
            terminate_poll_interval: Duration::from_millis(50),
            token_wait_attempts: 10,
            token_wait_backoff: Duration::from_millis(50),
            recent_limit: 10,
        }
    }
}

impl EngineConfig {
    /// Load from environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_concurrent_runs: env_parse("ORCHESTRATOR_MAX_CONCURRENT")?
                .unwrap_or(defaults.max_concurrent_runs),
            max_queue_size: env_parse("ORCHESTRATOR_MAX_QUEUE")?
                .unwrap_or(defaults.max_queue_size),
            work_dir: std::env::var("ORCHESTRATOR_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            terminate_timeout: env_millis("ORCHESTRATOR_TERMINATE_TIMEOUT_MS")?
                .unwrap_or(defaults.terminate_timeout),
            terminate_poll_interval: env_millis("ORCHESTRATOR_TERMINATE_POLL_MS")?
                .unwrap_or(defaults.terminate_poll_interval),
            token_wait_attempts: env_parse("ORCHESTRATOR_TOKEN_WAIT_ATTEMPTS")?
                .unwrap_or(defaults.token_wait_attempts),
            token_wait_backoff: env_millis("ORCHESTRATOR_TOKEN_WAIT_BACKOFF_MS")?
                .unwrap_or(defaults.token_wait_backoff),
            recent_limit: env_parse("ORCHESTRATOR_RECENT_LIMIT")?
                .unwrap_or(defaults.recent_limit),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would wedge the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_runs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.terminate_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "terminate_poll_interval".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Total number of requests the engine will hold (K + M).
    pub fn capacity(&self) -> usize {
        self.max_concurrent_runs + self.max_queue_size
    }
}

/// External batch scheduler configuration (Slurm-style command line).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub submit_command: String,
    pub queue_command: String,
    pub accounting_command: String,
    pub cancel_command: String,
    /// Script names looked up in a job's work path, in order.
    pub script_names: Vec<String>,
    /// Per-command timeout.
    pub command_timeout: Duration,
    /// Extra attempts for transient command failures.
    pub command_retries: u32,
    pub retry_backoff: Duration,
    /// Result artifact read from a completed job's work path.
    pub result_file: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit_command: "sbatch".to_string(),
            queue_command: "squeue".to_string(),
            accounting_command: "sacct".to_string(),
            cancel_command: "scancel".to_string(),
            script_names: vec![
                "submit.sh".to_string(),
                "run.sh".to_string(),
                "slurm.sh".to_string(),
            ],
            command_timeout: Duration::from_secs(60),
            command_retries: 2,
            retry_backoff: Duration::from_millis(500),
            result_file: "result.json".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let script_names = std::env::var("ORCHESTRATOR_SCRIPT_NAMES")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty())
            .unwrap_or(defaults.script_names);

        Ok(Self {
            submit_command: std::env::var("ORCHESTRATOR_SUBMIT_CMD")
                .unwrap_or(defaults.submit_command),
            queue_command: std::env::var("ORCHESTRATOR_QUEUE_CMD")
                .unwrap_or(defaults.queue_command),
            accounting_command: std::env::var("ORCHESTRATOR_ACCOUNTING_CMD")
                .unwrap_or(defaults.accounting_command),
            cancel_command: std::env::var("ORCHESTRATOR_CANCEL_CMD")
                .unwrap_or(defaults.cancel_command),
            script_names,
            command_timeout: env_millis("ORCHESTRATOR_COMMAND_TIMEOUT_MS")?
                .unwrap_or(defaults.command_timeout),
            command_retries: env_parse("ORCHESTRATOR_COMMAND_RETRIES")?
                .unwrap_or(defaults.command_retries),
            retry_backoff: env_millis("ORCHESTRATOR_RETRY_BACKOFF_MS")?
                .unwrap_or(defaults.retry_backoff),
            result_file: std::env::var("ORCHESTRATOR_RESULT_FILE")
                .unwrap_or(defaults.result_file),
        })
    }
}

const UNIT_COMMAND_ENV: &str = "ORCHESTRATOR_UNIT_COMMAND";

/// HTTP surface and process wiring for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Shell command run for each request by the command-backed unit of work.
    pub unit_command: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            db_path: PathBuf::from("./data/orchestrator.db"),
            unit_command: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind: env_parse("ORCHESTRATOR_BIND")?.unwrap_or(defaults.bind),
            db_path: std::env::var("ORCHESTRATOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            unit_command: std::env::var(UNIT_COMMAND_ENV)
                .ok()
                .filter(|s| !s.trim().is_empty()),
        })
    }

    /// The command the binary runs per request; there is no default.
    pub fn require_unit_command(&self) -> Result<&str, ConfigError> {
        self.unit_command
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar(UNIT_COMMAND_ENV.to_string()))
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_runs, 3);
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.capacity(), 13);
        assert_eq!(config.terminate_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = EngineConfig {
            max_concurrent_runs: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn missing_unit_command_is_reported() {
        let config = ServerConfig::default();
        match config.require_unit_command() {
            Err(ConfigError::MissingEnvVar(key)) => assert_eq!(key, "ORCHESTRATOR_UNIT_COMMAND"),
            other => panic!("unexpected {other:?}"),
        }

        let config = ServerConfig {
            unit_command: Some("./run.sh".into()),
            ..ServerConfig::default()
        };
        assert_eq!(config.require_unit_command().unwrap(), "./run.sh");
    }

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.submit_command, "sbatch");
        assert_eq!(config.script_names, vec!["submit.sh", "run.sh", "slurm.sh"]);
        assert_eq!(config.result_file, "result.json");
    }
}
