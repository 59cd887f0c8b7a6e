//! Batch scheduler command interface.
//!
//! `SlurmScheduler` shells out to the four Slurm-style commands. Every
//! invocation has a timeout; spawn failures and timeouts are retried, a
//! non-zero exit is reported as-is.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// The four operations of a command-line batch scheduler.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submit the batch script found in `work_dir`. Returns the scheduler job id.
    async fn submit(&self, work_dir: &Path) -> Result<String, SchedulerError>;

    /// `Some(line)` while the job is in the active queue, `None` once it left.
    async fn queue_state(&self, job_id: &str) -> Result<Option<String>, SchedulerError>;

    /// Terminal accounting state, `None` when the scheduler has no answer.
    async fn accounting_state(&self, job_id: &str) -> Result<Option<String>, SchedulerError>;

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError>;
}

/// Captured output of one scheduler command.
#[derive(Debug)]
struct CommandOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub struct SlurmScheduler {
    config: SchedulerConfig,
}

impl SlurmScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// First configured batch script present in `work_dir`.
    fn find_script(&self, work_dir: &Path) -> Result<PathBuf, SchedulerError> {
        self.config
            .script_names
            .iter()
            .map(|name| work_dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| SchedulerError::NoScript {
                tried: self.config.script_names.join(", "),
            })
    }

    /// Run a command, retrying transient failures.
    async fn run(
        &self,
        command: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, SchedulerError> {
        let mut attempt = 0;
        loop {
            match self.run_once(command, args, cwd).await {
                Err(e) if e.is_transient() && attempt < self.config.command_retries => {
                    attempt += 1;
                    warn!(command, attempt, error = %e, "Scheduler command failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn run_once(
        &self,
        command: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, SchedulerError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| SchedulerError::Spawn {
            command: command.to_string(),
            reason: "empty command".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| SchedulerError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        let timeout = self.config.command_timeout;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SchedulerError::Spawn {
                    command: command.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SchedulerError::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
        };

        let out = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        debug!(command, code = ?out.code, "Scheduler command finished");
        Ok(out)
    }
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
    async fn submit(&self, work_dir: &Path) -> Result<String, SchedulerError> {
        let script = self.find_script(work_dir)?;
        let script_arg = script.to_string_lossy();
        let command = &self.config.submit_command;

        let out = self.run(command, &[&*script_arg], Some(work_dir)).await?;
        if !out.success() {
            return Err(SchedulerError::CommandFailed {
                command: command.clone(),
                code: out.code,
                stderr: out.stderr,
            });
        }

        // "Submitted batch job 12345"
        out.stdout
            .split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or_else(|| SchedulerError::Parse {
                command: command.clone(),
                output: out.stdout.clone(),
            })
    }

    async fn queue_state(&self, job_id: &str) -> Result<Option<String>, SchedulerError> {
        let out = self
            .run(&self.config.queue_command, &["-j", job_id, "--noheader"], None)
            .await?;
        let line = out.stdout.trim();
        if out.success() && !line.is_empty() {
            Ok(Some(line.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn accounting_state(&self, job_id: &str) -> Result<Option<String>, SchedulerError> {
        let out = self
            .run(
                &self.config.accounting_command,
                &["-j", job_id, "--format=State", "--noheader"],
                None,
            )
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let command = &self.config.cancel_command;
        let out = self.run(command, &[job_id], None).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SchedulerError::CommandFailed {
                command: command.clone(),
                code: out.code,
                stderr: out.stderr,
            })
        }
    }
}
