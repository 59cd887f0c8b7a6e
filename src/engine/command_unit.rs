//! Unit of work that runs a shell command per request.
//!
//! The command runs with `sh -c` in the run's work directory. The request
//! description is passed in `ORCHESTRATOR_DESCRIPTION` and on stdin. Each
//! stdout line is logged as an `output` entry. Cancellation kills the child.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::unit::{RunContext, UnitOfWork};
use crate::error::UnitError;
use crate::store::LogKind;

/// Maximum captured output size (64 KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// How often the child is checked for exit and the run for cancellation.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DESCRIPTION_ENV: &str = "ORCHESTRATOR_DESCRIPTION";

pub struct CommandUnit {
    command: String,
    poll_interval: Duration,
}

impl CommandUnit {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Append to `buf` without exceeding the cap.
fn push_capped(buf: &mut String, text: &str) {
    let room = MAX_OUTPUT_SIZE.saturating_sub(buf.len());
    if room == 0 {
        return;
    }
    if text.len() <= room {
        buf.push_str(text);
    } else {
        let mut end = room;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        buf.push_str(&text[..end]);
    }
}

/// Kill the child and wait for it so no zombie is left behind.
fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl UnitOfWork for CommandUnit {
    fn execute(&self, description: &str, ctx: &RunContext) -> Result<String, UnitError> {
        ctx.check_cancelled()?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(ctx.work_dir())
            .env(DESCRIPTION_ENV, description)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        info!(token = %ctx.token(), pid = child.id(), "Command started");
        ctx.log(LogKind::Input, Some("command"), description);

        if let Some(mut stdin) = child.stdin.take() {
            let input = description.to_string();
            thread::spawn(move || {
                // The child may exit without reading stdin.
                let _ = stdin.write_all(input.as_bytes());
            });
        }

        let stdout_reader = child.stdout.take().map(|stdout| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let mut captured = String::new();
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                // Drain to EOF; invalid UTF-8 is replaced, never fatal.
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\n', '\r']);
                    ctx.log(LogKind::Output, Some("command"), line);
                    push_capped(&mut captured, line);
                    push_capped(&mut captured, "\n");
                }
                captured
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut raw = Vec::new();
                let _ = stderr.read_to_end(&mut raw);
                let mut captured = String::new();
                push_capped(&mut captured, &String::from_utf8_lossy(&raw));
                captured
            })
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    warn!(token = %ctx.token(), error = %e, "Failed to poll command, killing it");
                    kill_and_reap(&mut child);
                    return Err(UnitError::Io(e));
                }
            }
            if ctx.is_cancelled() {
                debug!(token = %ctx.token(), "Cancellation observed, killing command");
                kill_and_reap(&mut child);
                return Err(UnitError::Interrupted);
            }
            thread::sleep(self.poll_interval);
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(UnitError::Failed(format!(
                "command exited with {code}: {}",
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::runtime::Handle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::engine::correlator::{ExecutionToken, IdentityCorrelator};
    use crate::engine::state::WorkRequest;
    use crate::engine::unit::RunLogger;
    use crate::jobs::{JobManager, JsonArtifactReader, SlurmScheduler};
    use crate::store::{LibSqlBackend, RunStore};

    struct Fixture {
        store: Arc<LibSqlBackend>,
        ctx: RunContext,
        request: WorkRequest,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let request = WorkRequest::new("Si bulk");
        store.create_request(&request).await.unwrap();

        let correlator = Arc::new(IdentityCorrelator::new());
        let token = ExecutionToken::mint();
        correlator.register(request.id, token);

        let logger = RunLogger::new(store.clone(), correlator, Handle::current());
        let jobs = Arc::new(JobManager::new(
            Arc::new(SlurmScheduler::new(SchedulerConfig::default())),
            store.clone(),
            Arc::new(JsonArtifactReader::new("result.json")),
        ));
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(
            request.id,
            token,
            dir.path().to_path_buf(),
            CancellationToken::new(),
            logger,
            jobs,
            Handle::current(),
        );
        Fixture {
            store,
            ctx,
            request,
            _dir: dir,
        }
    }

    #[test]
    fn output_is_capped_on_char_boundary() {
        let mut buf = "a".repeat(MAX_OUTPUT_SIZE - 1);
        push_capped(&mut buf, "é");
        assert_eq!(buf.len(), MAX_OUTPUT_SIZE - 1);
        push_capped(&mut buf, "b");
        assert_eq!(buf.len(), MAX_OUTPUT_SIZE);
        push_capped(&mut buf, "c");
        assert_eq!(buf.len(), MAX_OUTPUT_SIZE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_command_and_logs_lines() {
        let f = fixture().await;
        let unit = CommandUnit::new("echo \"env:$ORCHESTRATOR_DESCRIPTION\"; cat; echo")
            .with_poll_interval(Duration::from_millis(10));
        let ctx = f.ctx.clone();

        let output = tokio::task::spawn_blocking(move || unit.execute("Si bulk", &ctx))
            .await
            .unwrap()
            .unwrap();
        assert!(output.starts_with("env:Si bulk\n"));
        assert!(output.contains("Si bulk\n"));

        let logs = f.store.get_logs(f.request.id).await.unwrap();
        assert_eq!(logs[0].kind, LogKind::Input);
        assert!(logs.iter().any(|e| e.kind == LogKind::Output && e.content == "env:Si bulk"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_utf8_output_is_replaced_not_fatal() {
        let f = fixture().await;
        let unit = CommandUnit::new(
            "printf 'bad \\377\\n'; sleep 0.2; i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done",
        )
        .with_poll_interval(Duration::from_millis(10));
        let ctx = f.ctx.clone();

        let output = tokio::task::spawn_blocking(move || unit.execute("x", &ctx))
            .await
            .unwrap()
            .unwrap();
        assert!(output.starts_with("bad \u{FFFD}\n"), "{output:?}");
        assert!(output.contains("line499\n"));

        let logs = f.store.get_logs(f.request.id).await.unwrap();
        let lines = logs.iter().filter(|e| e.kind == LogKind::Output).count();
        assert_eq!(lines, 501);
    }

    #[test]
    fn kill_and_reap_leaves_no_running_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        kill_and_reap(&mut child);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nonzero_exit_fails() {
        let f = fixture().await;
        let unit = CommandUnit::new("echo broken >&2; exit 3")
            .with_poll_interval(Duration::from_millis(10));
        let ctx = f.ctx.clone();

        let err = tokio::task::spawn_blocking(move || unit.execute("x", &ctx))
            .await
            .unwrap()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with 3"), "{message}");
        assert!(message.contains("broken"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_kills_child() {
        let f = fixture().await;
        let unit = CommandUnit::new("sleep 30").with_poll_interval(Duration::from_millis(10));
        let ctx = f.ctx.clone();
        let cancel = f.ctx.cancellation().clone();

        let started = std::time::Instant::now();
        let task = tokio::task::spawn_blocking(move || unit.execute("x", &ctx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, UnitError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
