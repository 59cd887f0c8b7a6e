//! Forced termination of an in-flight unit of work.
//!
//! Best effort: the interrupt is delivered through the run's cancellation
//! token, then the controller waits a bounded time for the worker thread to
//! exit. A unit stuck in a call that never checks the token keeps running
//! after the report says `stopped: false`.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// An isolated execution unit that can be asked to stop.
pub trait Interruptible: Send + Sync {
    /// Deliver the interrupt. Must not block.
    fn interrupt(&self);

    fn is_running(&self) -> bool;

    /// Name used in logs.
    fn describe(&self) -> String;
}

/// A unit of work running on its own OS thread.
pub struct WorkerThread {
    handle: JoinHandle<()>,
    interrupt: CancellationToken,
    name: String,
}

impl WorkerThread {
    pub fn new(handle: JoinHandle<()>, interrupt: CancellationToken) -> Self {
        let name = handle
            .thread()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", handle.thread().id()));
        Self {
            handle,
            interrupt,
            name,
        }
    }
}

impl Interruptible for WorkerThread {
    fn interrupt(&self) {
        self.interrupt.cancel();
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Result of a forced termination attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationReport {
    /// `true` only if the unit was confirmed stopped.
    pub stopped: bool,
    pub waited: Duration,
}

pub struct ForcedTermination {
    timeout: Duration,
    poll_interval: Duration,
}

impl ForcedTermination {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Interrupt `unit` and wait up to the timeout for it to stop.
    pub async fn terminate(&self, unit: &dyn Interruptible) -> TerminationReport {
        let started = Instant::now();
        unit.interrupt();

        loop {
            if !unit.is_running() {
                let waited = started.elapsed();
                info!(unit = %unit.describe(), ?waited, "Unit of work stopped");
                return TerminationReport {
                    stopped: true,
                    waited,
                };
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                warn!(
                    unit = %unit.describe(),
                    ?waited,
                    "Unit of work did not stop within timeout; it may keep running"
                );
                return TerminationReport {
                    stopped: false,
                    waited,
                };
            }
            tokio::time::sleep(self.poll_interval.min(self.timeout - waited)).await;
        }
    }
}
