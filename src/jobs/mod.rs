//! External batch jobs: scheduler commands, registry, result reading.

pub mod discovery;
pub mod manager;
pub mod model;
pub mod result;
pub mod scheduler;

pub use manager::{JobCancelResult, JobManager};
pub use model::{ExternalJob, JobStatus};
pub use result::{CalcKind, CalcResult, JsonArtifactReader, ResultReader};
pub use scheduler::{BatchScheduler, SlurmScheduler};
