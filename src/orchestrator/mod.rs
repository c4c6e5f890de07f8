//! Orchestrator Module
//!
//! Job lifecycle: the state machine, the job store and the task runner that
//! dispatches jobs to model workers.

pub mod job;
pub mod queue;
pub mod runner;

pub use job::{CancelOutcome, Job, JobId, JobState, JobStatus, Outcome, Reply};
pub use queue::{CasResult, Expired, JobStore, MemoryJobStore, SqliteJobStore};
pub use runner::{Retention, RunnerSettings, TaskRunner};
