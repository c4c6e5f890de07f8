//! AI friend chat service
//!
//! A job queue around a local language model:
//! - Submit a message plus history, get a job id back immediately
//! - Poll the job through Pending, Loading, Running and a terminal state
//! - Cancel in-flight jobs or forget finished ones
//! - One model load per worker, reused by every later job

pub mod agent;
pub mod config;
pub mod error;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod server;
pub mod utils;

// Re-exports for convenience
pub use config::FriendConfig;
pub use error::{FriendError, Result};
pub use memory::Turn;
pub use orchestrator::{JobId, JobStatus, TaskRunner};
