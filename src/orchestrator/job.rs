//! Job lifecycle types.
//!
//! ```text
//!   submit() ──→ Pending ──→ Loading ──→ Running ──→ Succeeded ──┐
//!                  │            │           │                     ├──→ Forgotten
//!                  ├────────────┴───────────┴──────→ Failed ──────┤
//!                  │            │           │                     │
//!                  └────────────┴───────────┴──→ Cancelled ───────┘
//! ```
//!
//! The worker drives Pending → Loading → Running → Succeeded/Failed. The
//! caller forces Cancelled (in flight) or Forgotten (finished). A worker that
//! finds its job Cancelled or Forgotten drops its result. Expired results are
//! forgotten by the store sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{FriendError, Result};
use crate::memory::Turn;

/// Unguessable job identifier (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied id
    pub fn parse(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| FriendError::InvalidInput(format!("malformed job id: {}", raw)))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Loading,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Forgotten,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Pending,
        JobState::Loading,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Forgotten,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Loading => "Loading",
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
            JobState::Forgotten => "Forgotten",
        }
    }

    /// Work is finished (or abandoned); no worker will write again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled | JobState::Forgotten
        )
    }

    /// Transition table
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Loading)
                | (Loading, Running)
                | (Running, Succeeded)
                | (Pending | Loading | Running, Failed)
                | (Pending | Loading | Running, Cancelled)
                | (Succeeded | Failed | Cancelled, Forgotten)
        )
    }

    /// Reject a transition the table does not allow
    pub fn check_transition(&self, next: JobState) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(FriendError::InvalidTransition { from: *self, to: next })
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = FriendError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| FriendError::Store(format!("unknown job state: {}", s)))
    }
}

/// Reply produced by a successful job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub message: String,
    pub history: Vec<Turn>,
}

/// Data written together with a state change
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    None,
    Reply(Reply),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub message: String,
    pub history: Vec<Turn>,
    pub result: Option<Reply>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(message: String, history: Vec<Turn>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            state: JobState::Pending,
            message,
            history,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, recording its outcome. Forgetting drops inputs and results.
    pub fn apply(&mut self, next: JobState, outcome: Outcome) {
        self.state = next;
        self.updated_at = Utc::now();
        match outcome {
            Outcome::Reply(reply) => self.result = Some(reply),
            Outcome::Error(detail) => self.error = Some(detail),
            Outcome::None => {}
        }
        if next == JobState::Forgotten {
            self.message.clear();
            self.history.clear();
            self.result = None;
            self.error = None;
        }
    }

    /// What a poll reports. `None` for forgotten jobs.
    pub fn status(&self) -> Option<JobStatus> {
        let status = match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Loading => JobStatus::Loading,
            JobState::Running => JobStatus::Running,
            JobState::Succeeded => match &self.result {
                Some(reply) => JobStatus::Succeeded {
                    message: reply.message.clone(),
                    history: reply.history.clone(),
                },
                None => JobStatus::Failed {
                    error: "result missing".to_string(),
                },
            },
            JobState::Failed => JobStatus::Failed {
                error: self.error.clone().unwrap_or_default(),
            },
            JobState::Cancelled => JobStatus::Cancelled,
            JobState::Forgotten => return None,
        };
        Some(status)
    }
}

/// Poll response, tagged by `state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum JobStatus {
    Pending,
    Loading,
    Running,
    Succeeded { message: String, history: Vec<Turn> },
    Failed { error: String },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled)
    }
}

/// Result of a forget-or-cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Job was in flight and is now Cancelled
    Cancelled,
    /// Job was finished; its stored data is deleted
    Forgotten,
    /// Job was already forgotten; nothing to do
    AlreadyForgotten,
}
