//! Job store interface and implementations
//!
//! Every state change goes through [`JobStore::compare_and_set`], so the
//! worker and a concurrent cancel cannot both win: whichever writes first
//! moves the job, the other sees a conflict.
//!
//! Stores shrink through [`JobStore::expire`]: finished jobs past their
//! result TTL become tombstones, and old tombstones are removed.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tokio::task;
use tracing::{info, warn};

use crate::error::{FriendError, Result};
use crate::memory::Turn;
use crate::orchestrator::job::{Job, JobId, JobState, Outcome, Reply};

/// Result of a conditional state write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    Applied,
    /// The job was not in the expected state; carries the state it was in
    Conflict(JobState),
    Missing,
}

/// What one expiry sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expired {
    /// Finished jobs whose data was dropped
    pub forgotten: usize,
    /// Tombstones deleted outright
    pub removed: usize,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<()>;
    async fn get(&self, id: JobId) -> Result<Option<Job>>;
    /// Move `id` from `from` to `to` only if it is currently in `from`
    async fn compare_and_set(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        outcome: Outcome,
    ) -> Result<CasResult>;
    async fn count(&self, state: JobState) -> Result<i64>;
    /// Forget finished jobs last touched before `results_before`, then delete
    /// tombstones last touched before `tombstones_before`. In-flight jobs are
    /// never touched.
    async fn expire(&self, results_before: DateTime<Utc>, tombstones_before: DateTime<Utc>) -> Result<Expired>;
}

/// Process-local store; contents are lost on restart
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn compare_and_set(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        outcome: Outcome,
    ) -> Result<CasResult> {
        from.check_transition(to)?;
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(CasResult::Missing);
        };
        if job.state != from {
            return Ok(CasResult::Conflict(job.state));
        }
        job.apply(to, outcome);
        Ok(CasResult::Applied)
    }

    async fn count(&self, state: JobState) -> Result<i64> {
        Ok(self.jobs.read().await.values().filter(|job| job.state == state).count() as i64)
    }

    async fn expire(&self, results_before: DateTime<Utc>, tombstones_before: DateTime<Utc>) -> Result<Expired> {
        let mut jobs = self.jobs.write().await;
        let mut expired = Expired::default();

        // Old tombstones go first so fresh ones from this sweep survive it
        let before = jobs.len();
        jobs.retain(|_, job| !(job.state == JobState::Forgotten && job.updated_at < tombstones_before));
        expired.removed = before - jobs.len();

        for job in jobs.values_mut() {
            if job.state.can_transition_to(JobState::Forgotten) && job.updated_at < results_before {
                job.apply(JobState::Forgotten, Outcome::None);
                expired.forgotten += 1;
            }
        }
        Ok(expired)
    }
}

/// SQLite-backed store; survives restarts
#[derive(Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Fixed-width UTC timestamps so stored values compare correctly as text
fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteJobStore {
    /// Open (or create) the store. Jobs left in flight by a previous process
    /// are marked Failed, since no worker will pick them up again.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        let recovered = task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    message TEXT NOT NULL,
                    history TEXT NOT NULL,
                    reply TEXT,
                    reply_history TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                "#,
                [],
            )?;
            conn.execute("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);", [])?;

            let now = timestamp(&Utc::now());
            let recovered = conn.execute(
                "UPDATE jobs SET state = ?1, error = ?2, updated_at = ?3
                 WHERE state IN ('Pending', 'Loading', 'Running')",
                params![JobState::Failed.as_str(), INTERRUPTED_BY_RESTART, &now],
            )?;
            Ok::<_, FriendError>(recovered)
        })
        .await??;

        if recovered > 0 {
            warn!("Marked {} orphaned job(s) as failed", recovered);
        }
        info!("Job store opened at {:?}", path);

        Ok(Self { db_path: path })
    }
}

type JobRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn job_from_row(row: JobRow) -> Result<Job> {
    let (id, state, message, history, reply, reply_history, error, created_at, updated_at) = row;
    let result = match (reply, reply_history) {
        (Some(message), Some(history)) => Some(Reply {
            message,
            history: serde_json::from_str::<Vec<Turn>>(&history)?,
        }),
        _ => None,
    };
    Ok(Job {
        id: JobId::parse(&id)?,
        state: state.parse()?,
        message,
        history: serde_json::from_str(&history)?,
        result,
        error,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| FriendError::Store(format!("bad timestamp {}: {}", raw, e)))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: Job) -> Result<()> {
        let path = self.db_path.clone();
        let history_json = serde_json::to_string(&job.history)?;

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO jobs (id, state, message, history, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job.id.to_string(),
                    job.state.as_str(),
                    &job.message,
                    &history_json,
                    timestamp(&job.created_at),
                    timestamp(&job.updated_at)
                ],
            )?;
            Ok::<_, FriendError>(())
        })
        .await?
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let row: Option<JobRow> = conn
                .query_row(
                    "SELECT id, state, message, history, reply, reply_history, error, created_at, updated_at
                     FROM jobs WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                        ))
                    },
                )
                .optional()?;
            Ok::<_, FriendError>(row.map(job_from_row).transpose()?)
        })
        .await?
    }

    async fn compare_and_set(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        outcome: Outcome,
    ) -> Result<CasResult> {
        from.check_transition(to)?;
        let path = self.db_path.clone();
        let (reply, reply_history, error) = match outcome {
            Outcome::Reply(reply) => (
                Some(reply.message),
                Some(serde_json::to_string(&reply.history)?),
                None,
            ),
            Outcome::Error(detail) => (None, None, Some(detail)),
            Outcome::None => (None, None, None),
        };

        task::spawn_blocking(move || -> Result<CasResult> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id_str = id.to_string();

            let current: Option<String> = tx
                .query_row("SELECT state FROM jobs WHERE id = ?1", params![&id_str], |row| row.get(0))
                .optional()?;
            let Some(current) = current else {
                return Ok(CasResult::Missing);
            };
            let current: JobState = current.parse()?;
            if current != from {
                return Ok(CasResult::Conflict(current));
            }

            let now = timestamp(&Utc::now());
            if to == JobState::Forgotten {
                tx.execute(
                    "UPDATE jobs SET state = ?1, message = '', history = '[]', reply = NULL,
                     reply_history = NULL, error = NULL, updated_at = ?2 WHERE id = ?3",
                    params![to.as_str(), &now, &id_str],
                )?;
            } else {
                tx.execute(
                    "UPDATE jobs SET state = ?1, updated_at = ?2,
                     reply = COALESCE(?3, reply), reply_history = COALESCE(?4, reply_history),
                     error = COALESCE(?5, error)
                     WHERE id = ?6",
                    params![to.as_str(), &now, reply, reply_history, error, &id_str],
                )?;
            }
            tx.commit()?;
            Ok(CasResult::Applied)
        })
        .await?
    }

    async fn count(&self, state: JobState) -> Result<i64> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE state = ?1",
                params![state.as_str()],
                |row| row.get(0),
            )?;
            Ok::<_, FriendError>(count)
        })
        .await?
    }

    async fn expire(&self, results_before: DateTime<Utc>, tombstones_before: DateTime<Utc>) -> Result<Expired> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || -> Result<Expired> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let removed = tx.execute(
                "DELETE FROM jobs WHERE state = ?1 AND updated_at < ?2",
                params![JobState::Forgotten.as_str(), timestamp(&tombstones_before)],
            )?;
            let forgotten = tx.execute(
                "UPDATE jobs SET state = ?1, message = '', history = '[]', reply = NULL,
                 reply_history = NULL, error = NULL, updated_at = ?2
                 WHERE state IN ('Succeeded', 'Failed', 'Cancelled') AND updated_at < ?3",
                params![
                    JobState::Forgotten.as_str(),
                    timestamp(&Utc::now()),
                    timestamp(&results_before)
                ],
            )?;
            tx.commit()?;
            Ok(Expired { forgotten, removed })
        })
        .await?
    }
}
