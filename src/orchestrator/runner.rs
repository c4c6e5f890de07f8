//! Task runner: submit, poll, forget-or-cancel and the worker pool
//!
//! Submission writes a Pending job and pushes its id onto an in-process
//! channel. Each worker owns a [`ModelSlot`] and runs one job at a time.
//! A sweeper task expires finished jobs so the store does not grow forever.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::agent::{sanitize, GenerationRequest, Interrupt, ModelLoader, ModelSlot, TextGenerator};
use crate::config::{default_stop_tokens, FriendConfig};
use crate::error::{FriendError, Result};
use crate::memory::{build_prompt, extend_history, ConversationSettings, Turn};
use crate::orchestrator::job::{CancelOutcome, Job, JobId, JobState, JobStatus, Outcome, Reply};
use crate::orchestrator::queue::{CasResult, JobStore};

/// Attempts per store call before a dispatch gives up on it
const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long finished jobs and their tombstones are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub result_ttl: Duration,
    pub tombstone_ttl: Duration,
}

impl Retention {
    fn sweep_interval(&self) -> Duration {
        self.result_ttl
            .min(self.tombstone_ttl)
            .clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }
}

impl Default for Retention {
    fn default() -> Self {
        let config = FriendConfig::default();
        Self {
            result_ttl: config.result_ttl,
            tombstone_ttl: config.tombstone_ttl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub workers: usize,
    pub conversation: ConversationSettings,
    pub stop_tokens: Vec<Vec<String>>,
    pub retention: Retention,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            conversation: ConversationSettings::default(),
            stop_tokens: default_stop_tokens(),
            retention: Retention::default(),
        }
    }
}

impl From<&FriendConfig> for RunnerSettings {
    fn from(config: &FriendConfig) -> Self {
        Self {
            workers: config.workers,
            conversation: config.conversation,
            stop_tokens: config.stop_tokens.clone(),
            retention: Retention {
                result_ttl: config.result_ttl,
                tombstone_ttl: config.tombstone_ttl,
            },
        }
    }
}

/// Handles for a job a worker has picked up
struct InFlight {
    interrupt: Interrupt,
    abort: Option<AbortHandle>,
}

type InFlightMap = Arc<Mutex<HashMap<JobId, InFlight>>>;

pub struct TaskRunner {
    store: Arc<dyn JobStore>,
    sender: mpsc::UnboundedSender<JobId>,
    inflight: InFlightMap,
    workers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
}

impl TaskRunner {
    /// Spawn `settings.workers` workers. Must be called inside a tokio runtime.
    pub fn start(store: Arc<dyn JobStore>, loader: Arc<dyn ModelLoader>, settings: RunnerSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let inflight: InFlightMap = Arc::new(Mutex::new(HashMap::new()));
        let settings = Arc::new(settings);

        let workers = (0..settings.workers.max(1))
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    slot: Arc::new(ModelSlot::new(worker_id, loader.clone())),
                    store: store.clone(),
                    inflight: inflight.clone(),
                    settings: settings.clone(),
                };
                tokio::spawn(worker.run(receiver.clone()))
            })
            .collect::<Vec<_>>();

        let sweeper = tokio::spawn(sweep(store.clone(), settings.retention));

        info!("Task runner started with {} worker(s)", workers.len());
        Self {
            store,
            sender,
            inflight,
            workers,
            sweeper,
        }
    }

    /// Queue a message for generation and return its id immediately
    pub async fn submit(&self, message: String, history: Vec<Turn>) -> Result<JobId> {
        if message.is_empty() {
            return Err(FriendError::InvalidInput("Human message is empty".to_string()));
        }

        let job = Job::new(message, history);
        let id = job.id;
        self.store.insert(job).await?;
        self.sender
            .send(id)
            .map_err(|_| FriendError::Store("dispatch queue closed".to_string()))?;

        info!(job = %id, "Job submitted");
        Ok(id)
    }

    /// Current status of a job. Never waits for the job to progress.
    pub async fn poll(&self, id: JobId) -> Result<JobStatus> {
        self.store
            .get(id)
            .await?
            .and_then(|job| job.status())
            .ok_or_else(|| FriendError::NotFound(id.to_string()))
    }

    /// Cancel an in-flight job, or delete the stored result of a finished one
    pub async fn forget_or_cancel(&self, id: JobId) -> Result<CancelOutcome> {
        loop {
            let job = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| FriendError::NotFound(id.to_string()))?;

            let (target, outcome) = match job.state {
                JobState::Forgotten => return Ok(CancelOutcome::AlreadyForgotten),
                state if state.is_terminal() => (JobState::Forgotten, CancelOutcome::Forgotten),
                _ => (JobState::Cancelled, CancelOutcome::Cancelled),
            };

            match self.store.compare_and_set(id, job.state, target, Outcome::None).await? {
                CasResult::Applied => {
                    if target == JobState::Cancelled {
                        self.interrupt(id, job.state).await;
                        info!(job = %id, "Job cancelled while {}", job.state);
                    } else {
                        info!(job = %id, "Job forgotten");
                    }
                    return Ok(outcome);
                }
                // State moved underneath us; decide again from the new state
                CasResult::Conflict(actual) => debug!(job = %id, "Cancel retry, job now {}", actual),
                CasResult::Missing => return Err(FriendError::NotFound(id.to_string())),
            }
        }
    }

    /// Stop in-flight work for a job that was just marked Cancelled
    async fn interrupt(&self, id: JobId, was: JobState) {
        let inflight = self.inflight.lock().await;
        let Some(entry) = inflight.get(&id) else {
            return;
        };
        entry.interrupt.trigger();
        // A load in progress is left to finish so the model stays cached
        if was == JobState::Running {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
        self.sweeper.abort();
    }
}

/// Oldest `updated_at` that is still within `ttl` of `now`
fn cutoff(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn sweep(store: Arc<dyn JobStore>, retention: Retention) {
    let mut ticker = tokio::time::interval(retention.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        match store
            .expire(cutoff(now, retention.result_ttl), cutoff(now, retention.tombstone_ttl))
            .await
        {
            Ok(expired) if expired.forgotten + expired.removed > 0 => info!(
                "Expired {} finished job(s), removed {} tombstone(s)",
                expired.forgotten, expired.removed
            ),
            Ok(_) => {}
            Err(e) => warn!("Job expiry failed: {}", e),
        }
    }
}

/// Run a store call, retrying transient store errors
async fn retry_store<T, F, Fut>(id: JobId, op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(FriendError::Store(detail)) if attempt < STORE_ATTEMPTS => {
                warn!(job = %id, "Store {} failed (attempt {}): {}", op, attempt, detail);
                tokio::time::sleep(STORE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

struct Worker {
    id: usize,
    slot: Arc<ModelSlot>,
    store: Arc<dyn JobStore>,
    inflight: InFlightMap,
    settings: Arc<RunnerSettings>,
}

impl Worker {
    async fn run(self, queue: Arc<Mutex<mpsc::UnboundedReceiver<JobId>>>) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(id) = next else {
                break;
            };
            self.process(id).await;
        }
        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, id: JobId) {
        let interrupt = Interrupt::new();
        // Registered before the dispatch starts so a cancel always reaches it
        self.inflight.lock().await.insert(
            id,
            InFlight {
                interrupt: interrupt.clone(),
                abort: None,
            },
        );

        let context = Dispatch {
            worker: self.id,
            slot: self.slot.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
        };
        let handle = tokio::spawn(async move { context.execute(id, interrupt).await });

        if let Some(entry) = self.inflight.lock().await.get_mut(&id) {
            entry.abort = Some(handle.abort_handle());
        }

        match handle.await {
            Ok(finish) => debug!(worker = self.id, job = %id, "Dispatch finished: {:?}", finish),
            Err(e) if e.is_cancelled() => info!(worker = self.id, job = %id, "Dispatch aborted"),
            Err(e) => {
                error!(worker = self.id, job = %id, "Dispatch panicked: {}", e);
                self.fail_after_panic(id).await;
            }
        }

        self.inflight.lock().await.remove(&id);
    }

    async fn fail_after_panic(&self, id: JobId) {
        let Ok(Some(job)) = self.store.get(id).await else {
            return;
        };
        if matches!(job.state, JobState::Loading | JobState::Running) {
            let outcome = Outcome::Error("worker panicked".to_string());
            if let Err(e) = self.store.compare_and_set(id, job.state, JobState::Failed, outcome).await {
                error!(job = %id, "Could not record failure: {}", e);
            }
        }
    }
}

/// Everything one dispatch needs, moved into its task
struct Dispatch {
    worker: usize,
    slot: Arc<ModelSlot>,
    store: Arc<dyn JobStore>,
    settings: Arc<RunnerSettings>,
}

/// How a stage transition went
enum Step {
    Continue,
    /// The job was cancelled or forgotten; drop everything
    Abandon,
}

/// How a dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Succeeded,
    /// The error is stored on the job
    Failed,
    /// Cancelled or forgotten underneath the worker
    Abandoned,
    /// Not Pending when dequeued, or unknown
    Skipped,
    /// The store stayed unavailable; the job could not be updated
    Unrecorded,
}

impl Dispatch {
    async fn execute(self, id: JobId, interrupt: Interrupt) -> Finish {
        let store = &self.store;
        let job = match retry_store(id, "read", move || store.get(id)).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job = %id, "Dequeued unknown job");
                return Finish::Skipped;
            }
            Err(e) => return self.fail(id, &e).await,
        };
        if job.state != JobState::Pending {
            debug!(job = %id, "Skipping job in state {}", job.state);
            return Finish::Skipped;
        }

        match self.drive(&job, &interrupt).await {
            Ok(finish) => finish,
            Err(e) => self.fail(id, &e).await,
        }
    }

    async fn drive(&self, job: &Job, interrupt: &Interrupt) -> Result<Finish> {
        let id = job.id;
        if let Step::Abandon = self.advance(id, JobState::Pending, JobState::Loading, Outcome::None).await? {
            return Ok(Finish::Abandoned);
        }

        let model = self.slot.ensure_loaded().await?;

        if let Step::Abandon = self.advance(id, JobState::Loading, JobState::Running, Outcome::None).await? {
            return Ok(Finish::Abandoned);
        }

        match self.generate_reply(job, model.as_ref(), interrupt).await {
            Ok(reply) => match self.advance(id, JobState::Running, JobState::Succeeded, Outcome::Reply(reply)).await? {
                Step::Continue => {
                    info!(worker = self.worker, job = %id, "Job succeeded");
                    Ok(Finish::Succeeded)
                }
                Step::Abandon => Ok(Finish::Abandoned),
            },
            Err(FriendError::Cancelled(_)) if interrupt.is_triggered() => {
                debug!(job = %id, "Generation stopped by cancel");
                Ok(Finish::Abandoned)
            }
            Err(e) => Err(e),
        }
    }

    /// Store a dispatch error on the job from whatever stage it reached
    async fn fail(&self, id: JobId, cause: &FriendError) -> Finish {
        let detail = cause.to_string();
        let store = &self.store;

        for _ in 0..STORE_ATTEMPTS {
            let job = match retry_store(id, "read", move || store.get(id)).await {
                Ok(Some(job)) => job,
                Ok(None) => return Finish::Abandoned,
                Err(e) => {
                    error!(job = %id, "Could not record failure ({}): {}", detail, e);
                    return Finish::Unrecorded;
                }
            };
            if job.state.is_terminal() {
                debug!(job = %id, "Dropping error for {} job: {}", job.state, detail);
                return Finish::Abandoned;
            }

            let outcome = Outcome::Error(detail.clone());
            let from = job.state;
            let written = retry_store(id, "update", move || {
                store.compare_and_set(id, from, JobState::Failed, outcome.clone())
            })
            .await;
            match written {
                Ok(CasResult::Applied) => {
                    error!(worker = self.worker, job = %id, "Job failed: {}", detail);
                    return Finish::Failed;
                }
                Ok(CasResult::Conflict(actual)) => debug!(job = %id, "Failure retry, job now {}", actual),
                Ok(CasResult::Missing) => return Finish::Abandoned,
                Err(e) => {
                    error!(job = %id, "Could not record failure ({}): {}", detail, e);
                    return Finish::Unrecorded;
                }
            }
        }
        error!(job = %id, "Job kept changing state, failure not recorded: {}", detail);
        Finish::Unrecorded
    }

    async fn generate_reply(
        &self,
        job: &Job,
        model: &dyn TextGenerator,
        interrupt: &Interrupt,
    ) -> Result<Reply> {
        let context = build_prompt(&job.history, &job.message, &self.settings.conversation)?;
        debug!(job = %job.id, persona = ?context.persona, "Prompt:\n{}", context.prompt);

        if interrupt.is_triggered() {
            return Err(FriendError::Cancelled("cancelled before generation".to_string()));
        }

        let raw = model
            .generate(GenerationRequest {
                prompt: context.prompt,
                stop_sequences: self.settings.stop_tokens.clone(),
                interrupt: interrupt.clone(),
            })
            .await?;
        let message = sanitize(&raw);
        let history = extend_history(context.kept_history, &job.message, &message);

        Ok(Reply { message, history })
    }

    /// Apply one transition; losing to a cancel or forget abandons the job
    async fn advance(&self, id: JobId, from: JobState, to: JobState, outcome: Outcome) -> Result<Step> {
        let store = &self.store;
        let written = retry_store(id, "update", move || store.compare_and_set(id, from, to, outcome.clone())).await?;
        match written {
            CasResult::Applied => {
                debug!(job = %id, "{} -> {}", from, to);
                Ok(Step::Continue)
            }
            CasResult::Conflict(actual @ (JobState::Cancelled | JobState::Forgotten)) => {
                warn!(job = %id, "Discarding {} result, job is {}", to, actual);
                Ok(Step::Abandon)
            }
            CasResult::Conflict(actual) => Err(FriendError::Store(format!(
                "job {} expected {} but found {}",
                id, from, actual
            ))),
            CasResult::Missing => Err(FriendError::NotFound(id.to_string())),
        }
    }
}
