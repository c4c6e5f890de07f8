use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use aifriend::agent::{GenerationRequest, ModelLoader, TextGenerator};
use aifriend::memory::{build_prompt, ConversationSettings, Turn};
use aifriend::orchestrator::{
    CancelOutcome, JobId, JobState, JobStatus, JobStore, MemoryJobStore, RunnerSettings, SqliteJobStore, TaskRunner,
};
use aifriend::{FriendError, Result};

/// Scripted generator shared by every scenario
#[derive(Default)]
struct MockModel {
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Generation waits while this is false
    hold: AtomicBool,
    fail_with: Option<String>,
    delay: Duration,
}

impl MockModel {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn held() -> Arc<Self> {
        let model = Self::default();
        model.hold.store(true, Ordering::SeqCst);
        Arc::new(model)
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, ..Self::default() })
    }

    fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TextGenerator for MockModel {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.prompts.lock().await.push(request.prompt.clone());

        let outcome = async {
            while self.hold.load(Ordering::SeqCst) {
                if request.interrupt.is_triggered() {
                    return Err(FriendError::Cancelled("interrupted".to_string()));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(self.delay).await;
            if let Some(detail) = &self.fail_with {
                return Err(FriendError::Generation(detail.clone()));
            }
            Ok(" Blimey, that's brilliant!\nHuman: and".to_string())
        }
        .await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Hands out the shared mock after `delay`; fails the first `failures` loads
struct MockLoader {
    model: Arc<MockModel>,
    loads: AtomicUsize,
    failures: usize,
    delay: Duration,
}

impl MockLoader {
    fn new(model: Arc<MockModel>) -> Arc<Self> {
        Arc::new(Self { model, loads: AtomicUsize::new(0), failures: 0, delay: Duration::ZERO })
    }

    fn failing_once(model: Arc<MockModel>) -> Arc<Self> {
        Arc::new(Self { model, loads: AtomicUsize::new(0), failures: 1, delay: Duration::ZERO })
    }

    fn slow(model: Arc<MockModel>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { model, loads: AtomicUsize::new(0), failures: 0, delay })
    }
}

#[async_trait]
impl ModelLoader for MockLoader {
    async fn load(&self) -> Result<Arc<dyn TextGenerator>> {
        let n = self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if n < self.failures {
            return Err(FriendError::ModelLoad("checkpoint missing".to_string()));
        }
        Ok(self.model.clone())
    }
}

fn start(loader: Arc<MockLoader>, workers: usize) -> TaskRunner {
    let settings = RunnerSettings { workers, ..RunnerSettings::default() };
    TaskRunner::start(Arc::new(MemoryJobStore::new()), loader, settings)
}

async fn wait_for<F>(runner: &TaskRunner, id: JobId, done: F) -> JobStatus
where
    F: Fn(&JobStatus) -> bool,
{
    for _ in 0..500 {
        let status = runner.poll(id).await.unwrap();
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not reach the expected state", id);
}

async fn wait_terminal(runner: &TaskRunner, id: JobId) -> JobStatus {
    wait_for(runner, id, JobStatus::is_terminal).await
}

#[tokio::test]
async fn test_hi_round_trip_then_forget() {
    let model = MockModel::new();
    let runner = start(MockLoader::new(model.clone()), 1);

    let id = runner.submit("Hi".to_string(), vec![]).await.unwrap();
    match wait_terminal(&runner, id).await {
        JobStatus::Succeeded { message, history } => {
            assert_eq!(message, "Blimey, that's brilliant!");
            assert_eq!(history.len(), 2);
            assert_eq!(history[0], Turn::human("Hi"));
            assert_eq!(history[1], Turn::ai("Blimey, that's brilliant!"));
        }
        other => panic!("expected success, got {:?}", other),
    }

    assert_eq!(runner.forget_or_cancel(id).await.unwrap(), CancelOutcome::Forgotten);
    assert!(matches!(runner.poll(id).await, Err(FriendError::NotFound(_))));
}

#[tokio::test]
async fn test_prompt_matches_memory_builder() {
    let model = MockModel::new();
    let runner = start(MockLoader::new(model.clone()), 1);
    let history: Vec<Turn> = (0..45)
        .map(|i| if i % 2 == 0 { Turn::human(format!("q{}", i)) } else { Turn::ai(format!("a{}", i)) })
        .collect();

    let id = runner.submit("Lumos?".to_string(), history.clone()).await.unwrap();
    let status = wait_terminal(&runner, id).await;

    let expected = build_prompt(&history, "Lumos?", &ConversationSettings::default()).unwrap();
    assert_eq!(model.prompts.lock().await.as_slice(), &[expected.prompt]);

    // Returned history is the kept window plus the new exchange
    let JobStatus::Succeeded { history: updated, .. } = status else {
        panic!("expected success");
    };
    assert_eq!(updated.len(), 42);
    assert_eq!(updated[..40], history[5..]);
}

#[tokio::test]
async fn test_empty_message_rejected_without_job() {
    let model = MockModel::new();
    let runner = start(MockLoader::new(model.clone()), 1);

    let err = runner.submit(String::new(), vec![]).await.unwrap_err();
    assert!(matches!(err, FriendError::InvalidInput(_)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_model_loaded_once_for_many_jobs() {
    let model = MockModel::new();
    let loader = MockLoader::new(model.clone());
    let runner = start(loader.clone(), 1);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(runner.submit(format!("message {}", i), vec![]).await.unwrap());
    }
    for id in &ids {
        assert!(matches!(wait_terminal(&runner, *id).await, JobStatus::Succeeded { .. }));
    }

    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(model.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_job_ids_unique() {
    let runner = start(MockLoader::new(MockModel::new()), 1);
    let mut ids = std::collections::HashSet::new();
    for _ in 0..50 {
        assert!(ids.insert(runner.submit("Hi".to_string(), vec![]).await.unwrap()));
    }
}

#[tokio::test]
async fn test_failed_load_then_retry() {
    let model = MockModel::new();
    let loader = MockLoader::failing_once(model.clone());
    let runner = start(loader.clone(), 1);

    let first = runner.submit("Hi".to_string(), vec![]).await.unwrap();
    match wait_terminal(&runner, first).await {
        JobStatus::Failed { error } => assert!(error.contains("checkpoint missing")),
        other => panic!("expected failure, got {:?}", other),
    }

    let second = runner.submit("Hi again".to_string(), vec![]).await.unwrap();
    assert!(matches!(wait_terminal(&runner, second).await, JobStatus::Succeeded { .. }));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_generation_error_does_not_stop_worker() {
    let failing = Arc::new(MockModel { fail_with: Some("CUDA out of memory".to_string()), ..MockModel::default() });
    let runner = start(MockLoader::new(failing.clone()), 1);

    for _ in 0..2 {
        let id = runner.submit("Hi".to_string(), vec![]).await.unwrap();
        match wait_terminal(&runner, id).await {
            JobStatus::Failed { error } => assert!(error.contains("CUDA out of memory")),
            other => panic!("expected failure, got {:?}", other),
        }
    }
    assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let model = MockModel::held();
    let runner = start(MockLoader::new(model.clone()), 1);

    let id = runner.submit("Hi".to_string(), vec![]).await.unwrap();
    wait_for(&runner, id, |s| matches!(s, JobStatus::Running)).await;

    assert_eq!(runner.forget_or_cancel(id).await.unwrap(), CancelOutcome::Cancelled);
    model.release();

    for _ in 0..20 {
        assert_eq!(runner.poll(id).await.unwrap(), JobStatus::Cancelled);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Second delete cleans up the cancelled job
    assert_eq!(runner.forget_or_cancel(id).await.unwrap(), CancelOutcome::Forgotten);
    assert_eq!(runner.forget_or_cancel(id).await.unwrap(), CancelOutcome::AlreadyForgotten);
}

#[tokio::test]
async fn test_cancel_while_loading_keeps_the_model() {
    let model = MockModel::new();
    let loader = MockLoader::slow(model.clone(), Duration::from_millis(200));
    let runner = start(loader.clone(), 1);

    let first = runner.submit("Hi".to_string(), vec![]).await.unwrap();
    wait_for(&runner, first, |s| matches!(s, JobStatus::Loading)).await;
    assert_eq!(runner.forget_or_cancel(first).await.unwrap(), CancelOutcome::Cancelled);

    // The load runs to completion and serves the next job
    let second = runner.submit("Hi again".to_string(), vec![]).await.unwrap();
    assert!(matches!(wait_terminal(&runner, second).await, JobStatus::Succeeded { .. }));

    assert_eq!(runner.poll(first).await.unwrap(), JobStatus::Cancelled);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_pending_job_never_runs() {
    let model = MockModel::held();
    let runner = start(MockLoader::new(model.clone()), 1);

    let busy = runner.submit("first".to_string(), vec![]).await.unwrap();
    let queued = runner.submit("second".to_string(), vec![]).await.unwrap();
    wait_for(&runner, busy, |s| matches!(s, JobStatus::Running)).await;
    assert_eq!(runner.poll(queued).await.unwrap(), JobStatus::Pending);

    assert_eq!(runner.forget_or_cancel(queued).await.unwrap(), CancelOutcome::Cancelled);
    model.release();

    assert!(matches!(wait_terminal(&runner, busy).await, JobStatus::Succeeded { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.poll(queued).await.unwrap(), JobStatus::Cancelled);
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_racing_completion() {
    let model = MockModel::slow(Duration::from_millis(2));
    let runner = start(MockLoader::new(model.clone()), 2);

    for round in 0..30u64 {
        let id = runner.submit("Hi".to_string(), vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(round % 6)).await;

        match runner.forget_or_cancel(id).await.unwrap() {
            CancelOutcome::Cancelled => {
                // Whatever the worker was doing, it must not overwrite the cancel
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    assert_eq!(runner.poll(id).await.unwrap(), JobStatus::Cancelled);
                }
            }
            CancelOutcome::Forgotten => {
                assert!(matches!(runner.poll(id).await, Err(FriendError::NotFound(_))));
            }
            CancelOutcome::AlreadyForgotten => panic!("job {} forgotten twice", id),
        }
    }
}

#[tokio::test]
async fn test_one_job_at_a_time_per_worker() {
    let model = MockModel::slow(Duration::from_millis(20));
    let runner = start(MockLoader::new(model.clone()), 1);

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(runner.submit(format!("m{}", i), vec![]).await.unwrap());
    }
    for id in &ids {
        wait_terminal(&runner, *id).await;
    }
    assert_eq!(model.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_each_worker_loads_its_own_model() {
    let model = MockModel::slow(Duration::from_millis(30));
    let loader = MockLoader::new(model.clone());
    let runner = start(loader.clone(), 2);

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(runner.submit(format!("m{}", i), vec![]).await.unwrap());
    }
    for id in &ids {
        wait_terminal(&runner, *id).await;
    }
    assert!(loader.loads.load(Ordering::SeqCst) <= 2);
    assert!(model.max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_sqlite_backed_runner() {
    let db = NamedTempFile::new().unwrap();
    let store = Arc::new(SqliteJobStore::new(db.path()).await.unwrap());
    let runner = TaskRunner::start(store.clone(), MockLoader::new(MockModel::new()), RunnerSettings::default());

    let history = vec![Turn::human("Who are you?"), Turn::ai("I'm Harry!")];
    let id = runner.submit("Hi".to_string(), history).await.unwrap();
    match wait_terminal(&runner, id).await {
        JobStatus::Succeeded { history, .. } => assert_eq!(history.len(), 4),
        other => panic!("expected success, got {:?}", other),
    }

    runner.forget_or_cancel(id).await.unwrap();
    assert_eq!(store.count(JobState::Forgotten).await.unwrap(), 1);
    assert!(matches!(runner.poll(id).await, Err(FriendError::NotFound(_))));
}
