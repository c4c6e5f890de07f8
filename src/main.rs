//! AI friend service
//!
//! Starts the dispatch workers and serves the job API over HTTP.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use aifriend::models::GgufLoader;
use aifriend::orchestrator::{JobStore, MemoryJobStore, RunnerSettings, SqliteJobStore, TaskRunner};
use aifriend::server::{run_server, AppState};
use aifriend::utils::{init_telemetry, install_metrics};
use aifriend::FriendConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();
    init_telemetry();

    let config = FriendConfig::from_env()?;
    info!(
        "Model {}/{} with {} worker(s)",
        config.model.repo, config.model.file, config.workers
    );

    let store: Arc<dyn JobStore> = match &config.job_store {
        Some(path) => Arc::new(SqliteJobStore::new(path).await?),
        None => Arc::new(MemoryJobStore::new()),
    };
    let loader = Arc::new(GgufLoader::new(config.model.clone()));
    let runner = TaskRunner::start(store, loader, RunnerSettings::from(&config));

    let state = AppState {
        runner: Arc::new(runner),
        metrics: install_metrics()?,
    };
    run_server(state, &config.bind_addr()).await
}
