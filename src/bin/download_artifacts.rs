//! Prefetch the model weights and tokenizer into the checkpoints directory

use anyhow::Result;
use tracing::info;

use aifriend::models::fetch_artifacts;
use aifriend::utils::init_telemetry;
use aifriend::FriendConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_telemetry();

    let config = FriendConfig::from_env()?;
    let model = config.model.clone();
    let files = tokio::task::spawn_blocking(move || fetch_artifacts(&model)).await??;

    info!("Weights: {:?}", files.weights);
    info!("Tokenizer: {:?}", files.tokenizer);
    println!(
        "The model artifacts are downloaded to the {:?} folder",
        config.model.checkpoints_dir
    );
    Ok(())
}
