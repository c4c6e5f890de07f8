//! Quantized GGUF chat model backed by candle
//!
//! Weights and tokenizer come either from local paths or from the Hugging
//! Face hub (cached under the checkpoints directory). All tensor work runs
//! on blocking threads.

use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tokio::task;
use tracing::{debug, info};

use crate::agent::{GenerationRequest, ModelLoader, StopGuard, TextGenerator};
use crate::config::ModelConfig;
use crate::error::{FriendError, Result};

const EOS_TOKEN: &str = "</s>";
/// SentencePiece word-start marker
const WORD_START: char = '\u{2581}';

/// Seed for the `generation`-th sampling run; each reply samples afresh
fn sampling_seed(base: u64, generation: u64) -> u64 {
    base.wrapping_add(generation.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn load_err(e: impl std::fmt::Display) -> FriendError {
    FriendError::ModelLoad(e.to_string())
}

fn generation_err(e: impl std::fmt::Display) -> FriendError {
    FriendError::Generation(e.to_string())
}

/// Resolved on-disk locations of the model artifacts
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

/// Locate (downloading if needed) the GGUF weights and tokenizer. Blocking.
pub fn fetch_artifacts(config: &ModelConfig) -> Result<ModelFiles> {
    if let (Some(weights), Some(tokenizer)) = (&config.model_path, &config.tokenizer_path) {
        return Ok(ModelFiles {
            weights: weights.clone(),
            tokenizer: tokenizer.clone(),
        });
    }

    use hf_hub::api::sync::ApiBuilder;
    let mut api_builder = ApiBuilder::new()
        .with_progress(true)
        .with_cache_dir(config.checkpoints_dir.clone());
    if let Some(token) = &config.hf_token {
        api_builder = api_builder.with_token(Some(token.clone()));
    }
    let api = api_builder.build().map_err(load_err)?;

    let weights = match &config.model_path {
        Some(path) => path.clone(),
        None => {
            info!("Fetching {} from {}", config.file, config.repo);
            api.model(config.repo.clone()).get(&config.file).map_err(load_err)?
        }
    };
    let tokenizer = match &config.tokenizer_path {
        Some(path) => path.clone(),
        None => {
            info!("Fetching tokenizer.json from {}", config.tokenizer_repo);
            api.model(config.tokenizer_repo.clone())
                .get("tokenizer.json")
                .map_err(load_err)?
        }
    };

    Ok(ModelFiles { weights, tokenizer })
}

/// Loads a [`GgufGenerator`] from a [`ModelConfig`]
pub struct GgufLoader {
    config: ModelConfig,
}

impl GgufLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ModelLoader for GgufLoader {
    async fn load(&self) -> Result<Arc<dyn TextGenerator>> {
        let config = self.config.clone();
        let generator = task::spawn_blocking(move || GgufGenerator::load_blocking(config))
            .await
            .map_err(load_err)??;
        Ok(Arc::new(generator))
    }
}

struct GgufModel {
    weights: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token: Option<u32>,
    generations: u64,
}

impl GgufModel {
    fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer
            .token_to_id(token)
            .or_else(|| self.tokenizer.token_to_id(&format!("{}{}", WORD_START, token)))
    }

    fn generate(&mut self, request: &GenerationRequest, config: &ModelConfig) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(generation_err)?;
        let prompt_tokens = encoding.get_ids().to_vec();
        let guard = StopGuard::resolve(&request.stop_sequences, |token| self.token_id(token));
        let seed = sampling_seed(config.seed, self.generations);
        self.generations += 1;
        let mut logits_processor = LogitsProcessor::from_sampling(
            seed,
            Sampling::TopK {
                k: config.top_k,
                temperature: config.temperature,
            },
        );

        debug!("Prompt is {} tokens", prompt_tokens.len());
        let mut generated: Vec<u32> = Vec::new();
        let mut next_input = prompt_tokens;
        // Position 0 resets the KV cache left over from the previous job
        let mut index_pos = 0;

        for _ in 0..config.max_new_tokens {
            if request.interrupt.is_triggered() {
                return Err(FriendError::Cancelled("generation interrupted".to_string()));
            }

            let input = Tensor::new(next_input.as_slice(), &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(generation_err)?;
            let logits = self
                .weights
                .forward(&input, index_pos)
                .and_then(|l| l.squeeze(0))
                .and_then(|l| l.to_dtype(DType::F32))
                .map_err(generation_err)?;
            index_pos += next_input.len();

            let next_token = logits_processor.sample(&logits).map_err(generation_err)?;
            if Some(next_token) == self.eos_token {
                break;
            }
            generated.push(next_token);
            if guard.should_stop(&generated) {
                break;
            }
            next_input = vec![next_token];
        }

        debug!("Generated {} tokens", generated.len());
        self.tokenizer.decode(&generated, true).map_err(generation_err)
    }
}

/// A loaded quantized llama model. One job at a time uses it.
pub struct GgufGenerator {
    inner: Arc<Mutex<GgufModel>>,
    config: ModelConfig,
}

impl GgufGenerator {
    fn load_blocking(config: ModelConfig) -> Result<Self> {
        let files = fetch_artifacts(&config)?;
        let device = Device::cuda_if_available(0).map_err(load_err)?;
        info!("Loading {:?} on {:?}", files.weights, device);

        let mut file = std::fs::File::open(&files.weights)
            .map_err(|e| load_err(format!("Failed to open model file {:?}: {}", files.weights, e)))?;
        let content = gguf_file::Content::read(&mut file).map_err(load_err)?;
        let weights = ModelWeights::from_gguf(content, &mut file, &device).map_err(load_err)?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(load_err)?;
        let eos_token = tokenizer.token_to_id(EOS_TOKEN);

        Ok(Self {
            inner: Arc::new(Mutex::new(GgufModel {
                weights,
                tokenizer,
                device,
                eos_token,
                generations: 0,
            })),
            config,
        })
    }
}

#[async_trait]
impl TextGenerator for GgufGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let inner = self.inner.clone();
        let config = self.config.clone();
        task::spawn_blocking(move || {
            let mut model = inner
                .lock()
                .map_err(|_| FriendError::Generation("model lock poisoned".to_string()))?;
            model.generate(&request, &config)
        })
        .await
        .map_err(generation_err)?
    }
}
