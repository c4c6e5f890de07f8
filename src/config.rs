//! Service Configuration
//!
//! Every knob is read from the environment (a `.env` file is honoured by the
//! binaries through `dotenv`). Unset variables fall back to the defaults below.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FriendError, Result};
use crate::memory::ConversationSettings;

// ──────────────────────────────────────────────────────────────────────────────
// DEFAULTS
// ──────────────────────────────────────────────────────────────────────────────

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8001;
const DEFAULT_MODEL_REPO: &str = "TheBloke/Llama-2-7B-Chat-GGUF";
const DEFAULT_MODEL_FILE: &str = "llama-2-7b-chat.Q4_K_M.gguf";
const DEFAULT_TOKENIZER_REPO: &str = "hf-internal-testing/llama-tokenizer";
const DEFAULT_CHECKPOINTS_DIR: &str = "checkpoints";
/// Finished jobs keep their reply for a day, like a Celery result backend
const DEFAULT_RESULT_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Token strings that mark the start of a new turn in generated text
pub const DEFAULT_STOP_TOKENS: [[&str; 2]; 3] = [["Human", ":"], ["AI", ":"], ["User", ":"]];

/// Where model weights and tokenizer come from, and how to sample
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub repo: String,
    pub file: String,
    pub tokenizer_repo: String,
    /// Local GGUF file; skips the hub when set
    pub model_path: Option<PathBuf>,
    /// Local tokenizer.json; skips the hub when set
    pub tokenizer_path: Option<PathBuf>,
    pub checkpoints_dir: PathBuf,
    pub hf_token: Option<String>,
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub temperature: f64,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repo: DEFAULT_MODEL_REPO.to_string(),
            file: DEFAULT_MODEL_FILE.to_string(),
            tokenizer_repo: DEFAULT_TOKENIZER_REPO.to_string(),
            model_path: None,
            tokenizer_path: None,
            checkpoints_dir: PathBuf::from(DEFAULT_CHECKPOINTS_DIR),
            hf_token: None,
            max_new_tokens: 300,
            top_k: 10,
            temperature: 1.0,
            seed: 299_792_458,
        }
    }
}

/// Top-level configuration for the service binaries
#[derive(Debug, Clone, PartialEq)]
pub struct FriendConfig {
    pub host: String,
    pub port: u16,
    /// Number of dispatch workers; each owns its own model copy
    pub workers: usize,
    /// SQLite file for job persistence; in-memory store when `None`
    pub job_store: Option<PathBuf>,
    /// How long a finished job keeps its inputs and reply
    pub result_ttl: Duration,
    /// How long a forgotten job's tombstone is kept after that
    pub tombstone_ttl: Duration,
    pub model: ModelConfig,
    pub conversation: ConversationSettings,
    pub stop_tokens: Vec<Vec<String>>,
}

impl Default for FriendConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workers: 1,
            job_store: None,
            result_ttl: Duration::from_secs(DEFAULT_RESULT_TTL_SECS),
            tombstone_ttl: Duration::from_secs(DEFAULT_TOMBSTONE_TTL_SECS),
            model: ModelConfig::default(),
            conversation: ConversationSettings::default(),
            stop_tokens: default_stop_tokens(),
        }
    }
}

impl FriendConfig {
    /// Build the configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let model_defaults = ModelConfig::default();
        let conversation_defaults = ConversationSettings::default();

        let config = Self {
            host: string_var("AIFRIEND_HOST", &defaults.host),
            port: parse_var("AIFRIEND_PORT", defaults.port)?,
            workers: parse_var("AIFRIEND_WORKERS", defaults.workers)?,
            job_store: optional_var("AIFRIEND_JOB_STORE").map(PathBuf::from),
            result_ttl: Duration::from_secs(parse_var("AIFRIEND_RESULT_TTL", DEFAULT_RESULT_TTL_SECS)?),
            tombstone_ttl: Duration::from_secs(parse_var("AIFRIEND_TOMBSTONE_TTL", DEFAULT_TOMBSTONE_TTL_SECS)?),
            model: ModelConfig {
                repo: string_var("MODEL_REPO", &model_defaults.repo),
                file: string_var("MODEL_FILE", &model_defaults.file),
                tokenizer_repo: string_var("TOKENIZER_REPO", &model_defaults.tokenizer_repo),
                model_path: optional_var("MODEL_PATH").map(PathBuf::from),
                tokenizer_path: optional_var("TOKENIZER_PATH").map(PathBuf::from),
                checkpoints_dir: optional_var("CHECKPOINTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(model_defaults.checkpoints_dir),
                hf_token: optional_var("HF_TOKEN"),
                max_new_tokens: parse_var("MAX_NEW_TOKENS", model_defaults.max_new_tokens)?,
                top_k: parse_var("TOP_K", model_defaults.top_k)?,
                temperature: parse_var("TEMPERATURE", model_defaults.temperature)?,
                seed: parse_var("SEED", model_defaults.seed)?,
            },
            conversation: ConversationSettings {
                window: parse_var("HISTORY_SIZE", conversation_defaults.window)?,
                friend_threshold: parse_var("FRIEND_THRESHOLD", conversation_defaults.friend_threshold)?,
                flirty_threshold: parse_var("FLIRTY_THRESHOLD", conversation_defaults.flirty_threshold)?,
            },
            stop_tokens: defaults.stop_tokens,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, inside every job
    pub fn validate(&self) -> Result<()> {
        let problem = if self.workers == 0 {
            Some("AIFRIEND_WORKERS must be at least 1")
        } else if self.result_ttl.is_zero() || self.tombstone_ttl.is_zero() {
            Some("AIFRIEND_RESULT_TTL and AIFRIEND_TOMBSTONE_TTL must be positive")
        } else if self.model.top_k == 0 {
            Some("TOP_K must be at least 1")
        } else if self.model.temperature.is_nan() || self.model.temperature <= 0.0 {
            Some("TEMPERATURE must be greater than 0")
        } else if self.model.max_new_tokens == 0 {
            Some("MAX_NEW_TOKENS must be at least 1")
        } else {
            None
        };
        match problem {
            Some(detail) => Err(FriendError::Config(detail.to_string())),
            None => Ok(()),
        }
    }

    /// Socket address the HTTP server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL clients use to reach the server
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

pub fn default_stop_tokens() -> Vec<Vec<String>> {
    DEFAULT_STOP_TOKENS
        .iter()
        .map(|seq| seq.iter().map(|t| t.to_string()).collect())
        .collect()
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn string_var(key: &str, default: &str) -> String {
    optional_var(key).unwrap_or_else(|| default.to_string())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match optional_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| FriendError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FriendConfig::default();
        assert_eq!(config.port, 8001);
        assert_eq!(config.workers, 1);
        assert_eq!(config.result_ttl, Duration::from_secs(86_400));
        assert_eq!(config.conversation.window, 40);
        assert_eq!(config.conversation.friend_threshold, 15);
        assert_eq!(config.conversation.flirty_threshold, 30);
        assert_eq!(config.model.max_new_tokens, 300);
        assert_eq!(config.model.top_k, 10);
        assert_eq!(config.stop_tokens.len(), 3);
        assert_eq!(config.stop_tokens[1], vec!["AI".to_string(), ":".to_string()]);
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(FriendConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sampling_values_rejected_at_startup() {
        let mut config = FriendConfig::default();
        config.model.top_k = 0;
        assert!(matches!(config.validate(), Err(FriendError::Config(_))));

        for temperature in [0.0, -0.5, f64::NAN] {
            let mut config = FriendConfig::default();
            config.model.temperature = temperature;
            assert!(matches!(config.validate(), Err(FriendError::Config(_))), "{}", temperature);
        }
    }

    #[test]
    fn test_zero_workers_and_ttls_rejected() {
        let config = FriendConfig { workers: 0, ..FriendConfig::default() };
        assert!(matches!(config.validate(), Err(FriendError::Config(_))));

        let config = FriendConfig { result_ttl: Duration::ZERO, ..FriendConfig::default() };
        assert!(matches!(config.validate(), Err(FriendError::Config(_))));
    }

    #[test]
    fn test_urls() {
        let config = FriendConfig::default();
        assert_eq!(config.bind_addr(), "localhost:8001");
        assert_eq!(config.api_url(), "http://localhost:8001");
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        // Unique key so parallel tests never observe it
        std::env::set_var("AIFRIEND_TEST_PARSE_GARBAGE", "forty");
        let parsed: Result<usize> = parse_var("AIFRIEND_TEST_PARSE_GARBAGE", 40);
        assert!(matches!(parsed, Err(FriendError::Config(_))));
        std::env::remove_var("AIFRIEND_TEST_PARSE_GARBAGE");
    }

    #[test]
    fn test_parse_var_falls_back_when_unset() {
        let parsed: usize = parse_var("AIFRIEND_TEST_PARSE_UNSET", 7).unwrap();
        assert_eq!(parsed, 7);
    }
}
