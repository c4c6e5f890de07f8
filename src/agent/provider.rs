use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Cooperative cancellation flag shared between a job and its generator
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Token strings, e.g. `[["Human", ":"], ["AI", ":"]]`; resolved by the generator's tokenizer
    pub stop_sequences: Vec<Vec<String>>,
    pub interrupt: Interrupt,
}

/// A loaded model able to continue a prompt
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Return the raw continuation of `request.prompt`, before any cleanup
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}

/// Produces a model handle. May be slow and may fail.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn TextGenerator>>;
}
