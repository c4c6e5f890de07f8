//! Model lifecycle: load once, then reuse
//!
//! Each worker owns one [`ModelSlot`]. The first job dispatched to the worker
//! pays for the load; every later job gets the cached handle. A failed load
//! leaves the slot empty so the next job tries again.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::agent::{ModelLoader, TextGenerator};
use crate::error::Result;

pub struct ModelSlot {
    worker_id: usize,
    loader: Arc<dyn ModelLoader>,
    handle: RwLock<Option<Arc<dyn TextGenerator>>>,
}

impl ModelSlot {
    pub fn new(worker_id: usize, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            worker_id,
            loader,
            handle: RwLock::new(None),
        }
    }

    /// Return the model handle, loading it on first use
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn TextGenerator>> {
        if let Some(handle) = self.handle.read().await.as_ref() {
            return Ok(handle.clone());
        }

        let mut slot = self.handle.write().await;
        // Another caller may have loaded while we waited for the write lock
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        info!(worker = self.worker_id, "Model state: loading");
        match self.loader.load().await {
            Ok(handle) => {
                *slot = Some(handle.clone());
                info!(worker = self.worker_id, "Model state: ready");
                Ok(handle)
            }
            Err(e) => {
                error!(worker = self.worker_id, "Model load failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.handle.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::GenerationRequest;
    use crate::error::FriendError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed;

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _request: GenerationRequest) -> Result<String> {
            Ok("ok".to_string())
        }
    }

    /// Fails the first `failures` loads, then succeeds
    struct CountingLoader {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self) -> Result<Arc<dyn TextGenerator>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(FriendError::ModelLoad("device unavailable".to_string()));
            }
            tokio::task::yield_now().await;
            Ok(Arc::new(Fixed))
        }
    }

    #[tokio::test]
    async fn test_load_happens_once() {
        let loader = Arc::new(CountingLoader { calls: AtomicUsize::new(0), failures: 0 });
        let slot = ModelSlot::new(0, loader.clone());

        assert!(!slot.is_loaded().await);
        let first = slot.ensure_loaded().await.unwrap();
        let second = slot.ensure_loaded().await.unwrap();

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(slot.is_loaded().await);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let loader = Arc::new(CountingLoader { calls: AtomicUsize::new(0), failures: 0 });
        let slot = Arc::new(ModelSlot::new(0, loader.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let slot = slot.clone();
            tasks.push(tokio::spawn(async move { slot.ensure_loaded().await.map(|_| ()) }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_slot_empty_for_retry() {
        let loader = Arc::new(CountingLoader { calls: AtomicUsize::new(0), failures: 1 });
        let slot = ModelSlot::new(0, loader.clone());

        let err = slot.ensure_loaded().await.err().unwrap();
        assert!(matches!(err, FriendError::ModelLoad(_)));
        assert!(!slot.is_loaded().await);

        slot.ensure_loaded().await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }
}
