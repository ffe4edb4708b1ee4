use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use relayer_core::api::HealthProbe;
use relayer_core::error::OrchestratorError;

use super::{NonceKey, NonceStore};

#[derive(Default)]
struct MemoryInner {
    last_sent: HashMap<NonceKey, (u64, Instant)>,
    recovering: HashMap<NonceKey, u64>,
}

/// Process-local TTL store for single-worker deployments and tests.
#[derive(Default)]
pub struct MemoryNonceStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl NonceStore for MemoryNonceStore {
    async fn get_last_sent(&self, key: &NonceKey) -> Result<Option<u64>, OrchestratorError> {
        let mut inner = self.lock();
        match inner.last_sent.get(key) {
            Some(&(value, expires_at)) if Instant::now() < expires_at => Ok(Some(value)),
            Some(_) => {
                inner.last_sent.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_last_sent(
        &self,
        key: &NonceKey,
        value: u64,
        ttl: Duration,
    ) -> Result<(), OrchestratorError> {
        self.lock()
            .last_sent
            .insert(key.clone(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete_last_sent(&self, key: &NonceKey) -> Result<(), OrchestratorError> {
        self.lock().last_sent.remove(key);
        Ok(())
    }

    async fn incr_recovering(&self, key: &NonceKey) -> Result<u64, OrchestratorError> {
        let mut inner = self.lock();
        let count = inner.recovering.entry(key.clone()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn clear_recovering(&self, key: &NonceKey) -> Result<(), OrchestratorError> {
        self.lock().recovering.remove(key);
        Ok(())
    }
}

impl HealthProbe for MemoryNonceStore {
    async fn ping(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }
}
