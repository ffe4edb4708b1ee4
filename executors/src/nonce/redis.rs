use std::time::Duration;

use redis::{AsyncCommands, aio::ConnectionManager};
use relayer_core::api::HealthProbe;
use relayer_core::error::OrchestratorError;
use thiserror::Error;

use super::{NonceKey, NonceStore};

#[derive(Debug, Error)]
pub enum RedisNonceStoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
}

impl From<RedisNonceStoreError> for OrchestratorError {
    fn from(err: RedisNonceStoreError) -> Self {
        OrchestratorError::StoreError {
            message: err.to_string(),
        }
    }
}

/// Shared nonce store for multi-worker deployments.
pub struct RedisNonceStore {
    redis: ConnectionManager,
    namespace: Option<String>,
}

impl RedisNonceStore {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self { redis, namespace }
    }

    pub async fn connect(
        url: &str,
        namespace: Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let client = redis::Client::open(url).map_err(RedisNonceStoreError::from)?;
        let redis = client
            .get_connection_manager()
            .await
            .map_err(RedisNonceStoreError::from)?;
        Ok(Self::new(redis, namespace))
    }

    fn last_sent_key(&self, key: &NonceKey) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:nonce:last-sent:{}", ns, key.to_field()),
            None => format!("nonce:last-sent:{}", key.to_field()),
        }
    }

    fn recovering_key(&self, key: &NonceKey) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:nonce:recovering:{}", ns, key.to_field()),
            None => format!("nonce:recovering:{}", key.to_field()),
        }
    }
}

impl NonceStore for RedisNonceStore {
    async fn get_last_sent(&self, key: &NonceKey) -> Result<Option<u64>, OrchestratorError> {
        let mut conn = self.redis.clone();
        let value: Option<u64> = conn
            .get(self.last_sent_key(key))
            .await
            .map_err(RedisNonceStoreError::from)?;
        Ok(value)
    }

    async fn set_last_sent(
        &self,
        key: &NonceKey,
        value: u64,
        ttl: Duration,
    ) -> Result<(), OrchestratorError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(self.last_sent_key(key), value, ttl.as_secs())
            .await
            .map_err(RedisNonceStoreError::from)?;
        Ok(())
    }

    async fn delete_last_sent(&self, key: &NonceKey) -> Result<(), OrchestratorError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .del(self.last_sent_key(key))
            .await
            .map_err(RedisNonceStoreError::from)?;
        Ok(())
    }

    async fn incr_recovering(&self, key: &NonceKey) -> Result<u64, OrchestratorError> {
        let mut conn = self.redis.clone();
        let count: u64 = conn
            .incr(self.recovering_key(key), 1u64)
            .await
            .map_err(RedisNonceStoreError::from)?;
        Ok(count)
    }

    async fn clear_recovering(&self, key: &NonceKey) -> Result<(), OrchestratorError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .del(self.recovering_key(key))
            .await
            .map_err(RedisNonceStoreError::from)?;
        Ok(())
    }
}

impl HealthProbe for RedisNonceStore {
    async fn ping(&self) -> Result<(), OrchestratorError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(RedisNonceStoreError::from)?;
        Ok(())
    }
}
