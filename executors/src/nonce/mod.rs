pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use relayer_core::chain::ChainClient;
use relayer_core::config::NonceConfig;
use relayer_core::error::OrchestratorError;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub use memory::MemoryNonceStore;
pub use redis::RedisNonceStore;

/// Nonce records are held per sender account per chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonceKey {
    pub account: Address,
    pub chain_uuid: Uuid,
}

impl NonceKey {
    pub fn new(account: Address, chain_uuid: Uuid) -> Self {
        Self {
            account,
            chain_uuid,
        }
    }

    /// Stable field form shared by the store backends.
    pub fn to_field(&self) -> String {
        format!("{}:{}", self.chain_uuid, self.account)
    }
}

impl fmt::Display for NonceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.account, self.chain_uuid)
    }
}

/// Storage contract behind the allocator: get, set-with-TTL, atomic
/// increment and delete, over both the last-sent counter and the
/// recovering counter. Backends may be process-local or shared.
pub trait NonceStore: Send + Sync {
    fn get_last_sent(
        &self,
        key: &NonceKey,
    ) -> impl Future<Output = Result<Option<u64>, OrchestratorError>> + Send;

    fn set_last_sent(
        &self,
        key: &NonceKey,
        value: u64,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn delete_last_sent(
        &self,
        key: &NonceKey,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    /// Atomically increment and return the consecutive-recovery counter.
    fn incr_recovering(
        &self,
        key: &NonceKey,
    ) -> impl Future<Output = Result<u64, OrchestratorError>> + Send;

    fn clear_recovering(
        &self,
        key: &NonceKey,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;
}

/// Hands out the next nonce per `(account, chain)` and re-syncs from the
/// chain when a broadcast comes back with a nonce conflict.
///
/// Calls for the same key are serialized through a keyed lock; distinct keys
/// proceed fully in parallel.
pub struct NonceAllocator<N: NonceStore> {
    store: N,
    max_recovery: u32,
    ttl: Duration,
    locks: std::sync::Mutex<HashMap<NonceKey, Arc<Mutex<()>>>>,
}

impl<N: NonceStore> NonceAllocator<N> {
    pub fn new(store: N, config: &NonceConfig) -> Self {
        Self {
            store,
            max_recovery: config.max_recovery,
            ttl: config.ttl(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &N {
        &self.store
    }

    async fn lock_for(&self, key: &NonceKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poison| poison.into_inner());
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Next nonce to use for this key. Seeds from the chain's pending count
    /// on first use; afterwards advances the stored counter so consecutive
    /// calls hand out a strictly increasing sequence. A chain RPC failure
    /// surfaces without touching stored state.
    pub async fn allocate<C: ChainClient>(
        &self,
        key: &NonceKey,
        chain: &C,
    ) -> Result<u64, OrchestratorError> {
        let _guard = self.lock_for(key).await;

        match self.store.get_last_sent(key).await? {
            Some(last_sent) => {
                let next = last_sent + 1;
                self.store.set_last_sent(key, next, self.ttl).await?;
                Ok(next)
            }
            None => {
                let pending = chain.pending_nonce(key.account).await?;
                self.store.set_last_sent(key, pending, self.ttl).await?;
                tracing::debug!(key = %key, nonce = pending, "seeded nonce from chain pending count");
                Ok(pending)
            }
        }
    }

    /// Record a successful broadcast: reset the consecutive-recovery counter.
    pub async fn confirm(&self, key: &NonceKey) -> Result<(), OrchestratorError> {
        let _guard = self.lock_for(key).await;
        self.store.clear_recovering(key).await
    }

    /// Give back an allocated nonce after a permanent broadcast failure, so
    /// the next allocation reseeds from the chain instead of leaving a gap.
    pub async fn release(&self, key: &NonceKey) -> Result<(), OrchestratorError> {
        let _guard = self.lock_for(key).await;
        self.store.delete_last_sent(key).await
    }

    /// Handle a nonce-too-low broadcast response: bounded by `max_recovery`,
    /// reseed from the chain's authoritative pending nonce and return the
    /// value the resend must use.
    pub async fn recover<C: ChainClient>(
        &self,
        key: &NonceKey,
        chain: &C,
        chain_id: u64,
    ) -> Result<u64, OrchestratorError> {
        let _guard = self.lock_for(key).await;

        let attempts = self.store.incr_recovering(key).await? as u32;
        if attempts > self.max_recovery {
            return Err(OrchestratorError::NonceRecoveryExhausted {
                account: key.account.to_string(),
                chain_id,
                attempts,
            });
        }

        let pending = chain.pending_nonce(key.account).await?;
        // Reseed so the next allocation continues above the recovered value.
        self.store.set_last_sent(key, pending, self.ttl).await?;
        tracing::warn!(
            key = %key,
            attempts,
            nonce = pending,
            "nonce recovery, reseeded from chain pending nonce"
        );
        Ok(pending)
    }
}
