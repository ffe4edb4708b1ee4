pub mod memory;
pub mod redis;

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use relayer_core::error::OrchestratorError;
use relayer_core::job::Job;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryPendingStore;
pub use redis::RedisPendingStore;

/// A job broadcast to the chain and awaiting confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJobRecord {
    pub job: Job,
    /// Last known broadcast hash being watched.
    pub tx_hash: B256,
    /// Gas-escalated children spawned off this job, oldest first.
    #[serde(default)]
    pub children: Vec<Uuid>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingJobRecord {
    pub fn new(job: Job, tx_hash: B256) -> Self {
        Self {
            job,
            tx_hash,
            children: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn job_uuid(&self) -> Uuid {
        self.job.uuid
    }

    pub fn chain_uuid(&self) -> Uuid {
        self.job.chain_uuid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Same job, same hash: a duplicate delivery, the stored record wins.
    DuplicateHash,
    /// Same job, different hash: the transaction was resent and the watch
    /// restarts on the new hash.
    Replaced,
}

/// Keyed records of jobs awaiting on-chain confirmation. Backends may be
/// process-local or shared; the shared backend is the durable deployment
/// choice so retry cadence survives restarts.
pub trait PendingJobStore: Send + Sync {
    fn add(
        &self,
        record: PendingJobRecord,
    ) -> impl Future<Output = Result<AddOutcome, OrchestratorError>> + Send;

    /// Overwrite a record unconditionally, preserving its child set.
    fn update(
        &self,
        record: PendingJobRecord,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn get(
        &self,
        job_uuid: Uuid,
    ) -> impl Future<Output = Result<Option<PendingJobRecord>, OrchestratorError>> + Send;

    fn remove(
        &self,
        job_uuid: Uuid,
    ) -> impl Future<Output = Result<Option<PendingJobRecord>, OrchestratorError>> + Send;

    fn add_child(
        &self,
        parent_uuid: Uuid,
        child_uuid: Uuid,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn children(
        &self,
        parent_uuid: Uuid,
    ) -> impl Future<Output = Result<Vec<Uuid>, OrchestratorError>> + Send;

    fn by_chain(
        &self,
        chain_uuid: Uuid,
    ) -> impl Future<Output = Result<Vec<PendingJobRecord>, OrchestratorError>> + Send;
}
