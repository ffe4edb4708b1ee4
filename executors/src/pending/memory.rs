use std::collections::HashMap;
use std::sync::Mutex;

use relayer_core::error::OrchestratorError;
use uuid::Uuid;

use super::{AddOutcome, PendingJobRecord, PendingJobStore};

/// Process-local pending store. Retry cadence is lost on crash; acceptable
/// for single-worker deployments and tests.
#[derive(Default)]
pub struct MemoryPendingStore {
    inner: Mutex<HashMap<Uuid, PendingJobRecord>>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingJobRecord>> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl PendingJobStore for MemoryPendingStore {
    async fn add(&self, record: PendingJobRecord) -> Result<AddOutcome, OrchestratorError> {
        let mut inner = self.lock();
        match inner.get(&record.job_uuid()) {
            Some(existing) if existing.tx_hash == record.tx_hash => Ok(AddOutcome::DuplicateHash),
            Some(existing) => {
                let mut replacement = record;
                replacement.children = existing.children.clone();
                inner.insert(replacement.job_uuid(), replacement);
                Ok(AddOutcome::Replaced)
            }
            None => {
                inner.insert(record.job_uuid(), record);
                Ok(AddOutcome::Added)
            }
        }
    }

    async fn update(&self, record: PendingJobRecord) -> Result<(), OrchestratorError> {
        let mut inner = self.lock();
        let mut replacement = record;
        if let Some(existing) = inner.get(&replacement.job_uuid()) {
            replacement.children = existing.children.clone();
        }
        inner.insert(replacement.job_uuid(), replacement);
        Ok(())
    }

    async fn get(&self, job_uuid: Uuid) -> Result<Option<PendingJobRecord>, OrchestratorError> {
        Ok(self.lock().get(&job_uuid).cloned())
    }

    async fn remove(
        &self,
        job_uuid: Uuid,
    ) -> Result<Option<PendingJobRecord>, OrchestratorError> {
        Ok(self.lock().remove(&job_uuid))
    }

    async fn add_child(
        &self,
        parent_uuid: Uuid,
        child_uuid: Uuid,
    ) -> Result<(), OrchestratorError> {
        let mut inner = self.lock();
        let Some(record) = inner.get_mut(&parent_uuid) else {
            return Err(OrchestratorError::store(format!(
                "no pending record for parent job {parent_uuid}"
            )));
        };
        if !record.children.contains(&child_uuid) {
            record.children.push(child_uuid);
        }
        Ok(())
    }

    async fn children(&self, parent_uuid: Uuid) -> Result<Vec<Uuid>, OrchestratorError> {
        Ok(self
            .lock()
            .get(&parent_uuid)
            .map(|record| record.children.clone())
            .unwrap_or_default())
    }

    async fn by_chain(
        &self,
        chain_uuid: Uuid,
    ) -> Result<Vec<PendingJobRecord>, OrchestratorError> {
        Ok(self
            .lock()
            .values()
            .filter(|record| record.chain_uuid() == chain_uuid)
            .cloned()
            .collect())
    }
}
