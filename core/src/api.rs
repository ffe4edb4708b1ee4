use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::{Chain, Receipt};
use crate::error::OrchestratorError;
use crate::job::{Job, JobStatus, TransactionParams};

/// Partial job mutation sent to the orchestration API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub message: Option<String>,
    pub transaction: Option<TransactionParams>,
    pub receipt: Option<Receipt>,
}

impl JobUpdate {
    pub fn status(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_transaction(mut self, transaction: TransactionParams) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_receipt(mut self, receipt: Receipt) -> Self {
        self.receipt = Some(receipt);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub chain_uuid: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub parent_job_uuid: Option<Uuid>,
}

/// One entry of the contract/event catalog used for best-effort log decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractEvent {
    /// keccak hash of the event signature, i.e. topic zero.
    pub sig_hash: B256,
    pub name: String,
    pub abi: String,
}

/// Capability interface over the orchestration API that owns job and chain
/// persistence. The engine never touches the relational store directly.
pub trait OrchestrationClient: Send + Sync {
    fn create_job(
        &self,
        job: Job,
    ) -> impl Future<Output = Result<Job, OrchestratorError>> + Send;

    /// Enqueue the job onto the broker intake topic.
    fn start_job(
        &self,
        job_uuid: Uuid,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn update_job(
        &self,
        job_uuid: Uuid,
        update: JobUpdate,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    /// Re-enqueue the job's current payload for a same-gas resend.
    fn resend_job_tx(
        &self,
        job_uuid: Uuid,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn search_jobs(
        &self,
        filter: JobFilter,
    ) -> impl Future<Output = Result<Vec<Job>, OrchestratorError>> + Send;

    fn get_contract_events(
        &self,
        chain_id: u64,
        address: Address,
        sig_hash: B256,
    ) -> impl Future<Output = Result<Vec<ContractEvent>, OrchestratorError>> + Send;

    fn set_contract_address_code_hash(
        &self,
        chain_id: u64,
        address: Address,
        code_hash: B256,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn search_chains(&self) -> impl Future<Output = Result<Vec<Chain>, OrchestratorError>> + Send;

    /// Persist the listener cursor so it survives restarts.
    fn update_chain_head(
        &self,
        chain_uuid: Uuid,
        current_block: u64,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;
}

/// Terminal-status fan-out. Formatting and delivery are the notification
/// service's concern; the engine only hands over the job and its receipt.
pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        job: &Job,
        receipt: Option<&Receipt>,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;
}

/// Liveness probe shared by store and broker backends for readiness checks.
pub trait HealthProbe: Send + Sync {
    fn ping(&self) -> impl Future<Output = Result<(), OrchestratorError>> + Send;
}
