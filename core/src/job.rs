use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DEFAULT_MAX_RESENDS, DEFAULT_RETRY_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Started,
    Pending,
    Resending,
    Recovering,
    Warning,
    Mined,
    NeverMined,
    Failed,
}

impl JobStatus {
    /// Terminal statuses are immutable except for receipt attachment.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Mined | JobStatus::NeverMined | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    /// Public transaction signed through the key-management service.
    Transaction,
    /// Pre-signed opaque payload, broadcast verbatim.
    RawTransaction,
    /// EEA restricted private transaction.
    EeaPrivateTransaction,
    /// Quorum/Tessera private transaction.
    QuorumPrivateTransaction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub nonce: Option<u64>,
    pub value: Option<U256>,
    pub gas_limit: Option<u64>,
    /// Legacy gas price in wei.
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub data: Option<Bytes>,
    /// Pre-signed payload for raw transactions.
    pub raw: Option<Bytes>,
    pub hash: Option<B256>,
    pub private_from: Option<String>,
    pub private_for: Option<Vec<String>>,
    pub privacy_group_id: Option<String>,
}

impl TransactionParams {
    pub fn is_dynamic_fee(&self) -> bool {
        self.max_fee_per_gas.is_some() || self.max_priority_fee_per_gas.is_some()
    }

    pub fn has_gas_pricing(&self) -> bool {
        self.gas_price.is_some() || self.is_dynamic_fee()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobPriority {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

/// Engine-owned job settings carried alongside the transaction fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalData {
    /// Delay between retry-session firings.
    pub retry_interval: Duration,
    /// Gas escalation step as a decimal fraction, e.g. 0.06 for +6%.
    pub gas_price_increment: f64,
    /// Cumulative escalation cap as a decimal fraction.
    pub gas_price_limit: f64,
    /// Maximum resend attempts before the job is declared dead.
    pub max_resends: u32,
    /// Key-management store holding the sender account.
    pub store_id: Option<String>,
    /// Sign with an ephemeral key generated and discarded by the signer.
    /// The broadcast hash cannot be predicted for these jobs.
    pub one_time_key: bool,
    pub priority: Option<JobPriority>,
}

impl Default for InternalData {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            gas_price_increment: 0.0,
            gas_price_limit: 0.0,
            max_resends: DEFAULT_MAX_RESENDS,
            store_id: None,
            one_time_key: false,
            priority: None,
        }
    }
}

/// One entry of the job's append-only status history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub status: JobStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub uuid: Uuid,
    /// Set when this job was spawned as a gas-escalated child.
    pub parent_job_uuid: Option<Uuid>,
    pub schedule_uuid: Uuid,
    pub chain_uuid: Uuid,
    pub tenant_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub transaction: TransactionParams,
    pub internal_data: InternalData,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub logs: Vec<JobLog>,
}

impl Job {
    pub fn new(chain_uuid: Uuid, tenant_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            parent_job_uuid: None,
            schedule_uuid: Uuid::new_v4(),
            chain_uuid,
            tenant_id: tenant_id.into(),
            job_type,
            status: JobStatus::Created,
            transaction: TransactionParams::default(),
            internal_data: InternalData::default(),
            labels: HashMap::new(),
            logs: Vec::new(),
        }
    }

    pub fn is_raw(&self) -> bool {
        self.job_type == JobType::RawTransaction
    }

    pub fn is_private(&self) -> bool {
        matches!(
            self.job_type,
            JobType::EeaPrivateTransaction | JobType::QuorumPrivateTransaction
        )
    }

    /// Transition to `status`, appending to the log history.
    pub fn record_status(&mut self, status: JobStatus, message: impl Into<String>) {
        self.status = status;
        self.logs.push(JobLog {
            status,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Resend attempts accumulated so far, derived from the log history.
    pub fn resend_count(&self) -> u32 {
        self.logs
            .iter()
            .filter(|log| log.status == JobStatus::Resending)
            .count() as u32
    }

    /// Clone this job into a gas-escalated child. Chain, schedule, type,
    /// labels and transaction fields (including the nonce) carry over; the
    /// caller applies the escalated gas pricing afterwards.
    pub fn spawn_escalation_child(&self) -> Job {
        Job {
            uuid: Uuid::new_v4(),
            parent_job_uuid: Some(self.uuid),
            schedule_uuid: self.schedule_uuid,
            chain_uuid: self.chain_uuid,
            tenant_id: self.tenant_id.clone(),
            job_type: self.job_type,
            status: JobStatus::Created,
            transaction: TransactionParams {
                hash: None,
                raw: None,
                ..self.transaction.clone()
            },
            internal_data: self.internal_data.clone(),
            labels: self.labels.clone(),
            logs: Vec::new(),
        }
    }
}
