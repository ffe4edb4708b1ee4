use alloy::primitives::{Address, B256, Bytes};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::job::TransactionParams;

/// Outcome of a signing call. `hash` is the broadcast hash the payload will
/// produce; one-time-key signatures cannot predict it and leave it unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: Option<B256>,
}

impl SignedTransaction {
    pub fn new(raw: Bytes, hash: B256) -> Self {
        Self {
            raw,
            hash: Some(hash),
        }
    }

    pub fn one_time_key(raw: Bytes) -> Self {
        Self { raw, hash: None }
    }
}

/// Capability interface over the key-management/signing service.
pub trait TransactionSigner: Send + Sync {
    fn sign_transaction(
        &self,
        account: Address,
        store_id: Option<&str>,
        chain_id: u64,
        tx: &TransactionParams,
    ) -> impl Future<Output = Result<SignedTransaction, OrchestratorError>> + Send;

    fn sign_eea_transaction(
        &self,
        account: Address,
        store_id: Option<&str>,
        chain_id: u64,
        tx: &TransactionParams,
    ) -> impl Future<Output = Result<SignedTransaction, OrchestratorError>> + Send;

    fn sign_quorum_private_transaction(
        &self,
        account: Address,
        store_id: Option<&str>,
        chain_id: u64,
        tx: &TransactionParams,
    ) -> impl Future<Output = Result<SignedTransaction, OrchestratorError>> + Send;

    /// Sign with a key generated inline and discarded by the signing service.
    fn sign_with_one_time_key(
        &self,
        chain_id: u64,
        tx: &TransactionParams,
    ) -> impl Future<Output = Result<SignedTransaction, OrchestratorError>> + Send;
}
