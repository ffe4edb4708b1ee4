use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::{Address, B256, keccak256};
use relayer_core::api::{JobUpdate, NotificationSink, OrchestrationClient};
use relayer_core::broker::OffsetCommitter;
use relayer_core::chain::{BlockSummary, Chain, ChainClient, ChainService, Receipt};
use relayer_core::constants::{RECEIPT_FETCH_ATTEMPTS, RECEIPT_FETCH_BACKOFF};
use relayer_core::error::OrchestratorError;
use relayer_core::job::JobStatus;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::metrics::OrchestratorMetrics;
use crate::offsets::CompletionCommitter;
use crate::pending::{PendingJobRecord, PendingJobStore};
use crate::retry::RetrySessionManager;

use super::TaskHandle;

/// Watches broadcast transactions until the chain confirms them, then drives
/// the completion path: job terminal status, notification fan-out, pending
/// record teardown and the offset commit.
pub struct ReceiptWatcher<CS, A, P, K, T>
where
    CS: ChainService + 'static,
    A: OrchestrationClient + 'static,
    P: PendingJobStore + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    pub chain_service: Arc<CS>,
    pub api: Arc<A>,
    pub pending: Arc<P>,
    pub committer: Arc<CompletionCommitter<K>>,
    pub retry: Arc<RetrySessionManager<P, A, K, T>>,
    pub notifier: Arc<T>,
    pub metrics: Arc<OrchestratorMetrics>,
}

impl<CS, A, P, K, T> ReceiptWatcher<CS, A, P, K, T>
where
    CS: ChainService + 'static,
    A: OrchestrationClient + 'static,
    P: PendingJobStore + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    /// Immediate receipt lookup for a freshly persisted record. Returns true
    /// when the job completed, which skips the polling cycle entirely for
    /// chains that outpace the broker.
    pub async fn check_now(
        &self,
        chain: &Chain,
        job_uuid: Uuid,
    ) -> Result<bool, OrchestratorError> {
        let Some(record) = self.pending.get(job_uuid).await? else {
            return Ok(true);
        };
        let client = self.chain_service.get_client(chain)?;
        self.check_record(chain, &client, record, 1).await
    }

    /// Fetch the record's receipt, retrying up to `attempts` times with a
    /// fixed backoff to absorb the mined-to-queryable propagation lag, and
    /// run completion handling when it appears. Returns true when the job
    /// completed.
    pub async fn check_record(
        &self,
        chain: &Chain,
        client: &CS::Client,
        record: PendingJobRecord,
        attempts: u32,
    ) -> Result<bool, OrchestratorError> {
        let private = record.job.is_private();
        let hash = record.tx_hash;
        let attempts = attempts.max(1);

        let mut found: Option<Receipt> = None;
        for attempt in 1..=attempts {
            let receipt = if private {
                client.private_transaction_receipt(hash).await?
            } else {
                client.transaction_receipt(hash).await?
            };
            if receipt.is_some() {
                found = receipt;
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(RECEIPT_FETCH_BACKOFF).await;
            }
        }

        match found {
            Some(receipt) => {
                self.handle_mined(chain, client, record, receipt).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Completion handling for a mined transaction: contract code-hash
    /// registration, best-effort log decoding, terminal status, fan-out,
    /// teardown, offset commit.
    async fn handle_mined(
        &self,
        chain: &Chain,
        client: &CS::Client,
        mut record: PendingJobRecord,
        mut receipt: Receipt,
    ) -> Result<(), OrchestratorError> {
        let job_uuid = record.job_uuid();

        // A private payload can fail to decode while its marking transaction
        // is genuinely mined; the error rides along on the receipt.
        if let Some(decode_error) = &receipt.decode_error {
            tracing::warn!(%job_uuid, error = %decode_error, "private receipt carried a decode error");
        }

        if let Some(address) = receipt.contract_address {
            if address != Address::ZERO {
                let code = client.code_at(address).await?;
                let code_hash = keccak256(&code);
                self.api
                    .set_contract_address_code_hash(chain.chain_id, address, code_hash)
                    .await?;
                tracing::debug!(%job_uuid, contract = %address, "registered deployed contract code hash");
            }
        }

        self.decode_logs(chain, &mut receipt).await;

        let (status, message) = if !receipt.status {
            (
                JobStatus::Failed,
                match &receipt.revert_reason {
                    Some(reason) => format!("transaction reverted: {reason}"),
                    None => "transaction reverted".to_string(),
                },
            )
        } else if record.job.status == JobStatus::Warning {
            // The broadcast hash could not be verified; the receipt confirms
            // a transaction mined but operator attention is still required.
            (
                JobStatus::Warning,
                format!("transaction mined in block {} under an unverified hash", receipt.block_number),
            )
        } else {
            (
                JobStatus::Mined,
                format!("transaction mined in block {}", receipt.block_number),
            )
        };

        self.api
            .update_job(
                job_uuid,
                JobUpdate::status(status, message.clone()).with_receipt(receipt.clone()),
            )
            .await?;

        let label = chain.name.as_str();
        if status == JobStatus::Failed {
            self.metrics.jobs_failed.with_label_values(&[label]).inc();
        } else {
            self.metrics.jobs_mined.with_label_values(&[label]).inc();
        }

        record.job.record_status(status, message);
        self.notifier.notify(&record.job, Some(&receipt)).await?;

        self.pending.remove(job_uuid).await?;
        self.retry.cancel(job_uuid);
        self.finalize_relatives(&record).await;
        self.committer.complete(job_uuid).await?;

        tracing::info!(
            %job_uuid,
            block = receipt.block_number,
            ?status,
            "job confirmed"
        );
        Ok(())
    }

    /// Resolve event names from the contract catalog. Unknown events and
    /// catalog failures leave the log undecoded.
    async fn decode_logs(&self, chain: &Chain, receipt: &mut Receipt) {
        for log in &mut receipt.logs {
            let Some(topic0) = log.topics.first().copied() else {
                continue;
            };
            match self
                .api
                .get_contract_events(chain.chain_id, log.address, topic0)
                .await
            {
                Ok(events) => {
                    if let Some(event) = events.first() {
                        log.decoded_event = Some(event.name.clone());
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        address = %log.address,
                        error = %err,
                        "event catalog lookup failed, leaving log undecoded"
                    );
                }
            }
        }
    }

    /// When one job of an escalation chain mines, every relative (the
    /// parent and its other children) was superseded at the same nonce and
    /// can never mine. Finalizing them keeps the offset ledger moving.
    async fn finalize_relatives(&self, record: &PendingJobRecord) {
        let mined_uuid = record.job_uuid();
        let mut relatives: Vec<Uuid> = record.children.clone();
        if let Some(parent) = record.job.parent_job_uuid {
            relatives.push(parent);
            match self.pending.children(parent).await {
                Ok(siblings) => relatives.extend(siblings),
                Err(err) => {
                    tracing::warn!(%parent, error = %err, "could not list sibling jobs")
                }
            }
        }
        relatives.retain(|uuid| *uuid != mined_uuid);
        relatives.sort_unstable();
        relatives.dedup();

        for uuid in relatives {
            if let Err(err) = self.finalize_superseded(uuid, mined_uuid).await {
                tracing::warn!(job_uuid = %uuid, error = %err, "failed to finalize superseded job");
            }
        }
    }

    async fn finalize_superseded(
        &self,
        job_uuid: Uuid,
        mined_uuid: Uuid,
    ) -> Result<(), OrchestratorError> {
        self.retry.cancel(job_uuid);
        let removed = self.pending.remove(job_uuid).await?;
        if removed.is_some() {
            self.api
                .update_job(
                    job_uuid,
                    JobUpdate::status(
                        JobStatus::NeverMined,
                        format!("superseded by mined job {mined_uuid}"),
                    ),
                )
                .await?;
        }
        self.committer.complete(job_uuid).await?;
        Ok(())
    }

    /// Block-feed entry point for mined-job detection: match a settled
    /// block's transactions against the chain's pending records.
    pub async fn on_block(
        &self,
        chain: &Chain,
        client: &CS::Client,
        block: &BlockSummary,
    ) -> Result<(), OrchestratorError> {
        let records = self.pending.by_chain(chain.uuid).await?;
        if records.is_empty() {
            return Ok(());
        }

        let mined: HashSet<B256> = block.tx_hashes.iter().copied().collect();
        for record in records {
            if !mined.contains(&record.tx_hash) {
                continue;
            }
            let job_uuid = record.job_uuid();
            if let Err(err) = self
                .check_record(chain, client, record, RECEIPT_FETCH_ATTEMPTS)
                .await
            {
                tracing::warn!(
                    %job_uuid,
                    block = block.number,
                    error = %err,
                    "mined-job detection failed for block transaction"
                );
            }
        }
        Ok(())
    }

    /// Re-check every job still awaiting confirmation on one chain.
    /// Catches receipts whose watch events were missed.
    pub async fn rescan_chain(&self, chain: &Chain) -> Result<(), OrchestratorError> {
        let records = self.pending.by_chain(chain.uuid).await?;
        if records.is_empty() {
            return Ok(());
        }

        let client = self.chain_service.get_client(chain)?;
        for record in records {
            let job_uuid = record.job_uuid();
            if let Err(err) = self.check_record(chain, &client, record, 1).await {
                tracing::warn!(%job_uuid, error = %err, "receipt re-check failed");
            }
        }
        Ok(())
    }

    /// Periodic rescan loop for one chain, cancelled through the returned
    /// handle when the chain is deregistered or the engine shuts down.
    pub fn spawn_pending_rescan(self: &Arc<Self>, chain: Chain) -> TaskHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let watcher = Arc::clone(self);
        let join = tokio::spawn(async move {
            tracing::debug!(chain_uuid = %chain.uuid, "pending-job rescan loop started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(chain.listener_backoff) => {}
                }
                if let Err(err) = watcher.rescan_chain(&chain).await {
                    tracing::warn!(chain_uuid = %chain.uuid, error = %err, "pending-job rescan failed");
                }
            }
            tracing::debug!(chain_uuid = %chain.uuid, "pending-job rescan loop stopped");
        });
        TaskHandle { shutdown_tx, join }
    }
}
