pub mod error_classifier;

use std::sync::Arc;

use alloy::primitives::{B256, keccak256};
use relayer_core::api::{JobUpdate, NotificationSink, OrchestrationClient};
use relayer_core::broker::{JobConsumer, JobDelivery, OffsetCommitter};
use relayer_core::chain::{Chain, ChainClient, ChainService};
use relayer_core::config::RetryConfig;
use relayer_core::error::OrchestratorError;
use relayer_core::job::{Job, JobStatus, JobType};
use relayer_core::signer::{SignedTransaction, TransactionSigner};
use tokio::sync::{Semaphore, oneshot};

use crate::listener::ChainSet;
use crate::listener::receipts::ReceiptWatcher;
use crate::metrics::OrchestratorMetrics;
use crate::nonce::{NonceAllocator, NonceKey, NonceStore};
use crate::offsets::{CompletionCommitter, TrackOutcome};
use crate::pending::{AddOutcome, PendingJobRecord, PendingJobStore};
use crate::retry::RetrySessionManager;

use error_classifier::{map_broadcast_error, recovery_for};

/// Consumes job deliveries off the broker and drives each through the send
/// pipeline: offset tracking, nonce allocation, gas fill, signing,
/// broadcast with error classification, pending record and receipt watch.
///
/// Deliveries are processed concurrently; the completion committer is what
/// keeps the offset commits contiguous.
pub struct SenderWorker<CS, S, A, N, P, K, T>
where
    CS: ChainService + 'static,
    S: TransactionSigner + 'static,
    A: OrchestrationClient + 'static,
    N: NonceStore + 'static,
    P: PendingJobStore + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    pub chains: ChainSet,
    pub chain_service: Arc<CS>,
    pub signer: Arc<S>,
    pub api: Arc<A>,
    pub allocator: Arc<NonceAllocator<N>>,
    pub pending: Arc<P>,
    pub committer: Arc<CompletionCommitter<K>>,
    pub watcher: Arc<ReceiptWatcher<CS, A, P, K, T>>,
    pub retry: Arc<RetrySessionManager<P, A, K, T>>,
    pub notifier: Arc<T>,
    pub metrics: Arc<OrchestratorMetrics>,
    pub retry_config: RetryConfig,
    pub concurrency: usize,
}

impl<CS, S, A, N, P, K, T> SenderWorker<CS, S, A, N, P, K, T>
where
    CS: ChainService + 'static,
    S: TransactionSigner + 'static,
    A: OrchestrationClient + 'static,
    N: NonceStore + 'static,
    P: PendingJobStore + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    /// Consume deliveries until the consumer closes or shutdown is
    /// signalled, then drain the in-flight ones. Retry timers are not
    /// waited for; they re-derive from the pending store on restart.
    pub async fn run<Cons>(
        self: Arc<Self>,
        mut consumer: Cons,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), OrchestratorError>
    where
        Cons: JobConsumer,
    {
        let permits = self.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        tracing::info!(concurrency = permits, "sender worker started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("sender shutdown requested");
                    break;
                }
                next = consumer.next() => match next? {
                    Some(delivery) => {
                        let permit = semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .map_err(|_| OrchestratorError::internal("sender semaphore closed"))?;
                        let worker = Arc::clone(&self);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(err) = worker.process_delivery(delivery).await {
                                tracing::warn!(
                                    error = %err,
                                    "delivery processing failed, offset left open for redelivery"
                                );
                            }
                        });
                    }
                    None => {
                        tracing::info!("job consumer closed");
                        break;
                    }
                }
            }
        }

        let _ = semaphore.acquire_many(permits as u32).await;
        tracing::info!("sender worker drained");
        Ok(())
    }

    /// The full pipeline for one delivery. Terminal job failures are
    /// handled inside and return Ok; an Err means an infrastructure
    /// failure, leaving the offset open so the broker redelivers.
    #[tracing::instrument(
        skip(self, delivery),
        fields(
            job_uuid = %delivery.job.uuid,
            partition = delivery.partition,
            offset = delivery.offset
        )
    )]
    pub async fn process_delivery(&self, delivery: JobDelivery) -> Result<(), OrchestratorError> {
        let JobDelivery {
            mut job,
            partition,
            offset,
        } = delivery;

        if self.committer.track(partition, offset, job.uuid).await == TrackOutcome::DuplicateJob {
            tracing::debug!("job already tracked at another offset");
        }

        if job.status.is_terminal() {
            // Stale redelivery of a finished job.
            self.committer.complete_delivery(partition, offset).await?;
            return Ok(());
        }

        if let Some(parent) = job.parent_job_uuid {
            // Normally done by the spawning retry session; re-tying here
            // covers redelivery after a restart.
            self.committer.register_child(parent, job.uuid).await;
        }

        let chain = { self.chains.read().await.get(&job.chain_uuid).cloned() };
        let Some(chain) = chain else {
            let err = OrchestratorError::ChainNotRegistered {
                chain_uuid: job.chain_uuid.to_string(),
            };
            return self.fail_job(&mut job, "unknown", err.to_string()).await;
        };
        let client = self.chain_service.get_client(&chain)?;

        // Children and resends carry their nonce; fresh jobs allocate one.
        let nonce_key = match (job.is_raw(), job.transaction.from) {
            (true, _) => None,
            (false, Some(from)) => Some(NonceKey::new(from, job.chain_uuid)),
            (false, None) => {
                let message = "transaction is missing a sender account".to_string();
                return self.fail_job(&mut job, &chain.name, message).await;
            }
        };

        if let Some(key) = &nonce_key {
            if job.transaction.nonce.is_none() {
                let nonce = self.allocator.allocate(key, &client).await?;
                job.transaction.nonce = Some(nonce);
                tracing::debug!(nonce, "allocated nonce");
            }
            if !job.transaction.has_gas_pricing() {
                let gas_price = client.gas_price().await?;
                job.transaction.gas_price = Some(gas_price);
                tracing::debug!(gas_price, "filled gas price from chain");
            } else if job.transaction.is_dynamic_fee()
                && job.transaction.max_priority_fee_per_gas.is_none()
            {
                let tip = client.max_priority_fee_per_gas().await?;
                job.transaction.max_priority_fee_per_gas = Some(tip);
                tracing::debug!(tip, "filled priority fee from chain");
            }
        }

        let Some(mut signed) = self.sign_with_retry(&chain, &mut job).await? else {
            return Ok(());
        };

        let Some(node_hash) = self
            .broadcast(&chain, &client, &mut job, &mut signed, nonce_key.as_ref())
            .await?
        else {
            return Ok(());
        };

        if let Some(key) = &nonce_key {
            self.allocator.confirm(key).await?;
        }

        // One-time-key payloads cannot predict their hash at all; a
        // predicted hash the node disagrees with may still be a valid
        // transaction, so it warns rather than fails.
        let (status, message) = match signed.hash {
            Some(expected) if expected != node_hash => (
                JobStatus::Warning,
                format!("node reported hash {node_hash}, expected {expected}"),
            ),
            _ => (
                JobStatus::Pending,
                format!("transaction sent with hash {node_hash}"),
            ),
        };

        job.transaction.hash = Some(node_hash);
        job.record_status(status, message.clone());
        self.api
            .update_job(
                job.uuid,
                JobUpdate::status(status, message).with_transaction(job.transaction.clone()),
            )
            .await?;

        let record = PendingJobRecord::new(job.clone(), node_hash);
        match self.pending.add(record).await? {
            AddOutcome::DuplicateHash => {
                tracing::debug!("duplicate delivery for an already-watched hash, dropping");
                self.committer.complete_delivery(partition, offset).await?;
                return Ok(());
            }
            AddOutcome::Added => tracing::debug!("pending record added"),
            AddOutcome::Replaced => {
                tracing::debug!("pending record replaced, watch restarted on the new hash")
            }
        }

        // The chain may have outpaced the broker; a receipt can already be
        // waiting before the first polling cycle.
        if self.watcher.check_now(&chain, job.uuid).await? {
            return Ok(());
        }
        // Escalation children are driven by their parent's session; arming
        // one per child would cascade escalations.
        if job.parent_job_uuid.is_none() {
            self.retry.start_session(&job, &chain.name);
        }
        Ok(())
    }

    async fn sign_job(
        &self,
        chain: &Chain,
        job: &Job,
    ) -> Result<SignedTransaction, OrchestratorError> {
        if job.is_raw() {
            let raw = job.transaction.raw.clone().ok_or_else(|| {
                OrchestratorError::ValidationError {
                    message: "raw transaction job carries no payload".into(),
                }
            })?;
            let hash = keccak256(&raw);
            return Ok(SignedTransaction::new(raw, hash));
        }

        if job.internal_data.one_time_key {
            return self
                .signer
                .sign_with_one_time_key(chain.chain_id, &job.transaction)
                .await;
        }

        let account = job
            .transaction
            .from
            .ok_or_else(|| OrchestratorError::ValidationError {
                message: "transaction is missing a sender account".into(),
            })?;
        let store_id = job.internal_data.store_id.as_deref();
        match job.job_type {
            JobType::Transaction | JobType::RawTransaction => {
                self.signer
                    .sign_transaction(account, store_id, chain.chain_id, &job.transaction)
                    .await
            }
            JobType::EeaPrivateTransaction => {
                self.signer
                    .sign_eea_transaction(account, store_id, chain.chain_id, &job.transaction)
                    .await
            }
            JobType::QuorumPrivateTransaction => {
                self.signer
                    .sign_quorum_private_transaction(
                        account,
                        store_id,
                        chain.chain_id,
                        &job.transaction,
                    )
                    .await
            }
        }
    }

    /// Sign with bounded backoff over transient signer outages. Permanent
    /// signer rejections fail the job; None means the job is finished.
    async fn sign_with_retry(
        &self,
        chain: &Chain,
        job: &mut Job,
    ) -> Result<Option<SignedTransaction>, OrchestratorError> {
        let mut attempt: u32 = 0;
        loop {
            match self.sign_job(chain, job).await {
                Ok(signed) => return Ok(Some(signed)),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry_config.broadcast_attempts {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, attempt, "signer unavailable, backing off");
                    tokio::time::sleep(self.retry_config.broadcast_backoff()).await;
                }
                Err(err @ OrchestratorError::SignerError { .. })
                | Err(err @ OrchestratorError::ValidationError { .. }) => {
                    self.fail_job(job, &chain.name, format!("signing failed: {err}"))
                        .await?;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Broadcast with error classification: nonce conflicts recover and
    /// re-sign, throttling and transport errors retry the same payload,
    /// mempool-duplicate responses fall through to the watch, anything else
    /// fails the job. Returns the hash to watch, or None when the job
    /// reached a terminal state.
    async fn broadcast(
        &self,
        chain: &Chain,
        client: &CS::Client,
        job: &mut Job,
        signed: &mut SignedTransaction,
        nonce_key: Option<&NonceKey>,
    ) -> Result<Option<B256>, OrchestratorError> {
        let mut attempt: u32 = 0;
        loop {
            let err = match client.send_raw_transaction(signed.raw.clone()).await {
                Ok(node_hash) => return Ok(Some(node_hash)),
                Err(err) => err,
            };

            let class = map_broadcast_error(&err);
            let recovery = recovery_for(&class);
            tracing::warn!(error = %err, ?class, "broadcast failed");

            if recovery.proceed_to_watch {
                // The payload is already in the mempool; watch it.
                let hash = signed.hash.unwrap_or_else(|| keccak256(&signed.raw));
                return Ok(Some(hash));
            }

            if recovery.recover_nonce {
                if job.parent_job_uuid.is_some() {
                    // An escalation child exists only to replace its
                    // parent's nonce. The nonce being consumed means some
                    // job in the chain landed; re-signing at a fresh nonce
                    // would send the transfer twice.
                    let message = format!(
                        "nonce consumed by another transaction in the escalation chain: {}",
                        class.message()
                    );
                    self.api
                        .update_job(
                            job.uuid,
                            JobUpdate::status(JobStatus::NeverMined, message.clone()),
                        )
                        .await?;
                    job.record_status(JobStatus::NeverMined, message);
                    self.committer.complete(job.uuid).await?;
                    return Ok(None);
                }

                let Some(key) = nonce_key else {
                    let message =
                        format!("nonce conflict on raw transaction: {}", class.message());
                    self.fail_job(job, &chain.name, message).await?;
                    return Ok(None);
                };

                self.api
                    .update_job(
                        job.uuid,
                        JobUpdate::status(JobStatus::Recovering, class.message()),
                    )
                    .await?;
                job.record_status(JobStatus::Recovering, class.message());

                match self.allocator.recover(key, client, chain.chain_id).await {
                    Ok(nonce) => {
                        job.transaction.nonce = Some(nonce);
                        let Some(re_signed) = self.sign_with_retry(chain, job).await? else {
                            return Ok(None);
                        };
                        *signed = re_signed;
                        continue;
                    }
                    Err(err @ OrchestratorError::NonceRecoveryExhausted { .. }) => {
                        self.fail_job(job, &chain.name, err.to_string()).await?;
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                }
            }

            if recovery.retryable {
                attempt += 1;
                if attempt >= self.retry_config.broadcast_attempts {
                    return Err(err);
                }
                self.api
                    .update_job(
                        job.uuid,
                        JobUpdate::status(JobStatus::Resending, class.message()),
                    )
                    .await?;
                job.record_status(JobStatus::Resending, class.message());
                self.metrics
                    .jobs_resent
                    .with_label_values(&[chain.name.as_str()])
                    .inc();
                tokio::time::sleep(
                    recovery
                        .retry_delay
                        .unwrap_or_else(|| self.retry_config.broadcast_backoff()),
                )
                .await;
                continue;
            }

            if recovery.release_nonce {
                if let Some(key) = nonce_key {
                    self.allocator.release(key).await?;
                }
            }
            self.fail_job(job, &chain.name, class.message().to_string())
                .await?;
            return Ok(None);
        }
    }

    /// Terminal failure: persist the status, fan out the notification and
    /// release the delivery's ledger entry.
    async fn fail_job(
        &self,
        job: &mut Job,
        chain_label: &str,
        message: String,
    ) -> Result<(), OrchestratorError> {
        tracing::warn!(job_uuid = %job.uuid, reason = %message, "job failed permanently");
        self.api
            .update_job(job.uuid, JobUpdate::status(JobStatus::Failed, message.clone()))
            .await?;
        job.record_status(JobStatus::Failed, message);
        self.metrics
            .jobs_failed
            .with_label_values(&[chain_label])
            .inc();
        self.notifier.notify(job, None).await?;
        self.committer.complete(job.uuid).await?;
        Ok(())
    }
}
