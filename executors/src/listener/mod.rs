pub mod blocks;
pub mod receipts;

use std::collections::HashMap;
use std::sync::Arc;

use relayer_core::api::{NotificationSink, OrchestrationClient};
use relayer_core::broker::OffsetCommitter;
use relayer_core::chain::{Chain, ChainService};
use relayer_core::config::ListenerConfig;
use relayer_core::error::OrchestratorError;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::offsets::CompletionCommitter;
use crate::pending::PendingJobStore;
use crate::retry::RetrySessionManager;

use blocks::BlockPoller;
use receipts::ReceiptWatcher;

/// Registered chains, shared between the refresh loop, the sender pipeline
/// and the per-chain listener tasks.
pub type ChainSet = Arc<RwLock<HashMap<Uuid, Chain>>>;

/// A spawned listener task and its shutdown signal.
pub struct TaskHandle {
    pub shutdown_tx: oneshot::Sender<()>,
    pub join: JoinHandle<()>,
}

impl TaskHandle {
    /// Signal the task and wait for it to drain.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "listener task panicked during shutdown");
        }
    }
}

struct ChainTasks {
    blocks: TaskHandle,
    rescan: TaskHandle,
}

/// Maintains the set of active chains by diffing the registry at a fixed
/// interval. Additions start a block poller and a pending-job rescan loop
/// and re-derive retry sessions from the pending store; removals cancel both
/// loops and flush the chain's pending jobs.
pub struct ChainStateCache<CS, A, P, K, T>
where
    CS: ChainService + 'static,
    A: OrchestrationClient + 'static,
    P: PendingJobStore + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    pub api: Arc<A>,
    pub pending: Arc<P>,
    pub committer: Arc<CompletionCommitter<K>>,
    pub retry: Arc<RetrySessionManager<P, A, K, T>>,
    pub watcher: Arc<ReceiptWatcher<CS, A, P, K, T>>,
    pub poller: Arc<BlockPoller<CS, A, P, K, T>>,
    pub config: ListenerConfig,
    pub chains: ChainSet,
    tasks: Mutex<HashMap<Uuid, ChainTasks>>,
}

impl<CS, A, P, K, T> ChainStateCache<CS, A, P, K, T>
where
    CS: ChainService + 'static,
    A: OrchestrationClient + 'static,
    P: PendingJobStore + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<A>,
        pending: Arc<P>,
        committer: Arc<CompletionCommitter<K>>,
        retry: Arc<RetrySessionManager<P, A, K, T>>,
        watcher: Arc<ReceiptWatcher<CS, A, P, K, T>>,
        poller: Arc<BlockPoller<CS, A, P, K, T>>,
        config: ListenerConfig,
        chains: ChainSet,
    ) -> Self {
        Self {
            api,
            pending,
            committer,
            retry,
            watcher,
            poller,
            config,
            chains,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// One registry sync: fetch the chain list and reconcile the local set.
    pub async fn refresh(&self) -> Result<(), OrchestratorError> {
        let fetched = self.api.search_chains().await?;
        let mut fetched_map: HashMap<Uuid, Chain> = HashMap::with_capacity(fetched.len());
        for chain in fetched {
            fetched_map.insert(chain.uuid, chain);
        }

        let known: Vec<Uuid> = { self.chains.read().await.keys().copied().collect() };
        for uuid in known {
            if !fetched_map.contains_key(&uuid) {
                self.stop_chain(uuid).await;
            }
        }

        for (uuid, chain) in fetched_map {
            let is_new = { !self.chains.read().await.contains_key(&uuid) };
            self.chains.write().await.insert(uuid, chain.clone());
            if is_new {
                match self.start_chain(chain).await {
                    Ok(tasks) => {
                        self.tasks.lock().await.insert(uuid, tasks);
                    }
                    Err(err) => {
                        tracing::warn!(
                            chain_uuid = %uuid,
                            error = %err,
                            "failed to start chain listeners, retrying next refresh"
                        );
                        self.chains.write().await.remove(&uuid);
                    }
                }
            }
        }
        Ok(())
    }

    async fn start_chain(&self, chain: Chain) -> Result<ChainTasks, OrchestratorError> {
        tracing::info!(
            chain_uuid = %chain.uuid,
            chain_id = chain.chain_id,
            name = %chain.name,
            "chain registered, starting listeners"
        );
        let blocks = self.poller.spawn(chain.clone())?;
        let rescan = self.watcher.spawn_pending_rescan(chain.clone());

        // Retry cadence does not survive a restart, but pending records do:
        // re-arm a session for every job still awaiting confirmation.
        let records = self.pending.by_chain(chain.uuid).await?;
        for record in records {
            if !record.job.status.is_terminal() {
                self.retry.start_session(&record.job, &chain.name);
            }
        }

        Ok(ChainTasks { blocks, rescan })
    }

    async fn stop_chain(&self, chain_uuid: Uuid) {
        if let Some(chain) = self.chains.write().await.remove(&chain_uuid) {
            tracing::info!(
                %chain_uuid,
                name = %chain.name,
                "chain deregistered, stopping listeners"
            );
        }
        if let Some(tasks) = self.tasks.lock().await.remove(&chain_uuid) {
            tasks.blocks.stop().await;
            tasks.rescan.stop().await;
        }
        self.retry.cancel_chain(chain_uuid);
        if let Err(err) = self.flush_chain(chain_uuid).await {
            tracing::warn!(
                %chain_uuid,
                error = %err,
                "failed to flush pending jobs for deregistered chain"
            );
        }
    }

    /// Drop the chain's pending jobs. Their ledger entries are released so
    /// the partition's offset commits keep moving.
    async fn flush_chain(&self, chain_uuid: Uuid) -> Result<(), OrchestratorError> {
        let records = self.pending.by_chain(chain_uuid).await?;
        for record in records {
            let job_uuid = record.job_uuid();
            tracing::warn!(%job_uuid, %chain_uuid, "dropping pending job for deregistered chain");
            self.pending.remove(job_uuid).await?;
            self.committer.complete(job_uuid).await?;
        }
        Ok(())
    }

    /// Refresh loop: reconcile immediately, then at the configured interval
    /// until shut down.
    pub fn run(self: &Arc<Self>) -> TaskHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let cache = Arc::clone(self);
        let join = tokio::spawn(async move {
            loop {
                if let Err(err) = cache.refresh().await {
                    tracing::warn!(error = %err, "chain registry refresh failed");
                }
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(cache.config.refresh_interval()) => {}
                }
            }
            tracing::info!("chain registry refresh loop stopped");
        });
        TaskHandle { shutdown_tx, join }
    }

    /// Stop every per-chain task and cancel all retry sessions. Pending
    /// records stay in the store for the next startup.
    pub async fn shutdown(&self) {
        let drained: Vec<ChainTasks> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, chain_tasks)| chain_tasks).collect()
        };
        futures::future::join_all(drained.into_iter().flat_map(|chain_tasks| {
            [chain_tasks.blocks.stop(), chain_tasks.rescan.stop()]
        }))
        .await;
        self.retry.shutdown();
    }
}
