use std::sync::Arc;

use relayer_core::api::{NotificationSink, OrchestrationClient};
use relayer_core::broker::OffsetCommitter;
use relayer_core::chain::{Chain, ChainClient, ChainService};
use relayer_core::error::OrchestratorError;
use tokio::sync::oneshot;

use crate::metrics::OrchestratorMetrics;
use crate::pending::PendingJobStore;

use super::TaskHandle;
use super::receipts::ReceiptWatcher;

/// Per-chain block cursor loop. Advances over settled blocks (head minus the
/// chain's finality depth), feeds their transactions into mined-job
/// detection, and pushes the cursor back to the registry so listener state
/// survives restarts.
pub struct BlockPoller<CS, A, P, K, T>
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
    pub watcher: Arc<ReceiptWatcher<CS, A, P, K, T>>,
    pub metrics: Arc<OrchestratorMetrics>,
}

impl<CS, A, P, K, T> BlockPoller<CS, A, P, K, T>
where
    CS: ChainService + 'static,
    A: OrchestrationClient + 'static,
    P: PendingJobStore + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    pub fn spawn(self: &Arc<Self>, chain: Chain) -> Result<TaskHandle, OrchestratorError> {
        let client = self.chain_service.get_client(&chain)?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let poller = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut cursor = chain.listener_current_block;
            tracing::info!(
                chain_uuid = %chain.uuid,
                chain_id = chain.chain_id,
                cursor,
                "block listener started"
            );
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(chain.listener_backoff) => {}
                }
                match poller.advance(&chain, &client, cursor).await {
                    Ok(new_cursor) => cursor = new_cursor,
                    Err(err) => {
                        tracing::warn!(
                            chain_uuid = %chain.uuid,
                            error = %err,
                            "block polling failed, retrying next interval"
                        );
                    }
                }
            }
            tracing::info!(chain_uuid = %chain.uuid, cursor, "block listener stopped");
        });

        Ok(TaskHandle { shutdown_tx, join })
    }

    /// Walk the cursor towards the settled head one block at a time. The
    /// cursor is persisted after every processed block, so a crash resumes
    /// at the next unprocessed height.
    async fn advance(
        &self,
        chain: &Chain,
        client: &CS::Client,
        cursor: u64,
    ) -> Result<u64, OrchestratorError> {
        let head = client.block_number().await?;
        let settled = head.saturating_sub(chain.listener_depth);
        if settled <= cursor {
            return Ok(cursor);
        }

        // No external-transaction observation and nothing of ours pending:
        // block bodies carry no work, fast-forward the cursor.
        if !chain.listener_external_tx_enabled
            && self.pending.by_chain(chain.uuid).await?.is_empty()
        {
            self.api.update_chain_head(chain.uuid, settled).await?;
            self.metrics
                .current_block
                .with_label_values(&[chain.name.as_str()])
                .set(settled as i64);
            return Ok(settled);
        }

        let mut current = cursor;
        while current < settled {
            let next = current + 1;
            let Some(block) = client.block_by_number(next).await? else {
                // The node has not served this height yet; retry next tick.
                break;
            };
            self.watcher.on_block(chain, client, &block).await?;
            current = next;
            self.api.update_chain_head(chain.uuid, current).await?;
            self.metrics
                .current_block
                .with_label_values(&[chain.name.as_str()])
                .set(current as i64);
            tracing::trace!(chain_uuid = %chain.uuid, block = current, "block processed");
        }
        Ok(current)
    }
}
