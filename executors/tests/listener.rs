use fixtures::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use relayer_core::chain::BlockSummary;
use relayer_core::config::ListenerConfig;
use relayer_core::job::JobStatus;
use relayer_executors::health::HealthChecker;
use relayer_executors::listener::{ChainSet, ChainStateCache, blocks::BlockPoller};
use relayer_executors::nonce::MemoryNonceStore;
use relayer_executors::pending::PendingJobStore;
use tokio::sync::RwLock;

type TestCache = ChainStateCache<
    MockChainService,
    RecordingApi,
    relayer_executors::pending::MemoryPendingStore,
    RecordingCommitter,
    RecordingNotifier,
>;

fn cache_for(h: &Harness) -> Arc<TestCache> {
    let poller = Arc::new(BlockPoller {
        chain_service: h.chain_service.clone(),
        api: h.api.clone(),
        pending: h.pending.clone(),
        watcher: h.watcher.clone(),
        metrics: h.metrics.clone(),
    });
    let chains: ChainSet = Arc::new(RwLock::new(HashMap::new()));
    Arc::new(ChainStateCache::new(
        h.api.clone(),
        h.pending.clone(),
        h.committer.clone(),
        h.retry.clone(),
        h.watcher.clone(),
        poller,
        ListenerConfig::default(),
        chains,
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_block_poller_pushes_the_cursor_back() {
    init_tracing();
    let h = harness();
    h.client.set_block_number(5);
    h.api.set_chains(vec![h.chain.clone()]);

    let cache = cache_for(&h);
    cache.refresh().await.unwrap();

    let api = h.api.clone();
    let chain_uuid = h.chain.uuid;
    assert!(
        wait_for(
            || api
                .head_updates()
                .iter()
                .any(|(uuid, block)| *uuid == chain_uuid && *block == 5),
            Duration::from_secs(5)
        )
        .await,
        "listener cursor was never persisted"
    );
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_settled_block_feed_detects_the_mined_job() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.nonce = Some(0);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();
    let record = h.pending.get(job.uuid).await.unwrap().unwrap();

    h.client.insert_receipt(receipt_for(record.tx_hash));
    h.client.insert_block(BlockSummary {
        number: 1,
        hash: B256::repeat_byte(0x01),
        tx_hashes: vec![record.tx_hash],
    });
    h.client.set_block_number(1);
    h.api.set_chains(vec![h.chain.clone()]);

    let cache = cache_for(&h);
    cache.refresh().await.unwrap();

    let api = h.api.clone();
    let job_uuid = job.uuid;
    assert!(
        wait_for(
            || api.last_status(job_uuid) == Some(JobStatus::Mined),
            Duration::from_secs(5)
        )
        .await,
        "job was never confirmed off the block feed"
    );
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
    assert!(h.pending.get(job.uuid).await.unwrap().is_none());
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deregistered_chain_flushes_pending_jobs_and_sessions() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.nonce = Some(0);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();
    assert!(h.pending.get(job.uuid).await.unwrap().is_some());

    h.api.set_chains(vec![h.chain.clone()]);
    let cache = cache_for(&h);
    cache.refresh().await.unwrap();

    // The registry no longer lists the chain: its watch state is flushed
    // and the ledger entry released so commits keep moving.
    h.api.set_chains(Vec::new());
    cache.refresh().await.unwrap();

    assert!(h.pending.get(job.uuid).await.unwrap().is_none());
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
    assert_eq!(h.retry.active_sessions(), 0);
    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_readiness_reports_every_dependency() {
    init_tracing();
    let h = harness();
    let checker = HealthChecker::new(
        h.api.clone(),
        Arc::new(h.offsets.clone()),
        Some(Arc::new(MemoryNonceStore::new())),
    );

    let report = checker.check().await;
    assert!(report.is_ready());

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"UP\""));
}
