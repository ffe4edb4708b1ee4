use fixtures::*;

use std::time::Duration;

use alloy::primitives::{Address, B256, keccak256};
use relayer_core::chain::LogEntry;
use relayer_core::api::ContractEvent;
use relayer_core::job::{JobStatus, JobType};
use relayer_executors::pending::PendingJobStore;

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_seeds_nonce_and_commits_offset() {
    init_tracing();
    let h = harness();
    let job = test_job(&h.chain);

    // The chain is already caught up: a receipt is queryable before the
    // delivery is even processed, so no polling cycle is needed.
    h.client.set_pending_nonce(0);
    let account = job.transaction.from.unwrap();
    let mut expected_tx = job.transaction.clone();
    expected_tx.nonce = Some(0);
    expected_tx.gas_price = Some(DEFAULT_GAS_PRICE);
    let expected_hash = keccak256(&mock_signed_raw(&account, h.chain.chain_id, &expected_tx));
    h.client.insert_receipt(receipt_for(expected_hash));

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();

    assert_eq!(
        h.api.statuses(job.uuid),
        vec![JobStatus::Pending, JobStatus::Mined]
    );
    let update = h.api.last_update(job.uuid).unwrap();
    assert_eq!(update.receipt.unwrap().tx_hash, expected_hash);

    // Completion tore down the watch and committed the offset.
    assert!(h.pending.get(job.uuid).await.unwrap().is_none());
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
    assert_eq!(h.notifier.notifications().len(), 1);
    assert_eq!(h.retry.active_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_throttled_broadcast_resends_with_same_nonce() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.nonce = Some(1);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);

    h.client.push_send_error(throttled());
    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();

    assert_eq!(
        h.api.statuses(job.uuid),
        vec![JobStatus::Resending, JobStatus::Pending]
    );
    // The retry carried the identical payload: nonce unchanged.
    let record = h.pending.get(job.uuid).await.unwrap().unwrap();
    assert_eq!(record.job.transaction.nonce, Some(1));

    // The receipt eventually appears and the rescan completes the job.
    h.client.insert_receipt(receipt_for(record.tx_hash));
    h.watcher.rescan_chain(&h.chain).await.unwrap();

    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Mined));
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nonce_conflict_recovers_from_chain_and_rebroadcasts() {
    init_tracing();
    let h = harness();
    let job = test_job(&h.chain);

    // Allocation seeds 3, the node disagrees, recovery re-queries and gets 4.
    h.client.push_pending_nonce(3);
    h.client.set_pending_nonce(4);
    h.client.push_send_error(nonce_too_low());

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();

    assert_eq!(
        h.api.statuses(job.uuid),
        vec![JobStatus::Recovering, JobStatus::Pending]
    );
    let record = h.pending.get(job.uuid).await.unwrap().unwrap();
    assert_eq!(record.job.transaction.nonce, Some(4));
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_delivery_keeps_one_record_and_one_completion() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.nonce = Some(1);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();
    // The broker redelivers the same message at the next offset; the
    // deterministic payload broadcasts to the identical hash.
    h.worker
        .process_delivery(delivery(job.clone(), 1))
        .await
        .unwrap();

    let record = h.pending.get(job.uuid).await.unwrap().unwrap();

    // Nothing commits while the original delivery is still awaiting its
    // receipt, even though the duplicate is already closed.
    assert!(h.offsets.commits().is_empty());

    h.client.insert_receipt(receipt_for(record.tx_hash));
    h.watcher.rescan_chain(&h.chain).await.unwrap();

    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Mined));
    assert_eq!(h.offsets.commits(), vec![(0, 0), (0, 1)]);
    assert_eq!(h.notifier.notifications().len(), 1);
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_private_receipt_decode_error_still_counts_as_mined() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.job_type = JobType::EeaPrivateTransaction;
    job.transaction.nonce = Some(0);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);
    job.transaction.private_from = Some("A1aVtMxLCUHmBVHXoZzzBgPbW/wj5axDpW9X8l91SGo=".into());

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();
    let record = h.pending.get(job.uuid).await.unwrap().unwrap();

    let mut receipt = receipt_for(record.tx_hash);
    receipt.decode_error = Some("invalid private payload output".into());
    h.client.insert_receipt(receipt);
    h.watcher.rescan_chain(&h.chain).await.unwrap();

    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Mined));
    let update = h.api.last_update(job.uuid).unwrap();
    assert!(update.receipt.unwrap().decode_error.is_some());
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unpredicted_hash_warns_but_still_confirms() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.nonce = Some(0);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);

    // The node reports a different hash than the signer predicted.
    let node_hash = B256::repeat_byte(0xab);
    h.client.push_send_hash(node_hash);

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();
    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Warning));

    // The watch runs against the node-reported hash and completes, keeping
    // the warning for operator attention.
    let record = h.pending.get(job.uuid).await.unwrap().unwrap();
    assert_eq!(record.tx_hash, node_hash);
    h.client.insert_receipt(receipt_for(node_hash));
    h.watcher.rescan_chain(&h.chain).await.unwrap();

    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Warning));
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reverted_receipt_fails_the_job() {
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

    let mut receipt = receipt_for(record.tx_hash);
    receipt.status = false;
    receipt.revert_reason = Some("execution reverted: paused".into());
    h.client.insert_receipt(receipt);
    h.watcher.rescan_chain(&h.chain).await.unwrap();

    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Failed));
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_contract_creation_registers_code_hash_and_decodes_logs() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.to = None;
    job.transaction.nonce = Some(0);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);

    let sig_hash = keccak256(b"Transfer(address,address,uint256)");
    h.api.insert_event(ContractEvent {
        sig_hash,
        name: "Transfer".into(),
        abi: "event Transfer(address,address,uint256)".into(),
    });

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();
    let record = h.pending.get(job.uuid).await.unwrap().unwrap();

    let deployed = Address::repeat_byte(0x77);
    let mut receipt = receipt_for(record.tx_hash);
    receipt.contract_address = Some(deployed);
    receipt.logs = vec![LogEntry {
        address: deployed,
        topics: vec![sig_hash],
        data: Default::default(),
        decoded_event: None,
    }];
    h.client.insert_receipt(receipt);
    h.watcher.rescan_chain(&h.chain).await.unwrap();

    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Mined));

    let registered = h.api.code_hashes();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].1, deployed);

    let update = h.api.last_update(job.uuid).unwrap();
    let logs = update.receipt.unwrap().logs;
    assert_eq!(logs[0].decoded_event.as_deref(), Some("Transfer"));
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gas_escalation_is_capped_then_falls_back_to_resend() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.nonce = Some(5);
    job.transaction.gas_price = Some(1_000_000_000);
    job.internal_data.gas_price_increment = 0.06;
    job.internal_data.gas_price_limit = 0.12;
    job.internal_data.retry_interval = Duration::from_millis(50);

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();

    // First firing: +6%.
    let api = h.api.clone();
    assert!(
        wait_for(|| api.created_jobs().len() >= 1, Duration::from_secs(5)).await,
        "first escalation child was not created"
    );
    let first = h.api.created_jobs()[0].clone();
    assert_eq!(first.parent_job_uuid, Some(job.uuid));
    assert_eq!(first.transaction.nonce, Some(5));
    assert_eq!(first.transaction.gas_price, Some(1_060_000_000));

    // Second firing: capped at +12%, not +18%.
    let api = h.api.clone();
    assert!(
        wait_for(|| api.created_jobs().len() >= 2, Duration::from_secs(5)).await,
        "second escalation child was not created"
    );
    let second = h.api.created_jobs()[1].clone();
    assert_eq!(second.transaction.gas_price, Some(1_120_000_000));

    // The cap is reached: further firings resend the highest-gas child.
    let api = h.api.clone();
    assert!(
        wait_for(|| !api.resent_jobs().is_empty(), Duration::from_secs(5)).await,
        "fallback resend never happened"
    );
    assert_eq!(h.api.resent_jobs()[0], second.uuid);
    assert_eq!(h.api.created_jobs().len(), 2);

    // Both children were started back through the intake path.
    assert_eq!(h.api.started_jobs(), vec![first.uuid, second.uuid]);
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mined_child_finalizes_parent_and_commits_both_offsets() {
    init_tracing();
    let h = harness();
    let mut parent = test_job(&h.chain);
    parent.transaction.nonce = Some(5);
    parent.transaction.gas_price = Some(1_000_000_000);
    parent.internal_data.gas_price_increment = 0.06;
    parent.internal_data.gas_price_limit = 0.12;
    parent.internal_data.retry_interval = Duration::from_millis(50);

    h.worker
        .process_delivery(delivery(parent.clone(), 0))
        .await
        .unwrap();

    let api = h.api.clone();
    assert!(
        wait_for(|| api.created_jobs().len() >= 1, Duration::from_secs(5)).await,
        "escalation child was not created"
    );
    let child = h.api.created_jobs()[0].clone();

    // The child flows back through the broker at the next offset.
    h.worker
        .process_delivery(delivery(child.clone(), 1))
        .await
        .unwrap();
    let child_record = h.pending.get(child.uuid).await.unwrap().unwrap();

    h.client.insert_receipt(receipt_for(child_record.tx_hash));
    h.watcher.rescan_chain(&h.chain).await.unwrap();

    assert_eq!(h.api.last_status(child.uuid), Some(JobStatus::Mined));
    // The parent was superseded at the same nonce and can never mine.
    assert_eq!(h.api.last_status(parent.uuid), Some(JobStatus::NeverMined));
    assert!(h.pending.get(parent.uuid).await.unwrap().is_none());
    assert_eq!(h.offsets.commits(), vec![(0, 0), (0, 1)]);
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_with_consumed_nonce_is_not_recovered() {
    init_tracing();
    let h = harness();
    let mut parent = test_job(&h.chain);
    parent.transaction.nonce = Some(5);
    parent.transaction.gas_price = Some(DEFAULT_GAS_PRICE);

    let mut child = parent.spawn_escalation_child();
    child.transaction.gas_price = Some(DEFAULT_GAS_PRICE + DEFAULT_GAS_PRICE / 10);

    // Some job in the chain already landed at nonce 5: re-signing the
    // child at a fresh nonce would double-spend, so it is finalized.
    h.client.push_send_error(nonce_too_low());
    h.worker
        .process_delivery(delivery(child.clone(), 0))
        .await
        .unwrap();

    assert_eq!(h.api.last_status(child.uuid), Some(JobStatus::NeverMined));
    assert!(h.client.sent_raw().is_empty());
    assert!(h.pending.get(child.uuid).await.unwrap().is_none());
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_resend_budget_is_never_mined() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.transaction.nonce = Some(2);
    job.transaction.gas_price = Some(DEFAULT_GAS_PRICE);
    job.internal_data.retry_interval = Duration::from_millis(50);
    job.internal_data.max_resends = 1;

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();

    // One resend is allowed, then the next firing declares the job dead.
    let offsets = h.offsets.clone();
    assert!(
        wait_for(|| offsets.commits() == vec![(0, 0)], Duration::from_secs(5)).await,
        "job was never declared dead"
    );
    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::NeverMined));
    assert_eq!(h.api.resent_jobs(), vec![job.uuid]);
    assert!(h.pending.get(job.uuid).await.unwrap().is_none());

    let notifications = h.notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].1, JobStatus::NeverMined);
    h.retry.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unregistered_chain_fails_the_job() {
    init_tracing();
    let h = harness();
    let mut job = test_job(&h.chain);
    job.chain_uuid = uuid::Uuid::new_v4();

    h.worker
        .process_delivery(delivery(job.clone(), 0))
        .await
        .unwrap();

    assert_eq!(h.api.last_status(job.uuid), Some(JobStatus::Failed));
    assert_eq!(h.offsets.commits(), vec![(0, 0)]);
}
