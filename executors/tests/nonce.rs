use fixtures::*;

use alloy::primitives::Address;
use relayer_core::config::NonceConfig;
use relayer_core::error::OrchestratorError;
use relayer_executors::nonce::{MemoryNonceStore, NonceAllocator, NonceKey};
use uuid::Uuid;

fn allocator(max_recovery: u32) -> NonceAllocator<MemoryNonceStore> {
    NonceAllocator::new(
        MemoryNonceStore::new(),
        &NonceConfig {
            max_recovery,
            ttl_secs: 3600,
        },
    )
}

fn key() -> NonceKey {
    NonceKey::new(Address::repeat_byte(0x11), Uuid::new_v4())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allocation_is_strictly_increasing() {
    init_tracing();
    let client = MockChainClient::new();
    client.set_pending_nonce(7);
    let allocator = allocator(5);
    let key = key();

    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 7);
    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 8);
    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_distinct_keys_are_independent() {
    init_tracing();
    let client = MockChainClient::new();
    client.set_pending_nonce(3);
    let allocator = allocator(5);
    let first = key();
    let second = key();

    assert_eq!(allocator.allocate(&first, &client).await.unwrap(), 3);
    assert_eq!(allocator.allocate(&second, &client).await.unwrap(), 3);
    assert_eq!(allocator.allocate(&first, &client).await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chain_failure_does_not_advance_state() {
    init_tracing();
    let client = MockChainClient::new();
    client.set_pending_nonce(7);
    client.push_pending_nonce_error(throttled());
    let allocator = allocator(5);
    let key = key();

    assert!(allocator.allocate(&key, &client).await.is_err());
    // The failed seeding attempt left no record behind.
    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recover_reseeds_from_chain_pending_nonce() {
    init_tracing();
    let client = MockChainClient::new();
    client.set_pending_nonce(7);
    let allocator = allocator(5);
    let key = key();

    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 7);
    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 8);

    // The chain reports a lower authoritative pending count, e.g. because
    // an earlier broadcast never actually landed.
    client.set_pending_nonce(5);
    assert_eq!(allocator.recover(&key, &client, 1).await.unwrap(), 5);
    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recovery_is_bounded() {
    init_tracing();
    let client = MockChainClient::new();
    client.set_pending_nonce(0);
    let allocator = allocator(2);
    let key = key();

    assert!(allocator.recover(&key, &client, 1).await.is_ok());
    assert!(allocator.recover(&key, &client, 1).await.is_ok());

    match allocator.recover(&key, &client, 1).await {
        Err(OrchestratorError::NonceRecoveryExhausted { attempts, .. }) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected NonceRecoveryExhausted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_confirm_resets_the_recovery_budget() {
    init_tracing();
    let client = MockChainClient::new();
    client.set_pending_nonce(0);
    let allocator = allocator(1);
    let key = key();

    assert!(allocator.recover(&key, &client, 1).await.is_ok());
    allocator.confirm(&key).await.unwrap();

    // The successful broadcast reset the consecutive-recovery counter.
    assert!(allocator.recover(&key, &client, 1).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_release_reseeds_next_allocation() {
    init_tracing();
    let client = MockChainClient::new();
    client.set_pending_nonce(7);
    let allocator = allocator(5);
    let key = key();

    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 7);
    allocator.release(&key).await.unwrap();

    // The permanently failed broadcast gave its nonce back.
    assert_eq!(allocator.allocate(&key, &client).await.unwrap(), 7);
}
