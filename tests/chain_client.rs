//! RPC client behaviour against local JSON-RPC backends.

use deploy_coordinator::{
    ChainClient, ChainRpc, CoordinatorError, NonceCoordinator, StateStore,
};
use ethers::types::Address;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::OPERATOR;

#[tokio::test]
async fn test_reads_gas_price_and_transaction_count() {
    let url = common::start_rpc_backend(20_000_000_000, 5).await;
    let client = ChainClient::new(&common::settings(&url)).unwrap();

    assert_eq!(client.gas_price("devnet").await.unwrap(), Decimal::from(20));
    assert_eq!(
        client
            .transaction_count("devnet", Address::zero())
            .await
            .unwrap(),
        5
    );
    assert_eq!(
        client.health_check().await,
        vec![("devnet".to_string(), true), ("rollup".to_string(), true)]
    );
}

#[tokio::test]
async fn test_fractional_gwei_is_exact() {
    let url = common::start_rpc_backend(10_000_001, 0).await;
    let client = ChainClient::new(&common::settings(&url)).unwrap();

    assert_eq!(
        client.gas_price("rollup").await.unwrap(),
        Decimal::new(10_000_001, 9)
    );
}

#[tokio::test]
async fn test_fails_over_to_second_endpoint() {
    let bad = common::start_failing_backend().await;
    let good = common::start_rpc_backend(1_000_000_000, 0).await;

    let mut settings = common::settings(&good);
    settings.chains.get_mut("devnet").unwrap().rpc_urls = vec![bad, good];
    let client = ChainClient::new(&settings).unwrap();

    assert_eq!(client.gas_price("devnet").await.unwrap(), Decimal::from(1));
}

#[tokio::test]
async fn test_gives_up_after_retries() {
    let bad = common::start_failing_backend().await;
    let client = ChainClient::new(&common::settings(&bad)).unwrap();

    let err = client.gas_price("devnet").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Rpc { ref chain, .. } if chain == "devnet"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let slow = common::start_slow_backend(Duration::from_secs(3)).await;
    let mut settings = common::settings(&slow);
    settings.rpc.timeout_secs = 1;
    settings.rpc.max_retries = 0;
    let client = ChainClient::new(&settings).unwrap();

    let err = client.gas_price("devnet").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Timeout { ref operation } if operation.contains("devnet")));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unknown_chain() {
    let url = common::start_rpc_backend(1, 0).await;
    let client = ChainClient::new(&common::settings(&url)).unwrap();

    let err = client.gas_price("atlantis").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::UnknownChain { .. }));
}

#[tokio::test]
async fn test_coordinator_over_http() {
    let url = common::start_rpc_backend(1_000_000_000, 12).await;
    let settings = Arc::new(common::settings(&url));
    let client = Arc::new(ChainClient::new(&settings).unwrap());
    let dir = tempfile::tempdir().unwrap();

    let nonces = NonceCoordinator::new(settings, StateStore::new(dir.path()), client);
    assert_eq!(nonces.get_next_nonce("devnet", OPERATOR).await.unwrap(), 12);
    assert_eq!(nonces.get_next_nonce("devnet", OPERATOR).await.unwrap(), 13);
}
