//! Shared utilities for integration testing.

use async_trait::async_trait;
use axum::{routing::post, Json, Router};
use chrono::DateTime;
use deploy_coordinator::config::{ChainConfig, GasStrategy, Settings};
use deploy_coordinator::{ChainRpc, CoordinatorError, CoordinatorResult, ManualClock};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub const OPERATOR: &str = "0x9999999999999999999999999999999999999999";

pub fn start_time() -> DateTime<chrono::Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Two-chain settings: an L1-like `devnet` and an L2-like `rollup`
#[allow(dead_code)]
pub fn settings(rpc_url: &str) -> Settings {
    let mut settings = Settings::default();
    settings.rpc.max_retries = 1;
    settings.rpc.retry_delay_ms = 10;
    settings.rpc.timeout_secs = 2;

    let chain = |chain_id, stuck_threshold_ms, gas| ChainConfig {
        chain_id,
        rpc_urls: vec![rpc_url.to_string()],
        stuck_threshold_ms,
        enabled: true,
        gas,
    };
    settings.chains = BTreeMap::from([
        (
            "devnet".to_string(),
            chain(
                1337,
                300_000,
                GasStrategy::new(
                    Decimal::from(50),
                    Decimal::from(100),
                    Decimal::from(40),
                    6,
                    5,
                ),
            ),
        ),
        (
            "rollup".to_string(),
            chain(
                31337,
                120_000,
                GasStrategy::new(
                    Decimal::new(5, 1),
                    Decimal::from(2),
                    Decimal::new(3, 1),
                    12,
                    5,
                ),
            ),
        ),
    ]);
    settings
}

/// In-memory chain whose gas prices and transaction counts are set by the test
#[derive(Default)]
pub struct FakeChain {
    gas: Mutex<HashMap<String, Decimal>>,
    counts: Mutex<HashMap<String, u64>>,
    offline: AtomicBool,
}

#[allow(dead_code)]
impl FakeChain {
    pub fn set_gas(&self, chain: &str, gwei: Decimal) {
        self.gas.lock().unwrap().insert(chain.to_string(), gwei);
    }

    pub fn set_count(&self, chain: &str, count: u64) {
        self.counts.lock().unwrap().insert(chain.to_string(), count);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self, chain: &str) -> CoordinatorResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Rpc {
                chain: chain.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn gas_price(&self, chain: &str) -> CoordinatorResult<Decimal> {
        self.check_online(chain)?;
        Ok(self
            .gas
            .lock()
            .unwrap()
            .get(chain)
            .copied()
            .unwrap_or_default())
    }

    async fn transaction_count(&self, chain: &str, _address: Address) -> CoordinatorResult<u64> {
        self.check_online(chain)?;
        Ok(self
            .counts
            .lock()
            .unwrap()
            .get(chain)
            .copied()
            .unwrap_or_default())
    }
}

/// Start a JSON-RPC backend answering gas price, transaction count and block number.
///
/// Returns the URL to point a provider at.
#[allow(dead_code)]
pub async fn start_rpc_backend(gas_price_wei: u64, tx_count: u64) -> String {
    let app = Router::new().route(
        "/",
        post(move |Json(request): Json<Value>| async move {
            let result = match request["method"].as_str() {
                Some("eth_gasPrice") => json!(format!("{:#x}", gas_price_wei)),
                Some("eth_getTransactionCount") => json!(format!("{:#x}", tx_count)),
                Some("eth_blockNumber") => json!("0x10"),
                _ => {
                    return Json(json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "error": { "code": -32601, "message": "method not found" }
                    }))
                }
            };
            Json(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }))
        }),
    );

    serve(app).await
}

/// Start a backend that fails every request with HTTP 500
#[allow(dead_code)]
pub async fn start_failing_backend() -> String {
    let app = Router::new().route(
        "/",
        post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "unavailable") }),
    );
    serve(app).await
}

/// Start a backend that answers only after `delay`
#[allow(dead_code)]
pub async fn start_slow_backend(delay: std::time::Duration) -> String {
    let app = Router::new().route(
        "/",
        post(move |Json(request): Json<Value>| async move {
            tokio::time::sleep(delay).await;
            Json(json!({ "jsonrpc": "2.0", "id": request["id"], "result": "0x1" }))
        }),
    );
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}
