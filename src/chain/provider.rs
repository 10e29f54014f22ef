//! Chain provider with multi-RPC support, automatic failover and bounded retries

use crate::config::{ChainConfig, RpcConfig};
use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, BlockId, BlockNumber, U256};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Wei per gwei, as a decimal scale
const GWEI_SCALE: u32 = 9;

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain name as configured
    name: String,
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Per-request timeout
    request_timeout: Duration,
    /// Retries after the first attempt
    max_retries: u32,
    /// Base delay between retries, doubled on each attempt
    retry_delay: Duration,
}

impl ChainProvider {
    /// Create a new chain provider. No network traffic happens here.
    pub fn new(name: &str, config: ChainConfig, rpc: &RpcConfig) -> CoordinatorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(CoordinatorError::Rpc {
                chain: name.to_string(),
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            request_timeout: Duration::from_secs(rpc.timeout_secs),
            max_retries: rpc.max_retries,
            retry_delay: Duration::from_millis(rpc.retry_delay_ms),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Current gas price in gwei
    pub async fn get_gas_price(&self) -> CoordinatorResult<Decimal> {
        let wei = self
            .call("eth_gasPrice", |provider| async move {
                provider.get_gas_price().await
            })
            .await?;
        wei_to_gwei(wei).ok_or_else(|| CoordinatorError::Rpc {
            chain: self.name.clone(),
            message: format!("Gas price {} wei out of range", wei),
        })
    }

    /// Transaction count for `address`, including transactions still in the mempool
    pub async fn get_transaction_count(&self, address: Address) -> CoordinatorResult<u64> {
        let count = self
            .call("eth_getTransactionCount", move |provider| async move {
                provider
                    .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Pending)))
                    .await
            })
            .await?;

        if count > U256::from(u64::MAX) {
            return Err(CoordinatorError::Rpc {
                chain: self.name.clone(),
                message: format!("Transaction count {} out of range", count),
            });
        }
        Ok(count.as_u64())
    }

    /// Get current block number
    pub async fn get_block_number(&self) -> CoordinatorResult<u64> {
        let block = self
            .call("eth_blockNumber", |provider| async move {
                provider.get_block_number().await
            })
            .await?;
        Ok(block.as_u64())
    }

    /// Run an RPC call with timeout, failing over and backing off between attempts
    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> CoordinatorResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_retries + 1;
        let mut last_error = String::new();
        let mut timed_out = false;

        for attempt in 1..=max_attempts {
            match timeout(self.request_timeout, f(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!(
                        "{} failed on chain {} (attempt {}/{}): {}",
                        operation, self.name, attempt, max_attempts, e
                    );
                    last_error = e.to_string();
                    timed_out = false;
                }
                Err(_) => {
                    warn!(
                        "{} timed out on chain {} (attempt {}/{})",
                        operation, self.name, attempt, max_attempts
                    );
                    last_error = format!("timed out after {:?}", self.request_timeout);
                    timed_out = true;
                }
            }

            self.failover();
            if attempt < max_attempts {
                tokio::time::sleep(backoff_delay(self.retry_delay, attempt)).await;
            }
        }

        // The last attempt decides how the failure is reported
        if timed_out {
            return Err(CoordinatorError::Timeout {
                operation: format!("{} on chain {} ({})", operation, self.name, last_error),
            });
        }
        Err(CoordinatorError::Rpc {
            chain: self.name.clone(),
            message: format!("{}: {}", operation, last_error),
        })
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.name, e);
                false
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Convert a wei amount to gwei without losing precision
pub fn wei_to_gwei(wei: U256) -> Option<Decimal> {
    if wei > U256::from(u128::MAX) {
        return None;
    }
    let wei = i128::try_from(wei.as_u128()).ok()?;
    Decimal::try_from_i128_with_scale(wei, GWEI_SCALE)
        .ok()
        .map(|d| d.normalize())
}
