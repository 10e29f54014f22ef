//! Chain module - JSON-RPC access to every configured network
//!
//! This module provides:
//! - The `ChainRpc` seam consumed by nonce coordination and gas gating
//! - Multi-RPC provider management with automatic failover
//! - Address parsing and validation

pub mod provider;

pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

/// The two chain facts the coordinator depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current gas price in gwei
    async fn gas_price(&self, chain: &str) -> CoordinatorResult<Decimal>;

    /// Next nonce the chain expects from `address`
    async fn transaction_count(&self, chain: &str, address: Address) -> CoordinatorResult<u64>;
}

/// Manages RPC providers for all configured chains
pub struct ChainClient {
    /// Chain providers indexed by chain name
    providers: DashMap<String, Arc<ChainProvider>>,
}

impl ChainClient {
    /// Create providers for every enabled chain
    pub fn new(settings: &Settings) -> CoordinatorResult<Self> {
        let providers = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            let provider = ChainProvider::new(name, chain_config.clone(), &settings.rpc)?;
            debug!(
                "Initialized chain {} (ID: {})",
                name,
                provider.chain_id()
            );
            providers.insert(name.clone(), Arc::new(provider));
        }

        info!("Chain client ready for {} chains", providers.len());
        Ok(Self { providers })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain: &str) -> CoordinatorResult<Arc<ChainProvider>> {
        self.providers
            .get(chain)
            .map(|p| p.clone())
            .ok_or_else(|| CoordinatorError::UnknownChain {
                chain: chain.to_string(),
            })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let providers: Vec<Arc<ChainProvider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();

        let checks = providers.iter().map(|provider| async move {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(provider.name(), healthy);
            (provider.name().to_string(), healthy)
        });

        let mut results = futures::future::join_all(checks).await;
        results.sort();
        results
    }

    /// Get all connected chain names
    pub fn connected_chains(&self) -> Vec<String> {
        let mut chains: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        chains.sort();
        chains
    }
}

#[async_trait]
impl ChainRpc for ChainClient {
    async fn gas_price(&self, chain: &str) -> CoordinatorResult<Decimal> {
        let provider = self.get_provider(chain)?;
        provider.get_gas_price().await.map_err(|e| {
            crate::metrics::record_rpc_error(chain, "gas_price");
            e
        })
    }

    async fn transaction_count(&self, chain: &str, address: Address) -> CoordinatorResult<u64> {
        let provider = self.get_provider(chain)?;
        provider.get_transaction_count(address).await.map_err(|e| {
            crate::metrics::record_rpc_error(chain, "transaction_count");
            e
        })
    }
}

/// Parse a `0x`-prefixed 20-byte hex address
pub fn parse_address(input: &str) -> CoordinatorResult<Address> {
    let invalid = |message: &str| CoordinatorError::InvalidAddress {
        address: input.to_string(),
        message: message.to_string(),
    };

    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .ok_or_else(|| invalid("missing 0x prefix"))?;
    if digits.len() != 40 {
        return Err(invalid("expected 40 hex characters"));
    }

    let mut bytes = [0u8; 20];
    hex::decode_to_slice(digits, &mut bytes).map_err(|e| invalid(&e.to_string()))?;
    Ok(Address::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let address = parse_address("0x742d35Cc6634C0532925a3b844Bc454e4438f44e").unwrap();
        assert_eq!(
            hex::encode(address.as_bytes()),
            "742d35cc6634c0532925a3b844bc454e4438f44e"
        );
    }

    #[test]
    fn test_parse_address_rejects_malformed() {
        for bad in [
            "742d35Cc6634C0532925a3b844Bc454e4438f44e",
            "0x742d35",
            "0xZZ2d35Cc6634C0532925a3b844Bc454e4438f44e",
        ] {
            assert!(matches!(
                parse_address(bad),
                Err(CoordinatorError::InvalidAddress { .. })
            ));
        }
    }

    #[test]
    fn test_client_knows_enabled_chains() {
        let client = ChainClient::new(&Settings::default()).unwrap();
        assert!(client.get_provider("sepolia").is_ok());
        assert!(matches!(
            client.get_provider("atlantis"),
            Err(CoordinatorError::UnknownChain { .. })
        ));
        assert_eq!(client.connected_chains().len(), 6);
    }
}
