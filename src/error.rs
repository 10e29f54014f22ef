//! Error types for the deployment coordinator

use thiserror::Error;

/// Main error type for nonce coordination and gas gating
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown chain '{chain}'")]
    UnknownChain { chain: String },

    #[error("Invalid address '{address}': {message}")]
    InvalidAddress { address: String, message: String },

    #[error("Invalid transaction hash '{hash}'")]
    InvalidHash { hash: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("RPC error for chain {chain}: {message}")]
    Rpc { chain: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {hash} not tracked on chain {chain}")]
    TransactionNotFound { chain: String, hash: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Rpc { .. } | CoordinatorError::Timeout { .. }
        )
    }

    /// Validation failures are the caller's fault and never retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoordinatorError::UnknownChain { .. }
                | CoordinatorError::InvalidAddress { .. }
                | CoordinatorError::InvalidHash { .. }
                | CoordinatorError::Validation(_)
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let rpc = CoordinatorError::Rpc {
            chain: "sepolia".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(rpc.is_retryable());
        assert!(!rpc.is_validation());

        let unknown = CoordinatorError::UnknownChain {
            chain: "nowhere".to_string(),
        };
        assert!(!unknown.is_retryable());
        assert!(unknown.is_validation());
    }
}
