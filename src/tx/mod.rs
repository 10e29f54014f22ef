//! Transaction submission coordination: nonce allocation and gas admission

mod gas;
mod nonce;

pub use gas::{
    AdmissionDecision, AdmissionReason, CostEstimate, GasAdmissionGate, GasDocument, GasSample,
    GasState, GasStatistics, WaitOutcome, GAS_STATE_KEY, HISTORY_CAPACITY,
};
pub use nonce::{
    NonceCoordinator, NonceDocument, NonceState, NonceStatus, PendingTransaction,
    RecoveryOutcome, ReplacementParams, StuckReport, StuckTransaction, SyncReport,
    MAX_RECOVERY_ATTEMPTS, NONCE_STATE_KEY,
};

use crate::error::{CoordinatorError, CoordinatorResult};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Normalize a `0x`-prefixed 32-byte transaction hash to lowercase
pub fn normalize_tx_hash(input: &str) -> CoordinatorResult<String> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| CoordinatorError::InvalidHash {
            hash: input.to_string(),
        })?;
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

/// Per-chain async locks serializing logical operations
#[derive(Default)]
pub(crate) struct ChainLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChainLocks {
    pub(crate) fn for_chain(&self, chain: &str) -> Arc<Mutex<()>> {
        self.locks.entry(chain.to_string()).or_default().clone()
    }
}
