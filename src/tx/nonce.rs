//! Nonce coordination for reliable transaction submission
//!
//! Handles:
//! - Durable per-chain nonce allocation
//! - Reconciliation against the on-chain transaction count
//! - Stuck transaction detection and fee escalation

use super::{normalize_tx_hash, ChainLocks};
use crate::chain::{parse_address, ChainRpc};
use crate::clock::{Clock, SystemClock};
use crate::config::{ChainConfig, Settings};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::StateStore;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Store key of the nonce document
pub const NONCE_STATE_KEY: &str = "nonce-state";

/// Fee escalations allowed per stuck transaction
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Fees persist as JSON numbers (f64), exact up to this many significant digits
pub const MAX_FEE_DIGITS: usize = 15;

/// A transaction reported as submitted but not yet confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub hash: String,
    pub nonce: u64,
    #[serde(with = "ts_milliseconds")]
    pub submitted_at: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_price: Decimal,
}

/// A pending transaction that outlived its chain's stuck threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckTransaction {
    pub hash: String,
    pub nonce: u64,
    #[serde(with = "ts_milliseconds")]
    pub stuck_since: DateTime<Utc>,
    pub recovery_attempts: u32,
    /// Fee of the original submission, escalated on each recovery
    #[serde(default, with = "rust_decimal::serde::float")]
    pub fee_price: Decimal,
}

impl StuckTransaction {
    pub fn is_exhausted(&self) -> bool {
        self.recovery_attempts >= MAX_RECOVERY_ATTEMPTS
    }
}

/// Per-chain nonce bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NonceState {
    /// Next nonce to allocate
    pub current: u64,
    pub pending: Vec<PendingTransaction>,
    pub stuck: Vec<StuckTransaction>,
    #[serde(with = "ts_milliseconds")]
    pub last_sync_at: DateTime<Utc>,
}

/// Persisted nonce document, keyed by chain name
pub type NonceDocument = BTreeMap<String, NonceState>;

/// Result of reconciling local state with the chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub chain: String,
    pub previous: u64,
    pub on_chain: u64,
    pub current: u64,
    pub cleared_pending: usize,
    pub pruned_stuck: usize,
}

/// Replacement parameters for the external submitter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplacementParams {
    pub chain: String,
    pub hash: String,
    pub nonce: u64,
    pub original_fee: Decimal,
    pub new_fee: Decimal,
    pub attempt: u32,
}

/// What a recovery request produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Resubmit at the same nonce with an escalated fee
    Replace(ReplacementParams),
    /// Attempt limit reached; needs manual handling
    Exhausted {
        chain: String,
        hash: String,
        nonce: u64,
        attempts: u32,
    },
}

/// A transaction newly flagged as stuck, with its first recovery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckReport {
    pub hash: String,
    pub nonce: u64,
    pub age_ms: i64,
    pub recovery: RecoveryOutcome,
}

/// Read-only summary of a chain's nonce state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NonceStatus {
    pub chain: String,
    pub current: u64,
    pub pending: usize,
    pub stuck: usize,
    pub exhausted: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Coordinates nonces across multiple chains
pub struct NonceCoordinator {
    settings: Arc<Settings>,
    store: StateStore,
    rpc: Arc<dyn ChainRpc>,
    clock: Arc<dyn Clock>,
    /// In-memory copy of the persisted document
    document: Mutex<NonceDocument>,
    /// Serializes operations per chain
    locks: ChainLocks,
}

impl NonceCoordinator {
    /// Create a coordinator, loading any persisted state from `store`
    pub fn new(settings: Arc<Settings>, store: StateStore, rpc: Arc<dyn ChainRpc>) -> Self {
        let document: NonceDocument = store.load(NONCE_STATE_KEY);
        debug!("Loaded nonce state for {} chains", document.len());

        Self {
            settings,
            store,
            rpc,
            clock: Arc::new(SystemClock),
            document: Mutex::new(document),
            locks: ChainLocks::default(),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Allocate the next nonce for a chain.
    ///
    /// Reconciles with the chain first when the last sync is older than the
    /// configured interval. The incremented counter is persisted before the
    /// nonce is returned.
    pub async fn get_next_nonce(&self, chain: &str, address: &str) -> CoordinatorResult<u64> {
        self.chain_config(chain)?;
        let address = parse_address(address)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let mut state = self.snapshot(chain).await;
        let now = self.clock.now();
        let sync_interval = Duration::from_std(self.settings.nonce.sync_interval()).map_err(|_| {
            CoordinatorError::Config(format!(
                "nonce.sync_interval_secs {} is out of range",
                self.settings.nonce.sync_interval_secs
            ))
        })?;

        if now.signed_duration_since(state.last_sync_at) > sync_interval {
            let on_chain = self.rpc.transaction_count(chain, address).await?;
            reconcile(chain, &mut state, on_chain, now);
        }

        let nonce = state.current;
        state.current = nonce.checked_add(1).ok_or_else(|| {
            CoordinatorError::Internal(format!("Nonce counter overflow on chain {}", chain))
        })?;

        self.commit(chain, state).await?;
        crate::metrics::record_nonce_allocated(chain);

        debug!("Allocated nonce {} for chain {}", nonce, chain);
        Ok(nonce)
    }

    /// Reconcile with the on-chain transaction count. The tracked counter never decreases.
    pub async fn sync_with_chain(&self, chain: &str, address: &str) -> CoordinatorResult<SyncReport> {
        self.chain_config(chain)?;
        let address = parse_address(address)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let on_chain = self.rpc.transaction_count(chain, address).await?;
        let mut state = self.snapshot(chain).await;
        let report = reconcile(chain, &mut state, on_chain, self.clock.now());

        self.commit(chain, state).await?;
        Ok(report)
    }

    /// Record a submitted transaction as pending
    pub async fn record_pending(
        &self,
        chain: &str,
        hash: &str,
        nonce: u64,
        fee_price: Decimal,
    ) -> CoordinatorResult<()> {
        self.chain_config(chain)?;
        let hash = normalize_tx_hash(hash)?;
        if fee_price.is_sign_negative() {
            return Err(CoordinatorError::Validation(format!(
                "Fee price must not be negative: {}",
                fee_price
            )));
        }
        if significant_digits(fee_price) > MAX_FEE_DIGITS {
            return Err(CoordinatorError::Validation(format!(
                "Fee price {} has more than {} significant digits",
                fee_price, MAX_FEE_DIGITS
            )));
        }

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let mut state = self.snapshot(chain).await;
        if state.pending.iter().any(|p| p.hash == hash) {
            debug!("Transaction {} already pending on chain {}", hash, chain);
            return Ok(());
        }

        state.pending.push(PendingTransaction {
            hash: hash.clone(),
            nonce,
            submitted_at: self.clock.now(),
            fee_price,
        });
        self.commit(chain, state).await?;

        debug!("Recorded pending tx {} (nonce {}) on chain {}", hash, nonce, chain);
        Ok(())
    }

    /// Flag pending transactions older than `threshold_ms` as stuck and start recovery.
    ///
    /// Entries the chain has already moved past are treated as mined and dropped
    /// instead. Entries already flagged are left alone, so repeated calls are idempotent.
    pub async fn detect_stuck(
        &self,
        chain: &str,
        address: &str,
        threshold_ms: u64,
    ) -> CoordinatorResult<Vec<StuckReport>> {
        self.chain_config(chain)?;
        let address = parse_address(address)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let on_chain = self.rpc.transaction_count(chain, address).await?;
        let mut state = self.snapshot(chain).await;
        let now = self.clock.now();
        let threshold = i64::try_from(threshold_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX);

        let before = state.pending.len() + state.stuck.len();
        state.pending.retain(|p| p.nonce >= on_chain);
        state.stuck.retain(|s| s.nonce >= on_chain);
        let mined = before - (state.pending.len() + state.stuck.len());
        if mined > 0 {
            debug!("Dropped {} mined entries on chain {}", mined, chain);
        }

        let newly_stuck: Vec<PendingTransaction> = state
            .pending
            .iter()
            .filter(|p| now.signed_duration_since(p.submitted_at) > threshold)
            .filter(|p| !state.stuck.iter().any(|s| s.hash == p.hash))
            .cloned()
            .collect();

        let mut reports = Vec::with_capacity(newly_stuck.len());
        for pending in newly_stuck {
            warn!(
                "Transaction {} (nonce {}) stuck on chain {} for {}s",
                pending.hash,
                pending.nonce,
                chain,
                now.signed_duration_since(pending.submitted_at).num_seconds()
            );

            let mut stuck = StuckTransaction {
                hash: pending.hash.clone(),
                nonce: pending.nonce,
                stuck_since: now,
                recovery_attempts: 0,
                fee_price: pending.fee_price,
            };
            let recovery = escalate(chain, &mut stuck)?;
            state.stuck.push(stuck);

            reports.push(StuckReport {
                hash: pending.hash,
                nonce: pending.nonce,
                age_ms: now.signed_duration_since(pending.submitted_at).num_milliseconds(),
                recovery,
            });
        }

        if mined > 0 || !reports.is_empty() {
            self.commit(chain, state).await?;
        }
        Ok(reports)
    }

    /// Suggest an escalated replacement for a stuck transaction
    pub async fn attempt_recovery(&self, chain: &str, hash: &str) -> CoordinatorResult<RecoveryOutcome> {
        self.chain_config(chain)?;
        let hash = normalize_tx_hash(hash)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let mut state = self.snapshot(chain).await;
        let stuck = state
            .stuck
            .iter_mut()
            .find(|s| s.hash == hash)
            .ok_or_else(|| CoordinatorError::TransactionNotFound {
                chain: chain.to_string(),
                hash: hash.clone(),
            })?;

        let outcome = escalate(chain, stuck)?;
        if matches!(outcome, RecoveryOutcome::Replace(_)) {
            self.commit(chain, state).await?;
        }
        Ok(outcome)
    }

    /// Stop tracking a mined transaction. Unknown hashes are ignored.
    pub async fn confirm_transaction(&self, chain: &str, hash: &str) -> CoordinatorResult<bool> {
        self.chain_config(chain)?;
        let hash = normalize_tx_hash(hash)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let mut state = self.snapshot(chain).await;
        let before = state.pending.len() + state.stuck.len();
        state.pending.retain(|p| p.hash != hash);
        state.stuck.retain(|s| s.hash != hash);

        if state.pending.len() + state.stuck.len() == before {
            debug!("Confirm for untracked tx {} on chain {}", hash, chain);
            return Ok(false);
        }

        self.commit(chain, state).await?;
        info!("Confirmed tx {} on chain {}", hash, chain);
        Ok(true)
    }

    /// Replace local state with chain truth, discarding all pending and stuck bookkeeping
    pub async fn emergency_resync(&self, chain: &str, address: &str) -> CoordinatorResult<SyncReport> {
        self.chain_config(chain)?;
        let address = parse_address(address)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let on_chain = self.rpc.transaction_count(chain, address).await?;
        let previous = self.snapshot(chain).await;

        let state = NonceState {
            current: on_chain,
            pending: Vec::new(),
            stuck: Vec::new(),
            last_sync_at: self.clock.now(),
        };
        self.commit(chain, state).await?;
        crate::metrics::record_emergency_resync(chain);

        warn!(
            "Emergency resync on chain {}: nonce {} -> {}, discarded {} pending and {} stuck",
            chain,
            previous.current,
            on_chain,
            previous.pending.len(),
            previous.stuck.len()
        );

        Ok(SyncReport {
            chain: chain.to_string(),
            previous: previous.current,
            on_chain,
            current: on_chain,
            cleared_pending: previous.pending.len(),
            pruned_stuck: previous.stuck.len(),
        })
    }

    /// Snapshot of a chain's state
    pub async fn state(&self, chain: &str) -> NonceState {
        self.snapshot(chain).await
    }

    /// Summary of one chain
    pub async fn chain_status(&self, chain: &str) -> CoordinatorResult<NonceStatus> {
        self.chain_config(chain)?;
        Ok(summarize(chain, &self.snapshot(chain).await))
    }

    /// Summary of every chain with recorded state
    pub async fn status(&self) -> Vec<NonceStatus> {
        let document = self.document.lock().await;
        document
            .iter()
            .map(|(chain, state)| summarize(chain, state))
            .collect()
    }

    fn chain_config(&self, chain: &str) -> CoordinatorResult<&ChainConfig> {
        self.settings.chain(chain)
    }

    async fn snapshot(&self, chain: &str) -> NonceState {
        self.document
            .lock()
            .await
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    /// Install `state` for `chain` and persist; memory is left untouched if the write fails
    async fn commit(&self, chain: &str, state: NonceState) -> CoordinatorResult<()> {
        let (pending, stuck) = (state.pending.len(), state.stuck.len());
        let mut document = self.document.lock().await;

        let previous = document.insert(chain.to_string(), state);
        if let Err(e) = self.store.save(NONCE_STATE_KEY, &*document) {
            match previous {
                Some(previous) => document.insert(chain.to_string(), previous),
                None => document.remove(chain),
            };
            return Err(e);
        }

        crate::metrics::record_nonce_tracking(chain, pending, stuck);
        Ok(())
    }
}

/// Raise the tracked counter to the chain's when it is ahead.
///
/// Any upward divergence clears the whole pending list. Stuck entries whose
/// nonce the chain has consumed are dropped.
fn reconcile(chain: &str, state: &mut NonceState, on_chain: u64, now: DateTime<Utc>) -> SyncReport {
    let previous = state.current;
    let mut cleared_pending = 0;

    if on_chain > state.current {
        warn!(
            "Nonce divergence on chain {}: tracked {}, on-chain {}",
            chain, state.current, on_chain
        );
        cleared_pending = state.pending.len();
        state.current = on_chain;
        state.pending.clear();
    }

    let before = state.stuck.len();
    state.stuck.retain(|s| s.nonce >= on_chain);
    let pruned_stuck = before - state.stuck.len();

    state.last_sync_at = now;

    SyncReport {
        chain: chain.to_string(),
        previous,
        on_chain,
        current: state.current,
        cleared_pending,
        pruned_stuck,
    }
}

/// Escalate the fee of a stuck transaction by 1.5x per attempt, up to the limit
fn escalate(chain: &str, stuck: &mut StuckTransaction) -> CoordinatorResult<RecoveryOutcome> {
    if stuck.is_exhausted() {
        warn!(
            "Recovery exhausted for tx {} (nonce {}) on chain {} - manual intervention required",
            stuck.hash, stuck.nonce, chain
        );
        crate::metrics::record_recovery_exhausted(chain);
        return Ok(RecoveryOutcome::Exhausted {
            chain: chain.to_string(),
            hash: stuck.hash.clone(),
            nonce: stuck.nonce,
            attempts: stuck.recovery_attempts,
        });
    }

    let attempt = stuck.recovery_attempts + 1;
    let new_fee = stuck
        .fee_price
        .checked_mul(escalation_factor(attempt))
        .ok_or_else(|| CoordinatorError::Internal(format!("Fee overflow escalating {}", stuck.hash)))?;
    stuck.recovery_attempts = attempt;
    crate::metrics::record_recovery_attempt(chain);

    info!(
        "Recovery {}/{} for tx {} on chain {}: fee {} -> {}",
        attempt, MAX_RECOVERY_ATTEMPTS, stuck.hash, chain, stuck.fee_price, new_fee
    );

    Ok(RecoveryOutcome::Replace(ReplacementParams {
        chain: chain.to_string(),
        hash: stuck.hash.clone(),
        nonce: stuck.nonce,
        original_fee: stuck.fee_price,
        new_fee,
        attempt,
    }))
}

/// 1.5^attempt
fn escalation_factor(attempt: u32) -> Decimal {
    let step = Decimal::new(15, 1);
    (0..attempt).fold(Decimal::ONE, |acc, _| acc * step)
}

fn summarize(chain: &str, state: &NonceState) -> NonceStatus {
    NonceStatus {
        chain: chain.to_string(),
        current: state.current,
        pending: state.pending.len(),
        stuck: state.stuck.len(),
        exhausted: state.stuck.iter().filter(|s| s.is_exhausted()).count(),
        last_sync_at: (state.last_sync_at.timestamp_millis() > 0).then_some(state.last_sync_at),
    }
}

fn significant_digits(value: Decimal) -> usize {
    let mantissa = value.normalize().mantissa().unsigned_abs();
    if mantissa == 0 {
        1
    } else {
        mantissa.to_string().trim_end_matches('0').len()
    }
}
