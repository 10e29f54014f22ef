//! Gas admission gating with per-chain fee history
//!
//! Each chain is either active or paused. A price above `pause_above_gwei`
//! pauses the chain, and it resumes once the price falls to
//! `auto_resume_below_gwei`. Prices between the acceptable ceiling and the
//! pause threshold need explicit confirmation from the caller.

use super::ChainLocks;
use crate::chain::ChainRpc;
use crate::clock::{Clock, SystemClock};
use crate::config::{GasStrategy, Settings};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::StateStore;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Store key of the gas document
pub const GAS_STATE_KEY: &str = "gas-state";

/// Samples kept per chain
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasSample {
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

/// Per-chain fee history and gate state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GasState {
    #[serde(with = "rust_decimal::serde::float")]
    pub current_price: Decimal,
    #[serde(with = "ts_milliseconds")]
    pub last_update_at: DateTime<Utc>,
    pub history: VecDeque<GasSample>,
    pub is_paused: bool,
    #[serde(
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub paused_since: Option<DateTime<Utc>>,
    #[serde(with = "rust_decimal::serde::float")]
    pub alert_threshold: Decimal,
}

impl GasState {
    /// Append a sample, evicting the oldest beyond capacity
    fn push_sample(&mut self, sample: GasSample) {
        while self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.current_price = sample.price;
        self.last_update_at = sample.timestamp;
        self.history.push_back(sample);
    }

    fn pause(&mut self, now: DateTime<Utc>) {
        self.is_paused = true;
        self.paused_since = Some(now);
    }

    fn resume(&mut self) {
        self.is_paused = false;
        self.paused_since = None;
    }
}

/// Persisted gas document, keyed by chain name
pub type GasDocument = BTreeMap<String, GasState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    WithinLimits,
    Resumed,
    PausedHighPrice,
    WaitingForPriceDrop,
    ManualInterventionRequired,
    RequiresConfirmation,
}

impl AdmissionReason {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionReason::WithinLimits => "within_limits",
            AdmissionReason::Resumed => "resumed",
            AdmissionReason::PausedHighPrice => "paused_high_price",
            AdmissionReason::WaitingForPriceDrop => "waiting_for_price_drop",
            AdmissionReason::ManualInterventionRequired => "manual_intervention_required",
            AdmissionReason::RequiresConfirmation => "requires_confirmation",
        }
    }
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AdmissionReason::WithinLimits => "price within acceptable limit",
            AdmissionReason::Resumed => "price dropped below resume threshold",
            AdmissionReason::PausedHighPrice => "price above pause threshold",
            AdmissionReason::WaitingForPriceDrop => "waiting for price drop",
            AdmissionReason::ManualInterventionRequired => "manual intervention required",
            AdmissionReason::RequiresConfirmation => "requires explicit confirmation",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub chain: String,
    pub proceed: bool,
    pub reason: AdmissionReason,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitOutcome {
    pub admitted: bool,
    /// Last observed price, absent if every poll failed
    pub price: Option<Decimal>,
    pub last_reason: Option<AdmissionReason>,
    pub waited: Duration,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasStatistics {
    pub chain: String,
    pub samples: usize,
    pub current: Decimal,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
    pub average: Option<Decimal>,
    pub is_paused: bool,
    pub paused_since: Option<DateTime<Utc>>,
    pub alert_threshold: Decimal,
    pub last_update_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub chain: String,
    pub gas_units: u64,
    pub price_gwei: Decimal,
    /// Cost in the chain's native currency
    pub cost_native: Decimal,
    pub cost_usd: Option<Decimal>,
}

/// Gates transaction submission on network fee conditions
pub struct GasAdmissionGate {
    settings: Arc<Settings>,
    store: StateStore,
    rpc: Arc<dyn ChainRpc>,
    clock: Arc<dyn Clock>,
    document: Mutex<GasDocument>,
    locks: ChainLocks,
}

impl GasAdmissionGate {
    /// Create a gate, loading any persisted state from `store`
    pub fn new(settings: Arc<Settings>, store: StateStore, rpc: Arc<dyn ChainRpc>) -> Self {
        let document: GasDocument = store.load(GAS_STATE_KEY);
        debug!("Loaded gas state for {} chains", document.len());

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

    /// Sample the current gas price and record it in history
    pub async fn sample_gas_price(&self, chain: &str) -> CoordinatorResult<Decimal> {
        let strategy = self.strategy(chain)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let (state, price, _) = self.observe(chain, &strategy).await?;
        self.commit(chain, state).await?;
        Ok(price)
    }

    /// Sample the price and decide whether a submission may proceed
    pub async fn decide(&self, chain: &str) -> CoordinatorResult<AdmissionDecision> {
        let strategy = self.strategy(chain)?;

        let lock = self.locks.for_chain(chain);
        let _guard = lock.lock().await;

        let (mut state, price, now) = self.observe(chain, &strategy).await?;

        let (proceed, reason) = if state.is_paused {
            let paused_since = *state.paused_since.get_or_insert(now);
            let max_wait = max_wait(chain, &strategy)?;

            if price <= strategy.auto_resume_below_gwei {
                state.resume();
                info!("Gas gate for {} resumed at {} gwei", chain, price);
                (true, AdmissionReason::Resumed)
            } else if now.signed_duration_since(paused_since) >= max_wait {
                warn!(
                    "Gas gate for {} paused since {} - manual intervention required ({} gwei)",
                    chain, paused_since, price
                );
                (false, AdmissionReason::ManualInterventionRequired)
            } else {
                (false, AdmissionReason::WaitingForPriceDrop)
            }
        } else if price > strategy.pause_above_gwei {
            state.pause(now);
            warn!(
                "Gas gate for {} paused: {} gwei above {} gwei",
                chain, price, strategy.pause_above_gwei
            );
            (false, AdmissionReason::PausedHighPrice)
        } else if price > strategy.max_acceptable_gwei {
            (false, AdmissionReason::RequiresConfirmation)
        } else {
            (true, AdmissionReason::WithinLimits)
        };

        let paused = state.is_paused;
        self.commit(chain, state).await?;

        crate::metrics::record_gate_paused(chain, paused);
        crate::metrics::record_admission(chain, reason.as_str());
        debug!("Admission for {} at {} gwei: {} ({})", chain, price, proceed, reason);

        Ok(AdmissionDecision {
            chain: chain.to_string(),
            proceed,
            reason,
            price,
        })
    }

    /// Poll `decide` until admission is granted or `timeout` elapses.
    ///
    /// Transient RPC failures are logged and retried on the next poll.
    pub async fn wait_for_admission(
        &self,
        chain: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> CoordinatorResult<WaitOutcome> {
        self.strategy(chain)?;

        let started = tokio::time::Instant::now();
        let mut polls = 0;
        let mut price = None;
        let mut last_reason = None;

        loop {
            polls += 1;
            match self.decide(chain).await {
                Ok(decision) if decision.proceed => {
                    return Ok(WaitOutcome {
                        admitted: true,
                        price: Some(decision.price),
                        last_reason: Some(decision.reason),
                        waited: started.elapsed(),
                        polls,
                    });
                }
                Ok(decision) => {
                    info!(
                        "Waiting for gas on {}: {} gwei ({})",
                        chain, decision.price, decision.reason
                    );
                    price = Some(decision.price);
                    last_reason = Some(decision.reason);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Gas poll for {} failed: {}", chain, e);
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!("Timed out after {:?} waiting for gas on {}", elapsed, chain);
                return Ok(WaitOutcome {
                    admitted: false,
                    price,
                    last_reason,
                    waited: elapsed,
                    polls,
                });
            }

            tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Min/max/average over the recorded history
    pub async fn get_statistics(&self, chain: &str) -> CoordinatorResult<GasStatistics> {
        self.strategy(chain)?;
        let state = self.snapshot(chain).await;
        Ok(statistics(chain, &state))
    }

    /// Human-readable summary of every configured chain
    pub async fn get_status_report(&self) -> String {
        let document = self.document.lock().await;
        let mut report = String::from("Gas status\n");

        for (chain, config) in self.settings.enabled_chains() {
            let gas = &config.gas;
            match document.get(chain.as_str()) {
                Some(state) if !state.history.is_empty() => {
                    let stats = statistics(chain, state);
                    let _ = writeln!(
                        report,
                        "  {:<10} {:>12} gwei  [{}]  avg {} / min {} / max {} over {} samples",
                        chain,
                        state.current_price.round_dp(4),
                        if state.is_paused { "PAUSED" } else { "ACTIVE" },
                        display_opt(stats.average),
                        display_opt(stats.min),
                        display_opt(stats.max),
                        stats.samples,
                    );
                }
                _ => {
                    let _ = writeln!(report, "  {:<10} no samples yet", chain);
                }
            }
            let _ = writeln!(
                report,
                "  {:<10} thresholds: ok <= {}, pause > {}, resume <= {}",
                "",
                gas.max_acceptable_gwei,
                gas.pause_above_gwei,
                gas.auto_resume_below_gwei
            );
        }

        report
    }

    /// Estimate the cost of `gas_units` at the current price
    pub async fn estimate_cost(
        &self,
        chain: &str,
        gas_units: u64,
        native_price_usd: Option<Decimal>,
    ) -> CoordinatorResult<CostEstimate> {
        let price_gwei = self.sample_gas_price(chain).await?;
        let cost_native = (Decimal::from(gas_units) * price_gwei / Decimal::from(1_000_000_000u64))
            .normalize();
        let cost_usd = native_price_usd.map(|usd| (cost_native * usd).round_dp(2));

        Ok(CostEstimate {
            chain: chain.to_string(),
            gas_units,
            price_gwei,
            cost_native,
            cost_usd,
        })
    }

    /// Snapshot of a chain's state
    pub async fn state(&self, chain: &str) -> GasState {
        self.snapshot(chain).await
    }

    fn strategy(&self, chain: &str) -> CoordinatorResult<GasStrategy> {
        Ok(self.settings.chain(chain)?.gas.clone())
    }

    /// Query the price and fold it into a copy of the chain's state
    async fn observe(
        &self,
        chain: &str,
        strategy: &GasStrategy,
    ) -> CoordinatorResult<(GasState, Decimal, DateTime<Utc>)> {
        let price = self.rpc.gas_price(chain).await?;
        let now = self.clock.now();

        let mut state = self.snapshot(chain).await;
        state.push_sample(GasSample {
            timestamp: now,
            price,
        });
        state.alert_threshold = strategy.max_acceptable_gwei;

        crate::metrics::record_gas_price(chain, price.to_f64().unwrap_or_default());
        Ok((state, price, now))
    }

    async fn snapshot(&self, chain: &str) -> GasState {
        self.document
            .lock()
            .await
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    /// Install `state` for `chain` and persist; memory is left untouched if the write fails
    async fn commit(&self, chain: &str, state: GasState) -> CoordinatorResult<()> {
        let mut document = self.document.lock().await;

        let previous = document.insert(chain.to_string(), state);
        if let Err(e) = self.store.save(GAS_STATE_KEY, &*document) {
            match previous {
                Some(previous) => document.insert(chain.to_string(), previous),
                None => document.remove(chain),
            };
            return Err(e);
        }
        Ok(())
    }
}

fn max_wait(chain: &str, strategy: &GasStrategy) -> CoordinatorResult<chrono::Duration> {
    i64::try_from(strategy.max_wait_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .ok_or_else(|| {
            CoordinatorError::Config(format!(
                "Chain {} max_wait_hours {} is out of range",
                chain, strategy.max_wait_hours
            ))
        })
}

fn statistics(chain: &str, state: &GasState) -> GasStatistics {
    let prices = state.history.iter().map(|s| s.price);
    let min = prices.clone().min();
    let max = prices.clone().max();
    let average = (!state.history.is_empty())
        .then(|| (prices.sum::<Decimal>() / Decimal::from(state.history.len())).round_dp(9));

    GasStatistics {
        chain: chain.to_string(),
        samples: state.history.len(),
        current: state.current_price,
        min,
        max,
        average,
        is_paused: state.is_paused,
        paused_since: state.paused_since,
        alert_threshold: state.alert_threshold,
        last_update_at: (!state.history.is_empty()).then_some(state.last_update_at),
    }
}

fn display_opt(value: Option<Decimal>) -> String {
    value
        .map(|v| v.round_dp(4).to_string())
        .unwrap_or_else(|| "-".to_string())
}
