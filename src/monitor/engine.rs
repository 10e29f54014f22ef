//! Periodic gas sampling and stuck-transaction scanning

use crate::config::Settings;
use crate::error::CoordinatorResult;
use crate::tx::{GasAdmissionGate, NonceCoordinator, RecoveryOutcome};

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Drives the coordinator and gate on a timer
pub struct MonitorEngine {
    settings: Arc<Settings>,
    nonces: Arc<NonceCoordinator>,
    gate: Arc<GasAdmissionGate>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl MonitorEngine {
    pub fn new(
        settings: Arc<Settings>,
        nonces: Arc<NonceCoordinator>,
        gate: Arc<GasAdmissionGate>,
    ) -> Self {
        Self {
            settings,
            nonces,
            gate,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main monitoring loop
    pub async fn run(&self) -> CoordinatorResult<()> {
        let monitor = &self.settings.monitor;

        let mut gas_interval = interval(Duration::from_secs(monitor.gas_sample_interval_secs.max(1)));
        gas_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stuck_interval =
            interval(Duration::from_secs(monitor.stuck_check_interval_secs.max(1)));
        stuck_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        match &monitor.address {
            Some(address) => info!("Monitor engine started, watching {}", address),
            None => info!("Monitor engine started (no address configured, stuck scan disabled)"),
        }

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = gas_interval.tick() => {
                    self.evaluate_gas().await;
                }

                _ = stuck_interval.tick() => {
                    if let Some(address) = monitor.address.as_deref() {
                        self.scan_stuck(address).await;
                    }
                }
            }
        }

        info!("Monitor engine stopped");
        Ok(())
    }

    /// Run the admission gate once for every enabled chain.
    ///
    /// Returns the number of chains evaluated successfully.
    pub async fn evaluate_gas(&self) -> usize {
        let mut evaluated = 0;

        for (chain, _) in self.settings.enabled_chains() {
            match self.gate.decide(chain).await {
                Ok(decision) => {
                    debug!(
                        "Gas on {}: {} gwei, proceed={} ({})",
                        chain, decision.price, decision.proceed, decision.reason
                    );
                    evaluated += 1;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Gas sample for {} failed: {}", chain, e);
                }
                Err(e) => {
                    error!("Gas evaluation for {} failed: {}", chain, e);
                }
            }
        }

        evaluated
    }

    /// Look for stuck transactions from `address` on every enabled chain.
    ///
    /// Returns the number of newly flagged transactions.
    pub async fn scan_stuck(&self, address: &str) -> usize {
        let mut flagged = 0;

        for (chain, config) in self.settings.enabled_chains() {
            let reports = match self
                .nonces
                .detect_stuck(chain, address, config.stuck_threshold_ms)
                .await
            {
                Ok(reports) => reports,
                Err(e) => {
                    warn!("Stuck scan for {} failed: {}", chain, e);
                    continue;
                }
            };

            for report in &reports {
                match &report.recovery {
                    RecoveryOutcome::Replace(params) => warn!(
                        "Stuck transaction {} on {} (nonce {}), resubmit with fee {}",
                        report.hash, chain, report.nonce, params.new_fee
                    ),
                    RecoveryOutcome::Exhausted { attempts, .. } => error!(
                        "Stuck transaction {} on {} exhausted {} recovery attempts",
                        report.hash, chain, attempts
                    ),
                }
            }
            flagged += reports.len();
        }

        flagged
    }

    /// Stop the monitor engine
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Monitor engine shutdown initiated");
    }
}
