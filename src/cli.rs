//! Command-line interface
//!
//! Command results go to stdout (JSON for structured values) and logs go to
//! stderr, so output can be piped into other tools.

use crate::config::{Settings, CONFIG_ENV};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::tx::{GasAdmissionGate, NonceCoordinator, RecoveryOutcome};

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "deploy-coordinator", version)]
#[command(about = "Nonce coordination and gas admission for multi-chain deployments", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Directory holding the state documents (overrides the config file)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Nonce allocation and stuck transaction handling
    Nonce {
        #[command(subcommand)]
        command: NonceCommand,
    },
    /// Gas price checks and admission
    Gas {
        #[command(subcommand)]
        command: GasCommand,
    },
    /// Run the monitor, HTTP API, and metrics endpoint
    Serve,
}

#[derive(Debug, Subcommand)]
pub enum NonceCommand {
    /// Allocate the next nonce for an address
    Next { chain: String, address: String },
    /// Record a submitted transaction as pending
    Record {
        chain: String,
        hash: String,
        nonce: u64,
        /// Fee price in gwei
        fee_price: Decimal,
    },
    /// Flag pending transactions that have been waiting too long
    DetectStuck {
        chain: String,
        address: String,
        /// Defaults to the chain's configured threshold
        #[arg(long)]
        threshold_ms: Option<u64>,
    },
    /// Suggest an escalated replacement for a stuck transaction
    Recover { chain: String, hash: String },
    /// Mark a transaction as mined
    Confirm { chain: String, hash: String },
    /// Show nonce state for every chain
    Status,
    /// Reset a chain's state from the on-chain transaction count
    Resync { chain: String, address: String },
}

#[derive(Debug, Subcommand)]
pub enum GasCommand {
    /// Decide whether a transaction may be submitted now
    Check { chain: String },
    /// Print the current gas price in gwei
    Current { chain: String },
    /// Estimate the cost of a transaction
    Estimate {
        chain: String,
        gas_units: u64,
        /// Native token price in USD
        native_price_usd: Option<Decimal>,
    },
    /// Block until gas is admissible or the timeout expires
    Wait {
        chain: String,
        /// Poll interval in minutes (defaults to the chain strategy)
        interval_min: Option<u64>,
        /// Timeout in hours (defaults to the chain's max wait)
        timeout_hours: Option<u64>,
    },
    /// Gas price statistics over the recorded history
    Stats { chain: String },
    /// Gas status of every chain
    Status,
}

/// Services a command runs against
pub struct Services {
    pub settings: Arc<Settings>,
    pub nonces: Arc<NonceCoordinator>,
    pub gate: Arc<GasAdmissionGate>,
}

/// Run a nonce command. Returns whether the process should exit successfully;
/// an exhausted recovery is not a success.
pub async fn execute_nonce(
    command: NonceCommand,
    services: &Services,
    out: &mut impl Write,
) -> CoordinatorResult<bool> {
    let nonces = &services.nonces;

    match command {
        NonceCommand::Next { chain, address } => {
            let nonce = nonces.get_next_nonce(&chain, &address).await?;
            writeln!(out, "{}", nonce)?;
        }
        NonceCommand::Record {
            chain,
            hash,
            nonce,
            fee_price,
        } => {
            nonces.record_pending(&chain, &hash, nonce, fee_price).await?;
            writeln!(out, "Recorded {} with nonce {} on {}", hash, nonce, chain)?;
        }
        NonceCommand::DetectStuck {
            chain,
            address,
            threshold_ms,
        } => {
            let threshold_ms = match threshold_ms {
                Some(ms) => ms,
                None => services.settings.chain(&chain)?.stuck_threshold_ms,
            };
            let reports = nonces.detect_stuck(&chain, &address, threshold_ms).await?;
            print_json(out, &reports)?;
        }
        NonceCommand::Recover { chain, hash } => {
            let outcome = nonces.attempt_recovery(&chain, &hash).await?;
            print_json(out, &outcome)?;
            return Ok(!matches!(outcome, RecoveryOutcome::Exhausted { .. }));
        }
        NonceCommand::Confirm { chain, hash } => {
            if nonces.confirm_transaction(&chain, &hash).await? {
                writeln!(out, "Confirmed {} on {}", hash, chain)?;
            } else {
                writeln!(out, "{} was not tracked on {}", hash, chain)?;
            }
        }
        NonceCommand::Status => {
            print_json(out, &nonces.status().await)?;
        }
        NonceCommand::Resync { chain, address } => {
            let report = nonces.emergency_resync(&chain, &address).await?;
            print_json(out, &report)?;
        }
    }

    Ok(true)
}

/// Run a gas command. Returns whether the process should exit successfully;
/// a refused admission is not a success.
pub async fn execute_gas(
    command: GasCommand,
    services: &Services,
    out: &mut impl Write,
) -> CoordinatorResult<bool> {
    let gate = &services.gate;

    match command {
        GasCommand::Check { chain } => {
            let decision = gate.decide(&chain).await?;
            writeln!(
                out,
                "{}: {} gwei, {} ({})",
                chain,
                decision.price,
                if decision.proceed { "proceed" } else { "wait" },
                decision.reason
            )?;
            Ok(decision.proceed)
        }
        GasCommand::Current { chain } => {
            let price = gate.sample_gas_price(&chain).await?;
            writeln!(out, "{}", price)?;
            Ok(true)
        }
        GasCommand::Estimate {
            chain,
            gas_units,
            native_price_usd,
        } => {
            let estimate = gate.estimate_cost(&chain, gas_units, native_price_usd).await?;
            print_json(out, &estimate)?;
            Ok(true)
        }
        GasCommand::Wait {
            chain,
            interval_min,
            timeout_hours,
        } => {
            let strategy = &services.settings.chain(&chain)?.gas;
            let interval_min = interval_min.unwrap_or(strategy.poll_interval_minutes);
            let timeout_hours = timeout_hours.unwrap_or(strategy.max_wait_hours);
            if interval_min == 0 {
                return Err(CoordinatorError::Validation(
                    "Poll interval must be at least one minute".to_string(),
                ));
            }

            let interval = interval_min.checked_mul(60).ok_or_else(|| {
                CoordinatorError::Validation(format!("Poll interval {} min is too large", interval_min))
            })?;
            let timeout = timeout_hours.checked_mul(3600).ok_or_else(|| {
                CoordinatorError::Validation(format!("Timeout {} h is too large", timeout_hours))
            })?;

            let outcome = gate
                .wait_for_admission(&chain, Duration::from_secs(interval), Duration::from_secs(timeout))
                .await?;
            print_json(out, &outcome)?;
            Ok(outcome.admitted)
        }
        GasCommand::Stats { chain } => {
            print_json(out, &gate.get_statistics(&chain).await?)?;
            Ok(true)
        }
        GasCommand::Status => {
            write!(out, "{}", gate.get_status_report().await)?;
            Ok(true)
        }
    }
}

fn print_json<T: Serialize>(out: &mut impl Write, value: &T) -> CoordinatorResult<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainRpc;
    use crate::clock::ManualClock;
    use crate::state::StateStore;
    use clap::CommandFactory;

    const ADDRESS: &str = "0x2222222222222222222222222222222222222222";

    fn services(rpc: MockChainRpc, dir: &std::path::Path) -> Services {
        let settings = Arc::new(Settings::default());
        let rpc = Arc::new(rpc);
        let store = StateStore::new(dir);
        Services {
            nonces: Arc::new(NonceCoordinator::new(settings.clone(), store.clone(), rpc.clone())),
            gate: Arc::new(GasAdmissionGate::new(settings.clone(), store, rpc)),
            settings,
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_nested_commands() {
        let cli = Cli::try_parse_from([
            "deploy-coordinator",
            "--state-dir",
            "/tmp/state",
            "nonce",
            "record",
            "sepolia",
            "0xabc",
            "7",
            "12.5",
        ])
        .unwrap();
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/state")));
        match cli.command {
            Command::Nonce {
                command: NonceCommand::Record { nonce, fee_price, .. },
            } => {
                assert_eq!(nonce, 7);
                assert_eq!(fee_price, Decimal::new(125, 1));
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from([
            "deploy-coordinator",
            "nonce",
            "detect-stuck",
            "mainnet",
            ADDRESS,
            "--threshold-ms",
            "1000",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Nonce {
                command: NonceCommand::DetectStuck {
                    threshold_ms: Some(1000),
                    ..
                }
            }
        ));
    }

    #[tokio::test]
    async fn test_next_prints_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let mut rpc = MockChainRpc::new();
        rpc.expect_transaction_count().returning(|_, _| Ok(42));
        let services = services(rpc, dir.path());

        let mut out = Vec::new();
        let ok = execute_nonce(
            NonceCommand::Next {
                chain: "sepolia".to_string(),
                address: ADDRESS.to_string(),
            },
            &services,
            &mut out,
        )
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(String::from_utf8(out).unwrap(), "42\n");
    }

    #[tokio::test]
    async fn test_gas_check_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut rpc = MockChainRpc::new();
        rpc.expect_gas_price().returning(|_| Ok(Decimal::from(75)));
        let services = services(rpc, dir.path());

        let mut out = Vec::new();
        let ok = execute_gas(
            GasCommand::Check {
                chain: "sepolia".to_string(),
            },
            &services,
            &mut out,
        )
        .await
        .unwrap();
        assert!(!ok);
        assert!(String::from_utf8(out).unwrap().contains("wait"));
    }

    #[tokio::test]
    async fn test_recover_until_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut rpc = MockChainRpc::new();
        rpc.expect_transaction_count().returning(|_, _| Ok(0));
        let rpc = Arc::new(rpc);
        let settings = Arc::new(Settings::default());
        let store = StateStore::new(dir.path());
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let services = Services {
            nonces: Arc::new(
                NonceCoordinator::new(settings.clone(), store.clone(), rpc.clone())
                    .with_clock(clock.clone()),
            ),
            gate: Arc::new(GasAdmissionGate::new(settings.clone(), store, rpc)),
            settings,
        };
        let hash = format!("0x{}", "ab".repeat(32));

        let mut out = Vec::new();
        execute_nonce(
            NonceCommand::Record {
                chain: "sepolia".to_string(),
                hash: hash.clone(),
                nonce: 0,
                fee_price: Decimal::from(20),
            },
            &services,
            &mut out,
        )
        .await
        .unwrap();

        clock.advance(chrono::Duration::minutes(10));
        let ok = execute_nonce(
            NonceCommand::DetectStuck {
                chain: "sepolia".to_string(),
                address: ADDRESS.to_string(),
                threshold_ms: Some(300_000),
            },
            &services,
            &mut out,
        )
        .await
        .unwrap();
        assert!(ok);

        let recover = || NonceCommand::Recover {
            chain: "sepolia".to_string(),
            hash: hash.clone(),
        };
        for _ in 0..2 {
            let mut out = Vec::new();
            assert!(execute_nonce(recover(), &services, &mut out).await.unwrap());
            assert!(String::from_utf8(out).unwrap().contains("\"replace\""));
        }

        let mut out = Vec::new();
        let ok = execute_nonce(recover(), &services, &mut out).await.unwrap();
        assert!(!ok);
        let printed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(printed["outcome"], "exhausted");
        assert_eq!(printed["attempts"], 3);
    }

    #[tokio::test]
    async fn test_recover_unknown_hash_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(MockChainRpc::new(), dir.path());

        let mut out = Vec::new();
        let result = execute_nonce(
            NonceCommand::Recover {
                chain: "sepolia".to_string(),
                hash: format!("0x{}", "cd".repeat(32)),
            },
            &services,
            &mut out,
        )
        .await;
        assert!(result.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_wait_rejects_overflowing_durations() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(MockChainRpc::new(), dir.path());

        let mut out = Vec::new();
        let result = execute_gas(
            GasCommand::Wait {
                chain: "sepolia".to_string(),
                interval_min: Some(u64::MAX),
                timeout_hours: Some(1),
            },
            &services,
            &mut out,
        )
        .await;
        assert!(matches!(result, Err(CoordinatorError::Validation(_))));

        let result = execute_gas(
            GasCommand::Wait {
                chain: "sepolia".to_string(),
                interval_min: Some(1),
                timeout_hours: Some(u64::MAX / 60),
            },
            &services,
            &mut out,
        )
        .await;
        assert!(matches!(result, Err(CoordinatorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_chain_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(MockChainRpc::new(), dir.path());

        let mut out = Vec::new();
        let result = execute_gas(
            GasCommand::Stats {
                chain: "atlantis".to_string(),
            },
            &services,
            &mut out,
        )
        .await;
        assert!(matches!(result, Err(CoordinatorError::UnknownChain { .. })));
    }
}
