//! Configuration management for the deployment coordinator
//!
//! Loads configuration from a TOML file with environment variable substitution.
//! When no file exists at the default location, built-in chain definitions are used.
//! Per-chain RPC endpoints can be overridden with `<CHAIN_NAME>_RPC_URL`.

use crate::error::{CoordinatorError, CoordinatorResult};

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "COORDINATOR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Upper bound for `nonce.sync_interval_secs` (one year)
pub const MAX_SYNC_INTERVAL_SECS: u64 = 365 * 24 * 3600;
/// Upper bound for a gas strategy's `max_wait_hours` (one year)
pub const MAX_WAIT_HOURS: u64 = 365 * 24;

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern is valid");
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub chains: BTreeMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Directory holding the nonce and gas state documents
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".deploy-state"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NonceConfig {
    /// Reconcile with the chain before allocating when the last sync is older than this
    pub sync_interval_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
        }
    }
}

impl NonceConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Operator address watched for stuck transactions in serve mode
    pub address: Option<String>,
    pub gas_sample_interval_secs: u64,
    pub stuck_check_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            address: None,
            gas_sample_interval_secs: 60,
            stuck_check_interval_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// Age after which a pending transaction counts as stuck
    pub stuck_threshold_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub gas: GasStrategy,
}

fn default_enabled() -> bool {
    true
}

/// Fee thresholds driving the admission gate, all in gwei
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GasStrategy {
    pub max_acceptable_gwei: Decimal,
    pub pause_above_gwei: Decimal,
    pub auto_resume_below_gwei: Decimal,
    pub max_wait_hours: u64,
    pub poll_interval_minutes: u64,
}

impl GasStrategy {
    pub fn new(
        max_acceptable: Decimal,
        pause_above: Decimal,
        auto_resume_below: Decimal,
        max_wait_hours: u64,
        poll_interval_minutes: u64,
    ) -> Self {
        Self {
            max_acceptable_gwei: max_acceptable,
            pause_above_gwei: pause_above,
            auto_resume_below_gwei: auto_resume_below,
            max_wait_hours,
            poll_interval_minutes,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let l2 = || {
            GasStrategy::new(
                Decimal::new(5, 1),
                Decimal::new(2, 0),
                Decimal::new(3, 1),
                12,
                5,
            )
        };
        let chain = |chain_id: u64, url: &str, stuck_threshold_ms: u64, gas: GasStrategy| {
            ChainConfig {
                chain_id,
                rpc_urls: vec![url.to_string()],
                stuck_threshold_ms,
                enabled: true,
                gas,
            }
        };

        let mut chains = BTreeMap::new();
        chains.insert(
            "mainnet".to_string(),
            chain(
                1,
                "https://eth.llamarpc.com",
                600_000,
                GasStrategy::new(Decimal::new(50, 0), Decimal::new(100, 0), Decimal::new(40, 0), 24, 15),
            ),
        );
        chains.insert(
            "sepolia".to_string(),
            chain(
                11_155_111,
                "https://rpc.sepolia.org",
                300_000,
                GasStrategy::new(Decimal::new(50, 0), Decimal::new(100, 0), Decimal::new(40, 0), 6, 5),
            ),
        );
        chains.insert(
            "arbitrum".to_string(),
            chain(42_161, "https://arb1.arbitrum.io/rpc", 120_000, l2()),
        );
        chains.insert(
            "optimism".to_string(),
            chain(10, "https://mainnet.optimism.io", 120_000, l2()),
        );
        chains.insert(
            "base".to_string(),
            chain(8_453, "https://mainnet.base.org", 120_000, l2()),
        );
        chains.insert(
            "polygon".to_string(),
            chain(
                137,
                "https://polygon-rpc.com",
                300_000,
                GasStrategy::new(Decimal::new(150, 0), Decimal::new(300, 0), Decimal::new(100, 0), 12, 10),
            ),
        );

        Self {
            state: StateConfig::default(),
            nonce: NonceConfig::default(),
            rpc: RpcConfig::default(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
            chains,
        }
    }
}

impl Settings {
    /// Load settings from an explicit path, `COORDINATOR_CONFIG`, or the default location.
    ///
    /// Only a missing file at the default location falls back to built-in chains;
    /// an explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> CoordinatorResult<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut settings = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    info!("No config file found, using built-in chain definitions");
                    Self::default()
                }
            }
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> CoordinatorResult<Self> {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        debug!("Loaded config file {:?}", path);
        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text after substituting `${VAR}` references
    pub fn from_toml_str(input: &str) -> CoordinatorResult<Self> {
        let config_str = substitute_env_vars(input);
        toml::from_str(&config_str)
            .map_err(|e| CoordinatorError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Replace RPC URLs with `<CHAIN_NAME>_RPC_URL` when set (comma separated)
    pub fn apply_env_overrides(&mut self) {
        for (name, chain) in self.chains.iter_mut() {
            if let Ok(value) = env::var(rpc_env_var(name)) {
                let urls: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from)
                    .collect();
                if !urls.is_empty() {
                    debug!("RPC override for chain {}: {} url(s)", name, urls.len());
                    chain.rpc_urls = urls;
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.enabled_chains().is_empty() {
            return Err(CoordinatorError::Config(
                "At least one chain must be enabled".to_string(),
            ));
        }

        if self.nonce.sync_interval_secs > MAX_SYNC_INTERVAL_SECS {
            return Err(CoordinatorError::Config(format!(
                "nonce.sync_interval_secs must be at most {}",
                MAX_SYNC_INTERVAL_SECS
            )));
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                return Err(CoordinatorError::Config(format!(
                    "Chain {} has no RPC URLs configured",
                    name
                )));
            }
            let gas = &chain.gas;
            if gas.auto_resume_below_gwei > gas.max_acceptable_gwei
                || gas.max_acceptable_gwei > gas.pause_above_gwei
            {
                return Err(CoordinatorError::Config(format!(
                    "Chain {} gas thresholds must satisfy auto_resume <= max_acceptable <= pause_above",
                    name
                )));
            }
            if gas.max_wait_hours > MAX_WAIT_HOURS {
                return Err(CoordinatorError::Config(format!(
                    "Chain {} max_wait_hours must be at most {}",
                    name, MAX_WAIT_HOURS
                )));
            }
            if gas.poll_interval_minutes == 0 {
                return Err(CoordinatorError::Config(format!(
                    "Chain {} poll interval must be positive",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Look up an enabled chain by name
    pub fn chain(&self, name: &str) -> CoordinatorResult<&ChainConfig> {
        self.chains
            .get(name)
            .filter(|c| c.enabled)
            .ok_or_else(|| CoordinatorError::UnknownChain {
                chain: name.to_string(),
            })
    }
}

/// Environment variable overriding a chain's RPC endpoint
pub fn rpc_env_var(chain: &str) -> String {
    format!("{}_RPC_URL", chain.to_uppercase().replace('-', "_"))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR_PATTERN.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
