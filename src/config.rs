//! Configuration management for the Supertransaction executor
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub executor: ExecutorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub tokens: HashMap<String, TokenConfig>,
    #[serde(default)]
    pub bridges: Vec<BridgeRouteConfig>,
    #[serde(default)]
    pub fees: FeesConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    pub max_concurrent_nodes: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
    /// Deadline for a dispatched instruction to reach finality
    pub finality_timeout_secs: u64,
    /// Deadline for a bridge transfer to settle
    pub bridge_timeout_secs: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// How long settled runs stay queryable in memory after archiving
    #[serde(default = "default_run_retention_secs")]
    pub run_retention_secs: u64,
}

fn default_run_retention_secs() -> u64 {
    3600
}

/// What the coordinator does with the rest of a run once a node fails
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop submitting any new node; in-flight nodes are still tracked to the end
    #[default]
    Halt,
    /// Keep submitting nodes with no path from a failed node
    ContinueIndependent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Block-confirmation finality; takes precedence over `finality_secs`
    pub confirmation_blocks: Option<u64>,
    /// Time-based finality, measured from the inclusion block's timestamp
    pub finality_secs: Option<u64>,
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
    /// Tokens accepted for fee payment on this chain
    #[serde(default)]
    pub fee_tokens: Vec<String>,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub enabled: bool,
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub decimals: u8,
    #[serde(default)]
    pub deployments: Vec<TokenDeployment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenDeployment {
    pub chain_id: u64,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeRouteConfig {
    pub id: String,
    pub source_chain: u64,
    pub destination_chain: u64,
    pub tokens: Vec<String>,
    /// Flat fee in bridged-token base units
    #[serde(default)]
    pub base_fee: u64,
    /// Proportional fee in basis points of the bridged amount
    #[serde(default)]
    pub fee_bps: u32,
    pub settlement_secs: u64,
    /// Bridge contract on the source chain
    pub contract: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeesConfig {
    /// Asset symbol -> price in micro-USD for one whole unit
    #[serde(default)]
    pub usd_micros: HashMap<String, u64>,
    /// Static gas prices (wei) used when live estimation is disabled
    #[serde(default)]
    pub fixed_gas_price_wei: HashMap<String, u64>,
    #[serde(default)]
    pub live_gas_prices: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub keystore_path: Option<String>,
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

fn default_private_key_env() -> String {
    "EXECUTOR_PRIVATE_KEY".to_string()
}

impl Settings {
    /// Load settings from the file named by `SUPERTX_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("SUPERTX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    /// Load settings from a specific file
    pub fn from_path(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut chain_ids = HashSet::new();
        for (name, chain) in &self.chains {
            if !chain_ids.insert(chain.chain_id) {
                anyhow::bail!("Chain id {} configured more than once", chain.chain_id);
            }
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.confirmation_blocks.is_none() && chain.finality_secs.is_none() {
                    tracing::warn!(
                        "Chain {} has no finality policy - using recommended confirmations",
                        name
                    );
                }
                for token in &chain.fee_tokens {
                    if !self.tokens.contains_key(token) {
                        anyhow::bail!("Chain {} accepts unknown fee token {}", name, token);
                    }
                }
            }
        }

        if self.executor.max_concurrent_nodes == 0 {
            anyhow::bail!("executor.max_concurrent_nodes must be at least 1");
        }

        let mut route_ids = HashSet::new();
        for route in &self.bridges {
            if !route_ids.insert(route.id.as_str()) {
                anyhow::bail!("Bridge route {} configured more than once", route.id);
            }
            if route.source_chain == route.destination_chain {
                anyhow::bail!("Bridge route {} has identical source and destination", route.id);
            }
            for chain_id in [route.source_chain, route.destination_chain] {
                if self.get_chain_by_id(chain_id).is_none() {
                    anyhow::bail!(
                        "Bridge route {} references unknown chain {}",
                        route.id,
                        chain_id
                    );
                }
            }
            for token in &route.tokens {
                if !self.tokens.contains_key(token) {
                    anyhow::bail!("Bridge route {} references unknown token {}", route.id, token);
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
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

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[executor]
instance_id = "executor-1"
poll_interval_ms = 500
max_concurrent_nodes = 8
max_retries = 3
retry_delay_ms = 250
health_check_interval_secs = 30
finality_timeout_secs = 600
bridge_timeout_secs = 1800
failure_policy = "continue_independent"

[database]
url = "postgres://localhost/supertx"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chains.optimism]
chain_id = 10
name = "Optimism"
rpc_urls = ["https://mainnet.optimism.io"]
confirmation_blocks = 64
fee_tokens = ["USDC"]
gas_price_strategy = "optimism"
max_gas_price_gwei = 5
enabled = true

[chains.base]
chain_id = 8453
name = "Base"
rpc_urls = ["https://mainnet.base.org"]
finality_secs = 120
gas_price_strategy = "eip1559"
max_gas_price_gwei = 5
enabled = true

[tokens.USDC]
decimals = 6
deployments = [
    { chain_id = 10, address = "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85" },
    { chain_id = 8453, address = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913" },
]

[[bridges]]
id = "across-op-base"
source_chain = 10
destination_chain = 8453
tokens = ["USDC"]
base_fee = 1000
fee_bps = 5
settlement_secs = 60
contract = "0x6f26Bf09B1C792e3228e5467807a900A503c0281"

[fees.usd_micros]
ETH = 3000000000
USDC = 1000000

[wallet]
private_key_env = "EXECUTOR_PRIVATE_KEY"
"#;
