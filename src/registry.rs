//! Chain registry: static description of participating chains, tokens and
//! bridge routes
//!
//! Finality models differ per network:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: soft finality from the sequencer, L1 finality later
//! - Avalanche: Instant finality (1 block)
//!
//! The registry is built once at startup and shared read-only across all runs.

use crate::config::Settings;
use crate::error::{ExecutorError, ExecutorResult};

use chrono::Duration as ChronoDuration;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Numeric chain identifier (EIP-155)
pub type ChainId = u64;

/// Logical token identifier, e.g. `USDC`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TokenId {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

/// When a chain's state for an included operation is considered irreversible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinalityPolicy {
    Blocks { confirmations: u64 },
    Time { seconds: u64 },
}

impl FinalityPolicy {
    /// Check the policy against an observed inclusion
    pub fn is_satisfied(&self, confirmations: u64, age: ChronoDuration) -> bool {
        match self {
            FinalityPolicy::Blocks { confirmations: required } => confirmations >= *required,
            FinalityPolicy::Time { seconds } => age.num_seconds() >= *seconds as i64,
        }
    }
}

impl fmt::Display for FinalityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalityPolicy::Blocks { confirmations } => write!(f, "{} blocks", confirmations),
            FinalityPolicy::Time { seconds } => write!(f, "{}s", seconds),
        }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: ChainId) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainDescriptor {
    pub chain_id: ChainId,
    pub name: String,
    pub finality: FinalityPolicy,
    /// Routes whose source is this chain
    pub routes: BTreeSet<String>,
    pub native_symbol: String,
    pub fee_tokens: BTreeSet<TokenId>,
}

impl ChainDescriptor {
    pub fn new(chain_id: ChainId, name: impl Into<String>, finality: FinalityPolicy) -> Self {
        Self {
            chain_id,
            name: name.into(),
            finality,
            routes: BTreeSet::new(),
            native_symbol: "ETH".to_string(),
            fee_tokens: BTreeSet::new(),
        }
    }

    pub fn with_fee_token(mut self, token: impl Into<TokenId>) -> Self {
        self.fee_tokens.insert(token.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeRoute {
    pub id: String,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub tokens: BTreeSet<TokenId>,
    pub base_fee: U256,
    pub fee_bps: u32,
    pub settlement_secs: u64,
    pub contract: Address,
}

impl BridgeRoute {
    /// Route fee for moving `amount`, in bridged-token base units; `None` on overflow
    pub fn fee_for(&self, amount: U256) -> Option<U256> {
        amount
            .checked_mul(U256::from(self.fee_bps))
            .map(|v| v / U256::from(10_000u64))
            .and_then(|v| self.base_fee.checked_add(v))
    }

    pub fn supports(&self, token: &TokenId) -> bool {
        self.tokens.contains(token)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub symbol: TokenId,
    pub decimals: u8,
    pub deployments: BTreeMap<ChainId, Address>,
}

/// Read-only registry of chains, tokens and bridge routes
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<ChainId, ChainDescriptor>,
    routes: BTreeMap<String, BridgeRoute>,
    tokens: BTreeMap<TokenId, TokenInfo>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration
    pub fn from_settings(settings: &Settings) -> ExecutorResult<Self> {
        let mut registry = Self::new();

        for (_, chain) in settings.enabled_chains() {
            let finality = match (chain.confirmation_blocks, chain.finality_secs) {
                (Some(confirmations), _) => FinalityPolicy::Blocks { confirmations },
                (None, Some(seconds)) => FinalityPolicy::Time { seconds },
                (None, None) => FinalityPolicy::Blocks {
                    confirmations: recommended_confirmations(chain.chain_id),
                },
            };
            let mut descriptor = ChainDescriptor::new(chain.chain_id, &chain.name, finality);
            descriptor.native_symbol = chain.native_symbol.clone();
            descriptor.fee_tokens = chain.fee_tokens.iter().map(|t| TokenId::new(t)).collect();
            registry = registry.with_chain(descriptor);
        }

        for (symbol, token) in &settings.tokens {
            let mut deployments = BTreeMap::new();
            for deployment in &token.deployments {
                deployments.insert(deployment.chain_id, parse_address(&deployment.address)?);
            }
            registry = registry.with_token(TokenInfo {
                symbol: TokenId::new(symbol),
                decimals: token.decimals,
                deployments,
            });
        }

        for route in settings.bridges.iter().filter(|r| r.enabled) {
            registry = registry.with_route(BridgeRoute {
                id: route.id.clone(),
                source_chain: route.source_chain,
                destination_chain: route.destination_chain,
                tokens: route.tokens.iter().map(|t| TokenId::new(t)).collect(),
                base_fee: U256::from(route.base_fee),
                fee_bps: route.fee_bps,
                settlement_secs: route.settlement_secs,
                contract: parse_address(&route.contract)?,
            });
        }

        Ok(registry)
    }

    pub fn with_chain(mut self, mut descriptor: ChainDescriptor) -> Self {
        descriptor.routes.extend(
            self.routes
                .values()
                .filter(|r| r.source_chain == descriptor.chain_id)
                .map(|r| r.id.clone()),
        );
        self.chains.insert(descriptor.chain_id, descriptor);
        self
    }

    pub fn with_token(mut self, token: TokenInfo) -> Self {
        self.tokens.insert(token.symbol.clone(), token);
        self
    }

    pub fn with_route(mut self, route: BridgeRoute) -> Self {
        if let Some(chain) = self.chains.get_mut(&route.source_chain) {
            chain.routes.insert(route.id.clone());
        }
        self.routes.insert(route.id.clone(), route);
        self
    }

    pub fn chain(&self, chain_id: ChainId) -> ExecutorResult<&ChainDescriptor> {
        self.chains
            .get(&chain_id)
            .ok_or(ExecutorError::ChainNotFound { chain_id })
    }

    pub fn contains_chain(&self, chain_id: ChainId) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainDescriptor> {
        self.chains.values()
    }

    pub fn route(&self, route_id: &str) -> Option<&BridgeRoute> {
        self.routes.get(route_id)
    }

    pub fn routes(&self) -> impl Iterator<Item = &BridgeRoute> {
        self.routes.values()
    }

    /// All routes moving `token` from `from` to `to`
    pub fn routes_between(&self, from: ChainId, to: ChainId, token: &TokenId) -> Vec<&BridgeRoute> {
        self.chains
            .get(&from)
            .map(|chain| {
                chain
                    .routes
                    .iter()
                    .filter_map(|id| self.routes.get(id))
                    .filter(|r| r.destination_chain == to && r.supports(token))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cheapest route for the transfer; ties broken by route id
    pub fn select_route(
        &self,
        from: ChainId,
        to: ChainId,
        token: &TokenId,
        amount: U256,
    ) -> Option<&BridgeRoute> {
        self.routes_between(from, to, token)
            .into_iter()
            .filter(|r| r.fee_for(amount).is_some())
            .min_by(|a, b| {
                a.fee_for(amount)
                    .cmp(&b.fee_for(amount))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    pub fn token(&self, token: &TokenId) -> Option<&TokenInfo> {
        self.tokens.get(token)
    }

    pub fn token_address(&self, chain_id: ChainId, token: &TokenId) -> Option<Address> {
        self.tokens
            .get(token)
            .and_then(|t| t.deployments.get(&chain_id).copied())
    }

    /// Chains where `token` is deployed, ascending by chain id
    pub fn chains_with_token(&self, token: &TokenId) -> Vec<ChainId> {
        self.tokens
            .get(token)
            .map(|t| {
                t.deployments
                    .keys()
                    .copied()
                    .filter(|id| self.chains.contains_key(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Decimals for a token or native asset symbol (natives default to 18)
    pub fn decimals(&self, symbol: &str) -> u8 {
        self.tokens
            .get(&TokenId::new(symbol))
            .map(|t| t.decimals)
            .unwrap_or(18)
    }

    pub fn accepts_fee_token(&self, chain_id: ChainId, token: &TokenId) -> bool {
        self.chains
            .get(&chain_id)
            .map(|c| c.fee_tokens.contains(token))
            .unwrap_or(false)
    }
}

fn parse_address(value: &str) -> ExecutorResult<Address> {
    Address::from_str(value)
        .map_err(|e| ExecutorError::Config(format!("Invalid address {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, base_fee: u64, fee_bps: u32) -> BridgeRoute {
        BridgeRoute {
            id: id.to_string(),
            source_chain: 10,
            destination_chain: 8453,
            tokens: [TokenId::from("USDC")].into_iter().collect(),
            base_fee: U256::from(base_fee),
            fee_bps,
            settlement_secs: 60,
            contract: Address::zero(),
        }
    }

    fn one_block() -> FinalityPolicy {
        FinalityPolicy::Blocks { confirmations: 1 }
    }

    #[test]
    fn test_select_cheapest_route() {
        let registry = ChainRegistry::new()
            .with_chain(ChainDescriptor::new(10, "Optimism", one_block()))
            .with_chain(ChainDescriptor::new(8453, "Base", one_block()))
            .with_route(route("b-route", 100, 0))
            .with_route(route("a-route", 0, 10));

        let usdc = TokenId::from("USDC");
        // 10 bps of 1_000_000 = 1000 > 100
        let chosen = registry
            .select_route(10, 8453, &usdc, U256::from(1_000_000u64))
            .unwrap();
        assert_eq!(chosen.id, "b-route");

        // 10 bps of 50_000 = 50 < 100
        let chosen = registry
            .select_route(10, 8453, &usdc, U256::from(50_000u64))
            .unwrap();
        assert_eq!(chosen.id, "a-route");

        // a-route's percentage fee overflows on the full range
        assert_eq!(registry.route("a-route").unwrap().fee_for(U256::MAX), None);
        let chosen = registry.select_route(10, 8453, &usdc, U256::MAX).unwrap();
        assert_eq!(chosen.id, "b-route");

        assert!(registry.select_route(8453, 10, &usdc, U256::one()).is_none());
        assert!(registry
            .select_route(10, 8453, &TokenId::from("DAI"), U256::one())
            .is_none());
    }

    #[test]
    fn test_route_registered_before_chain() {
        let registry = ChainRegistry::new()
            .with_route(route("r", 0, 0))
            .with_chain(ChainDescriptor::new(10, "Optimism", one_block()));
        assert!(registry.chain(10).unwrap().routes.contains("r"));
    }

    #[test]
    fn test_finality_policy() {
        let blocks = FinalityPolicy::Blocks { confirmations: 12 };
        assert!(!blocks.is_satisfied(11, ChronoDuration::hours(1)));
        assert!(blocks.is_satisfied(12, ChronoDuration::zero()));

        let time = FinalityPolicy::Time { seconds: 60 };
        assert!(!time.is_satisfied(1000, ChronoDuration::seconds(59)));
        assert!(time.is_satisfied(0, ChronoDuration::seconds(60)));
    }

    #[test]
    fn test_from_settings() {
        let settings = Settings::from_toml_str(crate::config::SAMPLE_CONFIG).unwrap();
        let registry = ChainRegistry::from_settings(&settings).unwrap();

        assert_eq!(
            registry.chain(10).unwrap().finality,
            FinalityPolicy::Blocks { confirmations: 64 }
        );
        assert_eq!(
            registry.chain(8453).unwrap().finality,
            FinalityPolicy::Time { seconds: 120 }
        );
        assert!(registry.chain(10).unwrap().routes.contains("across-op-base"));
        assert!(registry.accepts_fee_token(10, &TokenId::from("USDC")));
        assert!(!registry.accepts_fee_token(8453, &TokenId::from("USDC")));
        assert_eq!(registry.chains_with_token(&TokenId::from("USDC")), vec![10, 8453]);
        assert_eq!(registry.decimals("USDC"), 6);
        assert_eq!(registry.decimals("ETH"), 18);
    }
}
