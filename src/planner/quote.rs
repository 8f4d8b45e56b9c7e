//! Quote building: costs every plan node in the user's chosen fee token and
//! seals the plan with its content hash

use crate::config::Settings;
use crate::error::{ExecutorError, ExecutorResult};
use crate::planner::bridge::PlanSkeleton;
use crate::planner::plan::{ExecutionPlan, FeeInstruction, NodeKind};
use crate::registry::{ChainId, ChainRegistry, TokenId};

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Chain and token the user pays the execution fee with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSpec {
    pub chain_id: ChainId,
    pub token: TokenId,
}

/// Source of per-chain gas prices (wei)
#[async_trait]
pub trait GasOracle: Send + Sync {
    async fn gas_price(&self, chain_id: ChainId) -> ExecutorResult<U256>;
}

/// Static gas prices from configuration
#[derive(Debug, Clone, Default)]
pub struct FixedGasPrices {
    prices: HashMap<ChainId, U256>,
}

impl FixedGasPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, chain_id: ChainId, wei: u64) -> Self {
        self.prices.insert(chain_id, U256::from(wei));
        self
    }

    /// Keys may be a chain id or a configured chain name
    pub fn from_settings(settings: &Settings) -> ExecutorResult<Self> {
        let mut prices = HashMap::new();
        for (key, wei) in &settings.fees.fixed_gas_price_wei {
            let chain_id = match key.parse::<ChainId>() {
                Ok(id) => id,
                Err(_) => settings
                    .chains
                    .get(key)
                    .map(|c| c.chain_id)
                    .ok_or_else(|| {
                        ExecutorError::Config(format!("gas price for unknown chain {}", key))
                    })?,
            };
            prices.insert(chain_id, U256::from(*wei));
        }
        Ok(Self { prices })
    }
}

#[async_trait]
impl GasOracle for FixedGasPrices {
    async fn gas_price(&self, chain_id: ChainId) -> ExecutorResult<U256> {
        self.prices
            .get(&chain_id)
            .copied()
            .ok_or_else(|| {
                ExecutorError::GasEstimation(format!("no gas price for chain {}", chain_id))
            })
    }
}

/// Asset prices in micro-USD per whole unit
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    usd_micros: HashMap<String, u64>,
}

impl PriceTable {
    pub fn new(usd_micros: HashMap<String, u64>) -> Self {
        Self { usd_micros }
    }

    pub fn with_price(mut self, symbol: &str, usd_micros: u64) -> Self {
        self.usd_micros.insert(symbol.to_string(), usd_micros);
        self
    }

    fn price(&self, symbol: &str) -> ExecutorResult<U256> {
        match self.usd_micros.get(symbol) {
            Some(price) if *price > 0 => Ok(U256::from(*price)),
            _ => Err(ExecutorError::MissingPrice(symbol.to_string())),
        }
    }

    /// Convert base units of `from` into base units of `to`, rounding up
    pub fn convert(
        &self,
        amount: U256,
        from: &str,
        to: &str,
        registry: &ChainRegistry,
    ) -> ExecutorResult<U256> {
        if from == to || amount.is_zero() {
            return Ok(amount);
        }

        let out_of_range =
            || ExecutorError::QuoteOutOfRange(format!("converting {} {} to {}", amount, from, to));

        let scale_to = scale(registry.decimals(to)).ok_or_else(out_of_range)?;
        let scale_from = scale(registry.decimals(from)).ok_or_else(out_of_range)?;

        let numerator = amount
            .checked_mul(self.price(from)?)
            .and_then(|v| v.checked_mul(scale_to))
            .ok_or_else(out_of_range)?;
        let denominator = self
            .price(to)?
            .checked_mul(scale_from)
            .ok_or_else(out_of_range)?;

        let (quotient, remainder) = numerator.div_mod(denominator);
        if remainder.is_zero() {
            Ok(quotient)
        } else {
            Ok(quotient + U256::one())
        }
    }
}

fn scale(decimals: u8) -> Option<U256> {
    U256::from(10u64).checked_pow(U256::from(decimals))
}

/// Cost of a single plan node
#[derive(Debug, Clone, Serialize)]
pub struct NodeCost {
    pub node: String,
    pub chain_id: ChainId,
    /// Gas cost in native wei, or bridge fee in bridged-token units
    pub raw_cost: U256,
    pub raw_symbol: String,
    pub fee_token_cost: U256,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainActions {
    pub chain_id: ChainId,
    pub name: String,
    pub actions: Vec<String>,
}

/// Human-reviewable description of what the user is about to sign
#[derive(Debug, Clone, Serialize)]
pub struct QuoteSummary {
    pub chains: Vec<ChainActions>,
    pub fee: String,
}

impl fmt::Display for QuoteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chain in &self.chains {
            writeln!(f, "{} ({}):", chain.name, chain.chain_id)?;
            for action in &chain.actions {
                writeln!(f, "  - {}", action)?;
            }
        }
        write!(f, "fee: {}", self.fee)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub plan: ExecutionPlan,
    pub costs: Vec<NodeCost>,
    pub summary: QuoteSummary,
}

pub struct QuoteBuilder<'a> {
    registry: &'a ChainRegistry,
    gas: &'a dyn GasOracle,
    prices: &'a PriceTable,
}

impl<'a> QuoteBuilder<'a> {
    pub fn new(
        registry: &'a ChainRegistry,
        gas: &'a dyn GasOracle,
        prices: &'a PriceTable,
    ) -> Self {
        Self {
            registry,
            gas,
            prices,
        }
    }

    pub async fn build(&self, skeleton: PlanSkeleton, fee: &FeeSpec) -> ExecutorResult<Quote> {
        self.registry.chain(fee.chain_id)?;
        if !self.registry.accepts_fee_token(fee.chain_id, &fee.token) {
            return Err(ExecutorError::UnsupportedFeeToken {
                chain_id: fee.chain_id,
                token: fee.token.to_string(),
            });
        }

        let mut gas_prices: BTreeMap<ChainId, U256> = BTreeMap::new();
        let mut costs = Vec::with_capacity(skeleton.nodes.len());
        let mut actions: BTreeMap<ChainId, Vec<String>> = BTreeMap::new();
        let mut total = U256::zero();

        for node in &skeleton.nodes {
            let (raw_cost, raw_symbol, action) = match &node.kind {
                NodeKind::Instruction(instruction) => {
                    let chain = self.registry.chain(instruction.chain_id)?;
                    let gas_price = match gas_prices.get(&instruction.chain_id) {
                        Some(price) => *price,
                        None => {
                            let price = self.gas.gas_price(instruction.chain_id).await?;
                            gas_prices.insert(instruction.chain_id, price);
                            price
                        }
                    };
                    let gas = instruction.total_gas()?;
                    let cost = gas.checked_mul(gas_price).ok_or_else(|| {
                        ExecutorError::QuoteOutOfRange(format!(
                            "gas cost of {} on chain {}",
                            instruction.id, instruction.chain_id
                        ))
                    })?;
                    (
                        cost,
                        chain.native_symbol.clone(),
                        format!(
                            "execute {} ({} calls, {} gas)",
                            instruction.id,
                            instruction.calls.len(),
                            gas
                        ),
                    )
                }
                NodeKind::Bridge(step) => {
                    let route = self.registry.route(&step.route_id).ok_or_else(|| {
                        ExecutorError::NoBridgeRoute {
                            from: step.source_chain,
                            to: step.destination_chain,
                            token: step.token.to_string(),
                        }
                    })?;
                    let destination = self.registry.chain(step.destination_chain)?;
                    let bridge_fee = route.fee_for(step.amount).ok_or_else(|| {
                        ExecutorError::QuoteOutOfRange(format!(
                            "bridge fee of {} {} via {}",
                            step.amount, step.token, route.id
                        ))
                    })?;
                    (
                        bridge_fee,
                        step.token.to_string(),
                        format!(
                            "bridge {} {} to {} via {} for {}",
                            step.amount, step.token, destination.name, route.id, step.consumer
                        ),
                    )
                }
            };

            let fee_token_cost =
                self.prices
                    .convert(raw_cost, &raw_symbol, fee.token.as_str(), self.registry)?;
            total = total.checked_add(fee_token_cost).ok_or_else(|| {
                ExecutorError::QuoteOutOfRange(format!("total fee in {}", fee.token))
            })?;

            debug!(
                "Node {} costs {} {} ({} {})",
                node.id, raw_cost, raw_symbol, fee_token_cost, fee.token
            );

            actions.entry(node.chain_id()).or_default().push(action);
            costs.push(NodeCost {
                node: node.id.clone(),
                chain_id: node.chain_id(),
                raw_cost,
                raw_symbol,
                fee_token_cost,
            });
        }

        let fee_instruction = FeeInstruction {
            chain_id: fee.chain_id,
            token: fee.token.clone(),
            amount: total,
        };

        let chains = actions
            .into_iter()
            .map(|(chain_id, actions)| ChainActions {
                chain_id,
                name: self
                    .registry
                    .chain(chain_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|_| chain_id.to_string()),
                actions,
            })
            .collect();
        let summary = QuoteSummary {
            chains,
            fee: format!("{} {} on chain {}", total, fee.token, fee.chain_id),
        };

        let plan = ExecutionPlan::new(skeleton.owner, skeleton.nodes, fee_instruction);

        Ok(Quote {
            plan,
            costs,
            summary,
        })
    }
}
