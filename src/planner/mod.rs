//! Planning pipeline: resolve dependencies, plan bridges, build the quote

mod bridge;
mod plan;
mod quote;
mod resolver;

pub use bridge::{BridgePlanner, BridgeStep, PlanSkeleton};
pub use plan::{ExecutionPlan, FeeInstruction, NodeKind, PlanNode};
pub use quote::{
    ChainActions, FeeSpec, FixedGasPrices, GasOracle, NodeCost, PriceTable, Quote, QuoteBuilder,
    QuoteSummary,
};
pub use resolver::{
    BalanceSource, DependencyEdge, DependencyGraph, DependencyResolver, EdgeKind, Holdings,
    ResourceSource,
};

#[cfg(test)]
pub use resolver::MockBalanceSource;

use crate::error::ExecutorResult;
use crate::instruction::InstructionSet;
use crate::metrics;
use crate::registry::ChainRegistry;

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Runs the full quote pipeline against live services
pub struct Planner {
    registry: Arc<ChainRegistry>,
    balances: Arc<dyn BalanceSource>,
    gas: Arc<dyn GasOracle>,
    prices: PriceTable,
}

impl Planner {
    pub fn new(
        registry: Arc<ChainRegistry>,
        balances: Arc<dyn BalanceSource>,
        gas: Arc<dyn GasOracle>,
        prices: PriceTable,
    ) -> Self {
        Self {
            registry,
            balances,
            gas,
            prices,
        }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Resolve, plan and price an instruction set
    pub async fn quote(&self, set: &InstructionSet, fee: &FeeSpec) -> ExecutorResult<Quote> {
        let start = Instant::now();
        let result = self.build(set, fee).await;

        match &result {
            Ok(quote) => {
                info!(
                    "Quoted plan {:?}: {} nodes, fee {} {}",
                    quote.plan.hash,
                    quote.plan.nodes.len(),
                    quote.plan.fee.amount,
                    quote.plan.fee.token
                );
                metrics::record_quote_built(start.elapsed().as_secs_f64());
            }
            Err(e) => {
                warn!("Quote failed for {} instructions: {}", set.len(), e);
                metrics::record_quote_failed(e.kind().as_str());
            }
        }

        result
    }

    async fn build(&self, set: &InstructionSet, fee: &FeeSpec) -> ExecutorResult<Quote> {
        let holdings = Holdings::snapshot(self.balances.as_ref(), &self.registry, set).await?;
        let graph = DependencyResolver::new(&self.registry).resolve(set, &holdings)?;
        let skeleton = BridgePlanner::new(&self.registry).plan(&graph)?;
        QuoteBuilder::new(&self.registry, self.gas.as_ref(), &self.prices)
            .build(skeleton, fee)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use crate::instruction::{Instruction, ResourceAmount, ResourceRequirement};
    use crate::registry::TokenId;
    use crate::testing::{call, prices, registry, usdc, StaticBalances, BASE, OPTIMISM};
    use ethers::types::{Address, U256};

    fn planner(balances: StaticBalances) -> Planner {
        Planner::new(
            Arc::new(registry()),
            Arc::new(balances),
            Arc::new(
                FixedGasPrices::new()
                    .with_price(OPTIMISM, 1_000_000)
                    .with_price(BASE, 1_000_000),
            ),
            prices(),
        )
    }

    fn fee() -> FeeSpec {
        FeeSpec {
            chain_id: OPTIMISM,
            token: TokenId::from("USDC"),
        }
    }

    #[tokio::test]
    async fn test_quote_end_to_end() {
        let set = InstructionSet::new(
            Address::repeat_byte(1),
            vec![
                Instruction::new("A", OPTIMISM, vec![call()]).produces(usdc(1_000_000)),
                Instruction::new("B", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
            ],
        );
        let quote = planner(StaticBalances::new()).quote(&set, &fee()).await.unwrap();
        let ids: Vec<_> = quote.plan.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "bridge-B", "B"]);

        let bridge = quote.plan.node_index("bridge-B").unwrap();
        let consumer = quote.plan.node_index("B").unwrap();
        assert!(quote.plan.nodes[consumer].depends_on.contains(&bridge));
        assert_eq!(quote.plan.node_index("missing"), None);
    }

    #[tokio::test]
    async fn test_same_input_same_hash() {
        let set = InstructionSet::new(
            Address::repeat_byte(1),
            vec![
                Instruction::new("A", OPTIMISM, vec![call()]),
                Instruction::new("B", BASE, vec![call()]),
            ],
        );
        let planner = planner(StaticBalances::new());
        let first = planner.quote(&set, &fee()).await.unwrap();
        let second = planner.quote(&set, &fee()).await.unwrap();
        assert_eq!(first.plan.hash, second.plan.hash);
    }

    #[tokio::test]
    async fn test_oversized_gas_is_out_of_range() {
        let mut heavy = call();
        heavy.gas_limit = U256::MAX;
        let set = InstructionSet::new(
            Address::repeat_byte(1),
            vec![Instruction::new("A", OPTIMISM, vec![heavy])],
        );
        let err = planner(StaticBalances::new()).quote(&set, &fee()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::QuoteOutOfRange(_)));
    }

    #[tokio::test]
    async fn test_large_producers_still_plan() {
        let set = InstructionSet::new(
            Address::repeat_byte(1),
            vec![
                Instruction::new("A", OPTIMISM, vec![call()])
                    .produces(ResourceAmount::new("USDC", U256::MAX)),
                Instruction::new("B", OPTIMISM, vec![call()]).produces(usdc(1)),
                Instruction::new("C", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 1u64)),
            ],
        );
        let quote = planner(StaticBalances::new()).quote(&set, &fee()).await.unwrap();
        assert!(quote.plan.node_index("bridge-C").is_some());
    }

    #[tokio::test]
    async fn test_insufficient_holdings_is_unsatisfiable() {
        let set = InstructionSet::new(
            Address::repeat_byte(1),
            vec![Instruction::new("B", BASE, vec![call()])
                .requires(ResourceRequirement::new("USDC", 300_000u64))],
        );
        let balances = StaticBalances::new().with(OPTIMISM, "USDC", 100_000u64);
        let err = planner(balances).quote(&set, &fee()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnsatisfiableRequirement { .. }));
    }
}
