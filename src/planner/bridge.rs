//! Bridge planning and linearization
//!
//! Every cross-chain dependency edge becomes a bridge step on a registered
//! route. Instructions and bridge steps are then ordered with a deterministic
//! Kahn sort: instructions keep declaration order, a bridge step sits right
//! after its producer (or right before its consumer when it moves existing
//! holdings). A ledger walk over the final order checks that no step spends
//! more than the plan has delivered to its chain at that point.

use crate::error::{ExecutorError, ExecutorResult};
use crate::planner::plan::{NodeKind, PlanNode};
use crate::planner::resolver::{DependencyGraph, EdgeKind, Holdings, ResourceSource};
use crate::registry::{ChainId, ChainRegistry, TokenId};

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Id prefix of synthesized bridge nodes; instruction ids may not use it
pub const BRIDGE_NODE_PREFIX: &str = "bridge-";

/// A synthesized cross-chain transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStep {
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub token: TokenId,
    pub amount: U256,
    pub route_id: String,
    pub recipient: Address,
    /// Instruction this transfer funds
    pub consumer: String,
    pub producer: ResourceSource,
}

/// Linearized plan before fees are attached
#[derive(Debug, Clone)]
pub struct PlanSkeleton {
    pub owner: Address,
    pub nodes: Vec<PlanNode>,
}

pub struct BridgePlanner<'a> {
    registry: &'a ChainRegistry,
}

/// Sort key: (anchor instruction, rank, consumer)
type OrderKey = (usize, u8, usize);

struct Draft {
    id: String,
    kind: NodeKind,
    key: OrderKey,
    depends_on: BTreeSet<usize>,
}

impl<'a> BridgePlanner<'a> {
    pub fn new(registry: &'a ChainRegistry) -> Self {
        Self { registry }
    }

    pub fn plan(&self, graph: &DependencyGraph) -> ExecutorResult<PlanSkeleton> {
        let set = &graph.set;

        let mut drafts: Vec<Draft> = set
            .instructions
            .iter()
            .enumerate()
            .map(|(i, instruction)| Draft {
                id: instruction.id.clone(),
                kind: NodeKind::Instruction(instruction.clone()),
                key: (i, 1, 0),
                depends_on: BTreeSet::new(),
            })
            .collect();

        for edge in &graph.edges {
            let consumer = set.position(&edge.consumer).ok_or_else(|| {
                ExecutorError::Internal(format!("edge to unknown consumer {}", edge.consumer))
            })?;
            let producer = edge
                .producer
                .instruction_id()
                .and_then(|id| set.position(id));

            match edge.kind {
                EdgeKind::SameChain => {
                    if let Some(producer) = producer {
                        drafts[consumer].depends_on.insert(producer);
                    }
                }
                EdgeKind::CrossChain => {
                    let source_chain = edge.producer.chain_id();
                    let destination_chain = set.instructions[consumer].chain_id;
                    let token = &edge.requirement.token;
                    let amount = edge.requirement.amount;

                    let route = self
                        .registry
                        .select_route(source_chain, destination_chain, token, amount)
                        .ok_or_else(|| ExecutorError::NoBridgeRoute {
                            from: source_chain,
                            to: destination_chain,
                            token: token.to_string(),
                        })?;

                    debug!(
                        "Bridging {} {} from chain {} to chain {} via {} for {}",
                        amount, token, source_chain, destination_chain, route.id, edge.consumer
                    );

                    let (key, depends_on) = match producer {
                        Some(p) => ((p, 2, consumer), BTreeSet::from([p])),
                        None => ((consumer, 0, 0), BTreeSet::new()),
                    };
                    let bridge_index = drafts.len();
                    drafts.push(Draft {
                        id: format!("{}{}", BRIDGE_NODE_PREFIX, edge.consumer),
                        kind: NodeKind::Bridge(BridgeStep {
                            source_chain,
                            destination_chain,
                            token: token.clone(),
                            amount,
                            route_id: route.id.clone(),
                            recipient: set.owner,
                            consumer: edge.consumer.clone(),
                            producer: edge.producer.clone(),
                        }),
                        key,
                        depends_on,
                    });
                    drafts[consumer].depends_on.insert(bridge_index);
                }
            }
        }

        let order = linearize(&drafts)?;
        let mut position = vec![0usize; drafts.len()];
        for (linear, &draft) in order.iter().enumerate() {
            position[draft] = linear;
        }

        let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
        let mut nodes = Vec::with_capacity(order.len());
        for &draft_index in &order {
            let draft = slots[draft_index].take().ok_or_else(|| {
                ExecutorError::Internal(format!("node {} ordered twice", draft_index))
            })?;
            let mut depends_on: Vec<usize> =
                draft.depends_on.iter().map(|d| position[*d]).collect();
            depends_on.sort_unstable();
            nodes.push(PlanNode {
                id: draft.id,
                kind: draft.kind,
                depends_on,
            });
        }

        verify_funding(&nodes, &graph.holdings)?;

        Ok(PlanSkeleton {
            owner: set.owner,
            nodes,
        })
    }
}

/// Kahn sort with the smallest ready key first
fn linearize(drafts: &[Draft]) -> ExecutorResult<Vec<usize>> {
    let mut in_degree: Vec<usize> = drafts.iter().map(|d| d.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); drafts.len()];
    for (index, draft) in drafts.iter().enumerate() {
        for &dependency in &draft.depends_on {
            dependents[dependency].push(index);
        }
    }

    let mut ready: BTreeSet<(OrderKey, usize)> = drafts
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] == 0)
        .map(|(i, d)| (d.key, i))
        .collect();

    let mut order = Vec::with_capacity(drafts.len());
    while let Some(next) = ready.pop_first() {
        let (_, index) = next;
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert((drafts[dependent].key, dependent));
            }
        }
    }

    if order.len() != drafts.len() {
        let path = drafts
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, d)| d.id.clone())
            .collect();
        return Err(ExecutorError::DependencyCycle { path });
    }

    Ok(order)
}

/// Walk the order, crediting outputs and debiting inputs per chain
fn verify_funding(nodes: &[PlanNode], holdings: &Holdings) -> ExecutorResult<()> {
    let mut ledger = holdings.clone();

    for node in nodes {
        match &node.kind {
            NodeKind::Instruction(instruction) => {
                if let Some(requirement) = &instruction.requires {
                    if !ledger.try_debit(
                        instruction.chain_id,
                        &requirement.token,
                        requirement.min_amount,
                    ) {
                        return Err(ExecutorError::FundingInvariant(format!(
                            "instruction {} needs {} {} on chain {} before it is available",
                            instruction.id,
                            requirement.min_amount,
                            requirement.token,
                            instruction.chain_id
                        )));
                    }
                }
                for output in &instruction.produces {
                    ledger.credit(instruction.chain_id, &output.token, output.amount);
                }
            }
            NodeKind::Bridge(step) => {
                if !ledger.try_debit(step.source_chain, &step.token, step.amount) {
                    return Err(ExecutorError::FundingInvariant(format!(
                        "{} moves {} {} but chain {} does not hold it yet",
                        node.id, step.amount, step.token, step.source_chain
                    )));
                }
                ledger.credit(step.destination_chain, &step.token, step.amount);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, InstructionSet, ResourceRequirement};
    use crate::planner::resolver::DependencyResolver;
    use crate::testing::{call, registry, usdc, ARBITRUM, BASE, OPTIMISM};

    fn plan(set: &InstructionSet, holdings: &Holdings) -> ExecutorResult<PlanSkeleton> {
        let registry = registry();
        let graph = DependencyResolver::new(&registry).resolve(set, holdings)?;
        BridgePlanner::new(&registry).plan(&graph)
    }

    fn ids(skeleton: &PlanSkeleton) -> Vec<&str> {
        skeleton.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_independent_instructions_keep_declaration_order() {
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("c", BASE, vec![call()]),
                Instruction::new("a", OPTIMISM, vec![call()]),
                Instruction::new("b", BASE, vec![call()]),
            ],
        );
        let skeleton = plan(&set, &Holdings::new()).unwrap();
        assert_eq!(ids(&skeleton), vec!["c", "a", "b"]);
        assert!(skeleton.nodes.iter().all(|n| n.depends_on.is_empty()));
    }

    #[test]
    fn test_optimism_to_base_inserts_bridge() {
        let owner = Address::repeat_byte(7);
        let set = InstructionSet::new(
            owner,
            vec![
                Instruction::new("A", OPTIMISM, vec![call()]).produces(usdc(1_000_000)),
                Instruction::new("B", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
            ],
        );
        let skeleton = plan(&set, &Holdings::new()).unwrap();

        assert_eq!(ids(&skeleton), vec!["A", "bridge-B", "B"]);
        assert_eq!(skeleton.nodes[1].depends_on, vec![0]);
        assert_eq!(skeleton.nodes[2].depends_on, vec![1]);

        match &skeleton.nodes[1].kind {
            NodeKind::Bridge(step) => {
                assert_eq!(step.source_chain, OPTIMISM);
                assert_eq!(step.destination_chain, BASE);
                assert_eq!(step.amount, U256::from(300_000u64));
                assert_eq!(step.route_id, "op-base");
                assert_eq!(step.recipient, owner);
            }
            other => panic!("expected bridge, got {other:?}"),
        }
    }

    #[test]
    fn test_holding_bridge_sits_before_consumer() {
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("first", OPTIMISM, vec![call()]),
                Instruction::new("second", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
            ],
        );
        let holdings = Holdings::new().with(OPTIMISM, "USDC", 300_000u64);
        let skeleton = plan(&set, &holdings).unwrap();
        assert_eq!(ids(&skeleton), vec!["first", "bridge-second", "second"]);
        assert!(skeleton.nodes[1].depends_on.is_empty());
    }

    #[test]
    fn test_pinned_later_producer_moves_consumer_after_it() {
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("consumer", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 10u64).from_instruction("producer")),
                Instruction::new("other", BASE, vec![call()]),
                Instruction::new("producer", OPTIMISM, vec![call()]).produces(usdc(10)),
            ],
        );
        let skeleton = plan(&set, &Holdings::new()).unwrap();
        assert_eq!(
            ids(&skeleton),
            vec!["other", "producer", "bridge-consumer", "consumer"]
        );
    }

    #[test]
    fn test_no_route_fails_before_quoting() {
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", ARBITRUM, vec![call()]).produces(usdc(1_000)),
                Instruction::new("b", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 1_000u64)),
            ],
        );
        let err = plan(&set, &Holdings::new()).unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::NoBridgeRoute { from: ARBITRUM, to: BASE, .. }
        ));
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()]).produces(usdc(500)),
                Instruction::new("b", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 200u64))
                    .produces(usdc(200)),
                Instruction::new("c", OPTIMISM, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 200u64).from_instruction("b")),
                Instruction::new("d", OPTIMISM, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300u64)),
            ],
        );
        let skeleton = plan(&set, &Holdings::new()).unwrap();
        for (index, node) in skeleton.nodes.iter().enumerate() {
            assert!(node.depends_on.iter().all(|d| *d < index), "{}", node.id);
        }
        assert_eq!(
            ids(&skeleton),
            vec!["a", "bridge-b", "b", "bridge-c", "c", "d"]
        );
    }

    #[test]
    fn test_funding_walk_rejects_overdraw() {
        let nodes = vec![PlanNode {
            id: "bridge-x".into(),
            kind: NodeKind::Bridge(BridgeStep {
                source_chain: OPTIMISM,
                destination_chain: BASE,
                token: TokenId::from("USDC"),
                amount: U256::from(10u64),
                route_id: "op-base".into(),
                recipient: Address::zero(),
                consumer: "x".into(),
                producer: ResourceSource::Holding { chain_id: OPTIMISM },
            }),
            depends_on: vec![],
        }];
        let holdings = Holdings::new().with(OPTIMISM, "USDC", 9u64);
        assert!(matches!(
            verify_funding(&nodes, &holdings),
            Err(ExecutorError::FundingInvariant(_))
        ));
    }
}
