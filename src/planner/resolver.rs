//! Dependency resolution for instruction sets
//!
//! Turns a declared instruction set plus a snapshot of the owner's holdings
//! into a DAG of dependency edges. Every consumer is matched to exactly one
//! source that covers its full requirement; sources are reserved as they are
//! matched so two consumers never claim the same funds.

use crate::error::{ExecutorError, ExecutorResult};
use crate::instruction::{InstructionSet, ResourceAmount};
use crate::planner::bridge::BRIDGE_NODE_PREFIX;
use crate::registry::{ChainId, ChainRegistry, TokenId};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Balance-query service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn balance_of(
        &self,
        owner: Address,
        chain_id: ChainId,
        token: &TokenId,
    ) -> ExecutorResult<U256>;
}

/// Snapshot of the owner's holdings per (chain, token)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Holdings {
    balances: BTreeMap<(ChainId, TokenId), U256>,
}

impl Holdings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        chain_id: ChainId,
        token: impl Into<TokenId>,
        amount: impl Into<U256>,
    ) -> Self {
        self.set(chain_id, token.into(), amount.into());
        self
    }

    pub fn set(&mut self, chain_id: ChainId, token: TokenId, amount: U256) {
        self.balances.insert((chain_id, token), amount);
    }

    pub fn get(&self, chain_id: ChainId, token: &TokenId) -> U256 {
        self.balances
            .get(&(chain_id, token.clone()))
            .copied()
            .unwrap_or_default()
    }

    pub fn credit(&mut self, chain_id: ChainId, token: &TokenId, amount: U256) {
        let entry = self
            .balances
            .entry((chain_id, token.clone()))
            .or_insert_with(U256::zero);
        // Anything past the top of the range already covers every debit
        *entry = entry.saturating_add(amount);
    }

    /// Debit if covered; returns false and leaves the balance untouched otherwise
    pub fn try_debit(&mut self, chain_id: ChainId, token: &TokenId, amount: U256) -> bool {
        match self.balances.get_mut(&(chain_id, token.clone())) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                true
            }
            _ => amount.is_zero(),
        }
    }

    /// Query every (chain, token) pair the instruction set could draw from
    pub async fn snapshot(
        source: &dyn BalanceSource,
        registry: &ChainRegistry,
        set: &InstructionSet,
    ) -> ExecutorResult<Self> {
        let mut wanted = BTreeSet::new();
        for instruction in &set.instructions {
            if let Some(requirement) = &instruction.requires {
                wanted.insert((instruction.chain_id, requirement.token.clone()));
                for chain_id in registry.chains_with_token(&requirement.token) {
                    wanted.insert((chain_id, requirement.token.clone()));
                }
            }
        }

        let mut holdings = Self::new();
        for (chain_id, token) in wanted {
            let balance = source.balance_of(set.owner, chain_id, &token).await?;
            debug!("Holding of {} on chain {}: {}", token, chain_id, balance);
            holdings.set(chain_id, token, balance);
        }

        Ok(holdings)
    }
}

/// Where a consumed resource comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSource {
    /// Output of another instruction in the set
    Instruction { id: String, chain_id: ChainId },
    /// Funds the owner already holds
    Holding { chain_id: ChainId },
}

impl ResourceSource {
    pub fn chain_id(&self) -> ChainId {
        match self {
            ResourceSource::Instruction { chain_id, .. } => *chain_id,
            ResourceSource::Holding { chain_id } => *chain_id,
        }
    }

    pub fn instruction_id(&self) -> Option<&str> {
        match self {
            ResourceSource::Instruction { id, .. } => Some(id),
            ResourceSource::Holding { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    SameChain,
    CrossChain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub producer: ResourceSource,
    pub consumer: String,
    pub requirement: ResourceAmount,
    pub kind: EdgeKind,
}

/// Resolved instruction graph
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub set: InstructionSet,
    pub edges: Vec<DependencyEdge>,
    /// Holdings the resolution was computed against
    pub holdings: Holdings,
}

impl DependencyGraph {
    pub fn edges_into(&self, consumer: &str) -> impl Iterator<Item = &DependencyEdge> {
        let consumer = consumer.to_string();
        self.edges.iter().filter(move |e| e.consumer == consumer)
    }

    pub fn cross_chain_edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter().filter(|e| e.kind == EdgeKind::CrossChain)
    }
}

pub struct DependencyResolver<'a> {
    registry: &'a ChainRegistry,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(registry: &'a ChainRegistry) -> Self {
        Self { registry }
    }

    /// Build the dependency DAG for an instruction set
    pub fn resolve(
        &self,
        set: &InstructionSet,
        holdings: &Holdings,
    ) -> ExecutorResult<DependencyGraph> {
        self.validate(set)?;

        // Pinned producers alone can already form a cycle; report it as such
        // before amounts come into play.
        let pinned: Vec<(usize, usize)> = set
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(consumer, instruction)| {
                let producer = instruction.requires.as_ref()?.from.as_ref()?;
                set.position(producer).map(|p| (p, consumer))
            })
            .collect();
        check_acyclic(set, &pinned)?;

        let mut outputs: Vec<BTreeMap<TokenId, U256>> = set
            .instructions
            .iter()
            .map(|i| {
                i.produces
                    .iter()
                    .map(|p| i.output_of(&p.token).map(|amount| (p.token.clone(), amount)))
                    .collect::<ExecutorResult<BTreeMap<TokenId, U256>>>()
            })
            .collect::<ExecutorResult<_>>()?;
        let mut available = holdings.clone();
        let mut edges = Vec::new();
        let mut links = Vec::new();

        for (index, consumer) in set.instructions.iter().enumerate() {
            let Some(requirement) = &consumer.requires else {
                continue;
            };
            if requirement.min_amount.is_zero() {
                continue;
            }
            let token = &requirement.token;
            let amount = requirement.min_amount;

            let source = if let Some(pinned) = &requirement.from {
                let producer_index = set.position(pinned).ok_or_else(|| {
                    ExecutorError::InvalidInstructionSet(format!(
                        "instruction {} pins unknown producer {}",
                        consumer.id, pinned
                    ))
                })?;
                let remaining = outputs[producer_index]
                    .get(token)
                    .copied()
                    .ok_or_else(|| {
                        ExecutorError::InvalidInstructionSet(format!(
                            "pinned producer {} does not produce {}",
                            pinned, token
                        ))
                    })?;
                if remaining < amount {
                    return Err(unsatisfiable(
                        consumer.id.as_str(),
                        token,
                        amount,
                        consumer.chain_id,
                    ));
                }
                Some(Source::Producer(producer_index))
            } else if available.get(consumer.chain_id, token) >= amount {
                Some(Source::LocalHolding)
            } else if let Some(producer_index) =
                self.find_prior_producer(set, &outputs, index, token, amount)
            {
                Some(Source::Producer(producer_index))
            } else {
                self.find_remote_holding(&available, consumer.chain_id, token, amount)
                    .map(Source::RemoteHolding)
            };

            let requirement_amount = ResourceAmount {
                token: token.clone(),
                amount,
            };

            match source {
                Some(Source::LocalHolding) => {
                    available.try_debit(consumer.chain_id, token, amount);
                    debug!(
                        "Instruction {} funded from existing {} on chain {}",
                        consumer.id, token, consumer.chain_id
                    );
                }
                Some(Source::Producer(producer_index)) => {
                    if let Some(remaining) = outputs[producer_index].get_mut(token) {
                        *remaining -= amount;
                    }
                    let producer = &set.instructions[producer_index];
                    let kind = if producer.chain_id == consumer.chain_id {
                        EdgeKind::SameChain
                    } else {
                        EdgeKind::CrossChain
                    };
                    links.push((producer_index, index));
                    edges.push(DependencyEdge {
                        producer: ResourceSource::Instruction {
                            id: producer.id.clone(),
                            chain_id: producer.chain_id,
                        },
                        consumer: consumer.id.clone(),
                        requirement: requirement_amount,
                        kind,
                    });
                }
                Some(Source::RemoteHolding(chain_id)) => {
                    available.try_debit(chain_id, token, amount);
                    edges.push(DependencyEdge {
                        producer: ResourceSource::Holding { chain_id },
                        consumer: consumer.id.clone(),
                        requirement: requirement_amount,
                        kind: EdgeKind::CrossChain,
                    });
                }
                None => {
                    return Err(unsatisfiable(
                        consumer.id.as_str(),
                        token,
                        amount,
                        consumer.chain_id,
                    ));
                }
            }
        }

        check_acyclic(set, &links)?;

        debug!(
            "Resolved {} instructions into {} dependency edges",
            set.len(),
            edges.len()
        );

        Ok(DependencyGraph {
            set: set.clone(),
            edges,
            holdings: holdings.clone(),
        })
    }

    fn validate(&self, set: &InstructionSet) -> ExecutorResult<()> {
        if set.is_empty() {
            return Err(ExecutorError::InvalidInstructionSet(
                "instruction set is empty".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for instruction in &set.instructions {
            if instruction.id.trim().is_empty() {
                return Err(ExecutorError::InvalidInstructionSet(
                    "instruction id cannot be empty".to_string(),
                ));
            }
            if !ids.insert(instruction.id.as_str()) {
                return Err(ExecutorError::InvalidInstructionSet(format!(
                    "duplicate instruction id: {}",
                    instruction.id
                )));
            }
            if !self.registry.contains_chain(instruction.chain_id) {
                return Err(ExecutorError::InvalidInstructionSet(format!(
                    "instruction {} targets unknown chain {}",
                    instruction.id, instruction.chain_id
                )));
            }
            if instruction.id.starts_with(BRIDGE_NODE_PREFIX) {
                return Err(ExecutorError::InvalidInstructionSet(format!(
                    "instruction id {} uses the reserved prefix {}",
                    instruction.id, BRIDGE_NODE_PREFIX
                )));
            }
            if instruction.calls.is_empty() {
                return Err(ExecutorError::InvalidInstructionSet(format!(
                    "instruction {} has no calls",
                    instruction.id
                )));
            }
            instruction.total_gas()?;
            if let Some(pinned) = instruction.requires.as_ref().and_then(|r| r.from.as_ref()) {
                if pinned == &instruction.id {
                    return Err(ExecutorError::DependencyCycle {
                        path: vec![pinned.clone(), pinned.clone()],
                    });
                }
            }
        }

        Ok(())
    }

    /// Earlier instruction with enough unclaimed output; same chain first,
    /// then declaration order
    fn find_prior_producer(
        &self,
        set: &InstructionSet,
        outputs: &[BTreeMap<TokenId, U256>],
        consumer_index: usize,
        token: &TokenId,
        amount: U256,
    ) -> Option<usize> {
        let consumer_chain = set.instructions[consumer_index].chain_id;
        let mut candidates: Vec<usize> = (0..consumer_index)
            .filter(|&i| outputs[i].get(token).map(|r| *r >= amount).unwrap_or(false))
            .collect();
        candidates.sort_by_key(|&i| (set.instructions[i].chain_id != consumer_chain, i));
        candidates.first().copied()
    }

    /// Another chain holding enough; chains with a bridge route first, then by id
    fn find_remote_holding(
        &self,
        available: &Holdings,
        consumer_chain: ChainId,
        token: &TokenId,
        amount: U256,
    ) -> Option<ChainId> {
        let mut candidates: Vec<ChainId> = self
            .registry
            .chains_with_token(token)
            .into_iter()
            .filter(|&c| c != consumer_chain && available.get(c, token) >= amount)
            .collect();
        candidates.sort_by_key(|&c| {
            (
                self.registry
                    .select_route(c, consumer_chain, token, amount)
                    .is_none(),
                c,
            )
        });
        candidates.first().copied()
    }
}

enum Source {
    LocalHolding,
    Producer(usize),
    RemoteHolding(ChainId),
}

fn unsatisfiable(
    instruction: &str,
    token: &TokenId,
    amount: U256,
    chain_id: ChainId,
) -> ExecutorError {
    ExecutorError::UnsatisfiableRequirement {
        instruction: instruction.to_string(),
        token: token.to_string(),
        amount: amount.to_string(),
        chain_id,
    }
}

/// Reject the instruction graph if the (producer, consumer) links form a cycle
fn check_acyclic(set: &InstructionSet, links: &[(usize, usize)]) -> ExecutorResult<()> {
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); set.len()];
    for &(producer, consumer) in links {
        adjacency[producer].push(consumer);
    }
    for neighbors in adjacency.iter_mut() {
        neighbors.sort_unstable();
        neighbors.dedup();
    }

    let mut states = vec![None; set.len()];
    let mut stack = Vec::new();
    for node in 0..set.len() {
        if states[node].is_some() {
            continue;
        }
        if let Some(path) = detect_cycle(node, &adjacency, &mut states, &mut stack) {
            return Err(ExecutorError::DependencyCycle {
                path: path
                    .into_iter()
                    .map(|i| set.instructions[i].id.clone())
                    .collect(),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

fn detect_cycle(
    node: usize,
    adjacency: &[Vec<usize>],
    states: &mut [Option<VisitState>],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    states[node] = Some(VisitState::Visiting);
    stack.push(node);

    for &neighbor in &adjacency[node] {
        match states[neighbor] {
            Some(VisitState::Visiting) => {
                let start = stack.iter().position(|&n| n == neighbor).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(neighbor);
                return Some(cycle);
            }
            Some(VisitState::Visited) => {}
            None => {
                if let Some(path) = detect_cycle(neighbor, adjacency, states, stack) {
                    return Some(path);
                }
            }
        }
    }

    stack.pop();
    states[node] = Some(VisitState::Visited);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, ResourceRequirement};
    use crate::testing::{call, registry, usdc, BASE, OPTIMISM, ARBITRUM};

    #[test]
    fn test_no_dependencies_no_edges() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()]),
                Instruction::new("b", BASE, vec![call()]),
            ],
        );
        let graph = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new())
            .unwrap();
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn test_cross_chain_edge_from_prior_producer() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()]).produces(usdc(1_000_000)),
                Instruction::new("b", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
            ],
        );
        let graph = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new())
            .unwrap();

        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.cross_chain_edges().count(), 1);
        assert_eq!(graph.edges_into("a").count(), 0);
        let edge = graph.edges_into("b").next().unwrap();
        assert_eq!(edge.kind, EdgeKind::CrossChain);
        assert_eq!(edge.producer.instruction_id(), Some("a"));
        assert_eq!(edge.producer.chain_id(), OPTIMISM);
        assert_eq!(edge.consumer, "b");
        assert_eq!(edge.requirement.amount, U256::from(300_000u64));
    }

    #[test]
    fn test_local_holding_needs_no_edge() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()]).produces(usdc(1_000_000)),
                Instruction::new("b", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
            ],
        );
        let holdings = Holdings::new().with(BASE, "USDC", 500_000u64);
        let graph = DependencyResolver::new(&registry)
            .resolve(&set, &holdings)
            .unwrap();
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn test_same_chain_producer_preferred() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("remote", OPTIMISM, vec![call()]).produces(usdc(1_000_000)),
                Instruction::new("local", BASE, vec![call()]).produces(usdc(1_000_000)),
                Instruction::new("consumer", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
            ],
        );
        let graph = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new())
            .unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].producer.instruction_id(), Some("local"));
        assert_eq!(graph.edges[0].kind, EdgeKind::SameChain);
    }

    #[test]
    fn test_outputs_are_reserved() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()]).produces(usdc(500_000)),
                Instruction::new("b", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
                Instruction::new("c", BASE, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 300_000u64)),
            ],
        );
        let err = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::UnsatisfiableRequirement { ref instruction, .. } if instruction == "c"
        ));
    }

    #[test]
    fn test_remote_holding_prefers_routable_chain() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![Instruction::new("b", BASE, vec![call()])
                .requires(ResourceRequirement::new("USDC", 300_000u64))],
        );
        // Arbitrum has more funds but only Optimism has a route to Base
        let holdings = Holdings::new()
            .with(ARBITRUM, "USDC", 9_000_000u64)
            .with(OPTIMISM, "USDC", 400_000u64);
        let graph = DependencyResolver::new(&registry)
            .resolve(&set, &holdings)
            .unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(
            graph.edges[0].producer,
            ResourceSource::Holding { chain_id: OPTIMISM }
        );
    }

    #[test]
    fn test_unsatisfiable_requirement() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![Instruction::new("b", BASE, vec![call()])
                .requires(ResourceRequirement::new("USDC", 300_000u64))],
        );
        let err = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new().with(OPTIMISM, "USDC", 1u64))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnsatisfiableRequirement { .. }));
        assert!(err.to_string().contains("Unsatisfiable resource requirement"));
    }

    #[test]
    fn test_pinned_cycle_detected() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()])
                    .produces(usdc(1_000_000))
                    .requires(ResourceRequirement::new("USDC", 1u64).from_instruction("b")),
                Instruction::new("b", BASE, vec![call()])
                    .produces(usdc(1_000_000))
                    .requires(ResourceRequirement::new("USDC", 1u64).from_instruction("a")),
            ],
        );
        let err = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new())
            .unwrap_err();
        match err {
            ExecutorError::DependencyCycle { path } => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_through_searched_producer() {
        let registry = registry();
        // a pins b (later); b finds a as its prior producer
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()])
                    .produces(usdc(1_000_000))
                    .requires(ResourceRequirement::new("USDC", 1u64).from_instruction("b")),
                Instruction::new("b", OPTIMISM, vec![call()])
                    .produces(usdc(1_000_000))
                    .requires(ResourceRequirement::new("USDC", 1u64)),
            ],
        );
        let err = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::DependencyCycle { .. }));
    }

    #[test]
    fn test_pinned_later_producer_is_allowed() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("consumer", OPTIMISM, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 10u64).from_instruction("producer")),
                Instruction::new("producer", OPTIMISM, vec![call()]).produces(usdc(10)),
            ],
        );
        let graph = DependencyResolver::new(&registry)
            .resolve(&set, &Holdings::new())
            .unwrap();
        assert_eq!(graph.edges[0].producer.instruction_id(), Some("producer"));
    }

    #[test]
    fn test_validation_errors() {
        let registry = registry();
        let resolver = DependencyResolver::new(&registry);

        let empty = InstructionSet::new(Address::zero(), vec![]);
        assert!(matches!(
            resolver.resolve(&empty, &Holdings::new()),
            Err(ExecutorError::InvalidInstructionSet(_))
        ));

        let duplicate = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("a", OPTIMISM, vec![call()]),
                Instruction::new("a", BASE, vec![call()]),
            ],
        );
        assert!(resolver.resolve(&duplicate, &Holdings::new()).is_err());

        let unknown_chain = InstructionSet::new(
            Address::zero(),
            vec![Instruction::new("a", 999, vec![call()])],
        );
        assert!(resolver.resolve(&unknown_chain, &Holdings::new()).is_err());

        let no_calls = InstructionSet::new(
            Address::zero(),
            vec![Instruction::new("a", OPTIMISM, vec![])],
        );
        assert!(resolver.resolve(&no_calls, &Holdings::new()).is_err());

        let reserved = InstructionSet::new(
            Address::zero(),
            vec![Instruction::new("bridge-b", OPTIMISM, vec![call()])],
        );
        assert!(matches!(
            resolver.resolve(&reserved, &Holdings::new()),
            Err(ExecutorError::InvalidInstructionSet(_))
        ));
    }

    #[test]
    fn test_overflowing_declarations_are_invalid() {
        let registry = registry();
        let resolver = DependencyResolver::new(&registry);

        let outputs = InstructionSet::new(
            Address::zero(),
            vec![
                Instruction::new("mint", OPTIMISM, vec![call()])
                    .produces(ResourceAmount::new("USDC", U256::MAX))
                    .produces(usdc(1)),
                Instruction::new("spend", OPTIMISM, vec![call()])
                    .requires(ResourceRequirement::new("USDC", 1u64)),
            ],
        );
        assert!(matches!(
            resolver.resolve(&outputs, &Holdings::new()),
            Err(ExecutorError::InvalidInstructionSet(_))
        ));

        let mut heavy = call();
        heavy.gas_limit = U256::MAX;
        let gas = InstructionSet::new(
            Address::zero(),
            vec![Instruction::new("heavy", OPTIMISM, vec![heavy, call()])],
        );
        assert!(matches!(
            resolver.resolve(&gas, &Holdings::new()),
            Err(ExecutorError::InvalidInstructionSet(_))
        ));
    }

    #[test]
    fn test_credit_saturates() {
        let token = TokenId::from("USDC");
        let mut holdings = Holdings::new().with(OPTIMISM, "USDC", U256::MAX);
        holdings.credit(OPTIMISM, &token, U256::one());
        assert_eq!(holdings.get(OPTIMISM, &token), U256::MAX);
        assert!(holdings.try_debit(OPTIMISM, &token, U256::MAX));
    }

    #[tokio::test]
    async fn test_snapshot_queries_every_deployment() {
        let registry = registry();
        let set = InstructionSet::new(
            Address::zero(),
            vec![Instruction::new("b", BASE, vec![call()])
                .requires(ResourceRequirement::new("USDC", 300_000u64))],
        );

        let mut source = MockBalanceSource::new();
        source
            .expect_balance_of()
            .times(3)
            .returning(|_, chain_id, _| Ok(U256::from(chain_id)));

        let holdings = Holdings::snapshot(&source, &registry, &set).await.unwrap();
        assert_eq!(holdings.get(BASE, &TokenId::from("USDC")), U256::from(BASE));
        assert_eq!(holdings.get(OPTIMISM, &TokenId::from("USDC")), U256::from(OPTIMISM));
        assert_eq!(holdings.get(ARBITRUM, &TokenId::from("USDC")), U256::from(ARBITRUM));
    }
}
