//! Execution plan: the immutable, hashable output of quoting

use crate::instruction::Instruction;
use crate::planner::bridge::BridgeStep;
use crate::planner::resolver::ResourceSource;
use crate::registry::{ChainId, TokenId};

use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Instruction(Instruction),
    Bridge(BridgeStep),
}

/// One step of the linearized plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub kind: NodeKind,
    /// Indices (into the plan's node list) this node must wait for
    pub depends_on: Vec<usize>,
}

impl PlanNode {
    /// Chain the node is dispatched on
    pub fn chain_id(&self) -> ChainId {
        match &self.kind {
            NodeKind::Instruction(instruction) => instruction.chain_id,
            NodeKind::Bridge(step) => step.source_chain,
        }
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, NodeKind::Bridge(_))
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            NodeKind::Instruction(_) => "instruction",
            NodeKind::Bridge(_) => "bridge",
        }
    }

    fn to_token(&self) -> Token {
        let payload = match &self.kind {
            NodeKind::Instruction(instruction) => {
                let requirement = match &instruction.requires {
                    Some(r) => Token::Tuple(vec![
                        Token::String(r.token.to_string()),
                        Token::Uint(r.min_amount),
                        Token::String(r.from.clone().unwrap_or_default()),
                    ]),
                    None => Token::Tuple(vec![
                        Token::String(String::new()),
                        Token::Uint(U256::zero()),
                        Token::String(String::new()),
                    ]),
                };
                Token::Tuple(vec![
                    Token::Uint(U256::from(instruction.chain_id)),
                    Token::Array(
                        instruction
                            .calls
                            .iter()
                            .map(|c| {
                                Token::Tuple(vec![
                                    Token::Address(c.to),
                                    Token::Bytes(c.data.to_vec()),
                                    Token::Uint(c.gas_limit),
                                    Token::Uint(c.value),
                                ])
                            })
                            .collect(),
                    ),
                    requirement,
                    Token::Array(
                        instruction
                            .produces
                            .iter()
                            .map(|p| {
                                Token::Tuple(vec![
                                    Token::String(p.token.to_string()),
                                    Token::Uint(p.amount),
                                ])
                            })
                            .collect(),
                    ),
                ])
            }
            NodeKind::Bridge(step) => Token::Tuple(vec![
                Token::Uint(U256::from(step.source_chain)),
                Token::Uint(U256::from(step.destination_chain)),
                Token::String(step.token.to_string()),
                Token::Uint(step.amount),
                Token::String(step.route_id.clone()),
                Token::Address(step.recipient),
                Token::String(step.consumer.clone()),
                source_token(&step.producer),
            ]),
        };

        Token::Tuple(vec![
            Token::String(self.id.clone()),
            Token::Uint(U256::from(if self.is_bridge() { 1u8 } else { 0u8 })),
            payload,
            Token::Array(
                self.depends_on
                    .iter()
                    .map(|d| Token::Uint(U256::from(*d)))
                    .collect(),
            ),
        ])
    }
}

fn source_token(source: &ResourceSource) -> Token {
    match source {
        ResourceSource::Instruction { id, chain_id } => Token::Tuple(vec![
            Token::Uint(U256::zero()),
            Token::String(id.clone()),
            Token::Uint(U256::from(*chain_id)),
        ]),
        ResourceSource::Holding { chain_id } => Token::Tuple(vec![
            Token::Uint(U256::one()),
            Token::String(String::new()),
            Token::Uint(U256::from(*chain_id)),
        ]),
    }
}

/// Fee the user commits to when signing the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeInstruction {
    pub chain_id: ChainId,
    pub token: TokenId,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub owner: Address,
    pub nodes: Vec<PlanNode>,
    pub fee: FeeInstruction,
    pub hash: H256,
}

impl ExecutionPlan {
    pub fn new(owner: Address, nodes: Vec<PlanNode>, fee: FeeInstruction) -> Self {
        let hash = compute_hash(owner, &nodes, &fee);
        Self {
            owner,
            nodes,
            fee,
            hash,
        }
    }

    /// Hash recomputed from the plan contents
    pub fn compute_hash(&self) -> H256 {
        compute_hash(self.owner, &self.nodes, &self.fee)
    }

    /// True when the carried hash matches the contents
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }
}

fn compute_hash(owner: Address, nodes: &[PlanNode], fee: &FeeInstruction) -> H256 {
    let encoded = abi::encode(&[
        Token::Address(owner),
        Token::Array(nodes.iter().map(PlanNode::to_token).collect()),
        Token::Tuple(vec![
            Token::Uint(U256::from(fee.chain_id)),
            Token::String(fee.token.to_string()),
            Token::Uint(fee.amount),
        ]),
    ]);

    let mut hasher = Keccak256::new();
    hasher.update(&encoded);
    H256::from_slice(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Call;

    fn plan(fee_amount: u64) -> ExecutionPlan {
        let nodes = vec![
            PlanNode {
                id: "a".into(),
                kind: NodeKind::Instruction(Instruction::new(
                    "a",
                    10,
                    vec![Call::new(Address::repeat_byte(1), vec![0xaa], 21_000)],
                )),
                depends_on: vec![],
            },
            PlanNode {
                id: "b".into(),
                kind: NodeKind::Instruction(Instruction::new(
                    "b",
                    10,
                    vec![Call::new(Address::repeat_byte(2), vec![0xbb], 21_000)],
                )),
                depends_on: vec![0],
            },
        ];
        ExecutionPlan::new(
            Address::repeat_byte(9),
            nodes,
            FeeInstruction {
                chain_id: 10,
                token: TokenId::from("USDC"),
                amount: U256::from(fee_amount),
            },
        )
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(plan(100).hash, plan(100).hash);
        assert!(plan(100).verify_hash());
    }

    #[test]
    fn test_hash_covers_fee_and_nodes() {
        assert_ne!(plan(100).hash, plan(101).hash);

        let mut tampered = plan(100);
        if let NodeKind::Instruction(instruction) = &mut tampered.nodes[1].kind {
            instruction.calls[0].gas_limit = U256::from(30_000u64);
        }
        assert!(!tampered.verify_hash());

        let mut reordered = plan(100);
        reordered.nodes[1].depends_on.clear();
        assert!(!reordered.verify_hash());
    }

    #[test]
    fn test_hash_covers_bridge_producer() {
        let step = BridgeStep {
            source_chain: 10,
            destination_chain: 8453,
            token: TokenId::from("USDC"),
            amount: U256::from(1_000u64),
            route_id: "op-base".into(),
            recipient: Address::repeat_byte(9),
            consumer: "b".into(),
            producer: ResourceSource::Instruction {
                id: "a".into(),
                chain_id: 10,
            },
        };
        let mut bridged = plan(100);
        bridged.nodes.insert(
            1,
            PlanNode {
                id: "bridge-b".into(),
                kind: NodeKind::Bridge(step),
                depends_on: vec![0],
            },
        );
        bridged.nodes[2].depends_on = vec![1];
        let bridged = ExecutionPlan::new(bridged.owner, bridged.nodes, bridged.fee);
        assert!(bridged.verify_hash());

        let mut tampered = bridged.clone();
        if let NodeKind::Bridge(step) = &mut tampered.nodes[1].kind {
            step.producer = ResourceSource::Holding { chain_id: 10 };
        }
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn test_plan_serde_keeps_hash_valid() {
        let original = plan(100);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.verify_hash());
    }
}
