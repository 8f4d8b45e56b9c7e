//! User-declared instruction sets
//!
//! An instruction is a batch of calls bound to one chain. It may consume a
//! resource (token amount) that must be available on its chain before it runs,
//! and may declare the resources it makes available once confirmed.

use crate::error::{ExecutorError, ExecutorResult};
use crate::registry::{ChainId, TokenId};

use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// A single contract call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub to: Address,
    #[serde(default)]
    pub data: Bytes,
    pub gas_limit: U256,
    #[serde(default)]
    pub value: U256,
}

impl Call {
    pub fn new(to: Address, data: impl Into<Bytes>, gas_limit: u64) -> Self {
        Self {
            to,
            data: data.into(),
            gas_limit: U256::from(gas_limit),
            value: U256::zero(),
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

/// A token amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub token: TokenId,
    pub amount: U256,
}

impl ResourceAmount {
    pub fn new(token: impl Into<TokenId>, amount: impl Into<U256>) -> Self {
        Self {
            token: token.into(),
            amount: amount.into(),
        }
    }
}

/// Input an instruction needs on its own chain before it can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub token: TokenId,
    pub min_amount: U256,
    /// Pin the producing instruction instead of letting the resolver search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl ResourceRequirement {
    pub fn new(token: impl Into<TokenId>, min_amount: impl Into<U256>) -> Self {
        Self {
            token: token.into(),
            min_amount: min_amount.into(),
            from: None,
        }
    }

    pub fn from_instruction(mut self, producer: impl Into<String>) -> Self {
        self.from = Some(producer.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: String,
    pub chain_id: ChainId,
    pub calls: Vec<Call>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<ResourceRequirement>,
    #[serde(default)]
    pub produces: Vec<ResourceAmount>,
}

impl Instruction {
    pub fn new(id: impl Into<String>, chain_id: ChainId, calls: Vec<Call>) -> Self {
        Self {
            id: id.into(),
            chain_id,
            calls,
            requires: None,
            produces: Vec::new(),
        }
    }

    pub fn requires(mut self, requirement: ResourceRequirement) -> Self {
        self.requires = Some(requirement);
        self
    }

    pub fn produces(mut self, output: ResourceAmount) -> Self {
        self.produces.push(output);
        self
    }

    /// Amount of `token` this instruction declares as output
    pub fn output_of(&self, token: &TokenId) -> ExecutorResult<U256> {
        self.produces
            .iter()
            .filter(|p| &p.token == token)
            .try_fold(U256::zero(), |acc, p| acc.checked_add(p.amount))
            .ok_or_else(|| {
                ExecutorError::InvalidInstructionSet(format!(
                    "instruction {} declares more {} than fits in 256 bits",
                    self.id, token
                ))
            })
    }

    /// Sum of gas limits across all calls
    pub fn total_gas(&self) -> ExecutorResult<U256> {
        self.calls
            .iter()
            .try_fold(U256::zero(), |acc, c| acc.checked_add(c.gas_limit))
            .ok_or_else(|| {
                ExecutorError::InvalidInstructionSet(format!(
                    "instruction {} declares gas limits that overflow",
                    self.id
                ))
            })
    }
}

/// The full set of instructions a user wants executed as one supertransaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionSet {
    /// Account the instructions act for; bridge transfers are delivered here
    pub owner: Address,
    pub instructions: Vec<Instruction>,
}

impl InstructionSet {
    pub fn new(owner: Address, instructions: Vec<Instruction>) -> Self {
        Self { owner, instructions }
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.instructions.iter().position(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_and_gas_totals() {
        let instruction = Instruction::new(
            "swap",
            10,
            vec![
                Call::new(Address::zero(), vec![0x01], 50_000),
                Call::new(Address::zero(), vec![0x02], 70_000),
            ],
        )
        .produces(ResourceAmount::new("USDC", 100u64))
        .produces(ResourceAmount::new("USDC", 50u64))
        .produces(ResourceAmount::new("WETH", 1u64));

        assert_eq!(instruction.output_of(&TokenId::from("USDC")).unwrap(), U256::from(150u64));
        assert_eq!(instruction.output_of(&TokenId::from("DAI")).unwrap(), U256::zero());
        assert_eq!(instruction.total_gas().unwrap(), U256::from(120_000u64));
    }

    #[test]
    fn test_overflowing_totals_are_rejected() {
        let mut huge = Call::new(Address::zero(), vec![0x01], 0);
        huge.gas_limit = U256::MAX;
        let calls = vec![huge, Call::new(Address::zero(), vec![], 1)];
        let instruction = Instruction::new("huge", 10, calls)
            .produces(ResourceAmount::new("USDC", U256::MAX))
            .produces(ResourceAmount::new("USDC", 1u64));

        assert!(matches!(
            instruction.total_gas(),
            Err(ExecutorError::InvalidInstructionSet(_))
        ));
        assert!(matches!(
            instruction.output_of(&TokenId::from("USDC")),
            Err(ExecutorError::InvalidInstructionSet(_))
        ));
    }

    #[test]
    fn test_deserialize_instruction() {
        let json = r#"{
            "id": "deposit",
            "chain_id": 8453,
            "calls": [{"to": "0x0000000000000000000000000000000000000001", "gas_limit": "0x186a0"}],
            "requires": {"token": "USDC", "min_amount": "0x493e0"}
        }"#;
        let instruction: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(instruction.calls[0].gas_limit, U256::from(100_000u64));
        assert_eq!(instruction.calls[0].value, U256::zero());
        let requirement = instruction.requires.unwrap();
        assert_eq!(requirement.min_amount, U256::from(300_000u64));
        assert!(requirement.from.is_none());
        assert!(instruction.produces.is_empty());
    }
}
