//! Runtime state of a plan being executed

use crate::config::FailurePolicy;
use crate::error::{ExecutorError, ExecutorResult};
use crate::planner::ExecutionPlan;
use crate::registry::{ChainId, TokenId};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Per-node state; moves forward only, Confirmed and Failed are absorbing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Submitted,
    AwaitingConfirmation,
    AwaitingBridge,
    Confirmed,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Submitted => "submitted",
            NodeState::AwaitingConfirmation => "awaiting_confirmation",
            NodeState::AwaitingBridge => "awaiting_bridge",
            NodeState::Confirmed => "confirmed",
            NodeState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Confirmed | NodeState::Failed)
    }

    pub fn can_transition_to(&self, next: NodeState) -> bool {
        match (self, next) {
            (NodeState::Confirmed | NodeState::Failed, _) => false,
            (_, NodeState::Failed) => true,
            (NodeState::Pending, NodeState::Submitted)
            | (NodeState::Submitted, NodeState::AwaitingConfirmation)
            | (NodeState::Submitted, NodeState::AwaitingBridge)
            | (NodeState::AwaitingConfirmation, NodeState::Confirmed)
            | (NodeState::AwaitingBridge, NodeState::Confirmed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Confirmed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Confirmed => "confirmed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Confirmed | RunState::Failed | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    DispatchRejected,
    Reverted,
    FinalityTimeout,
    BridgeTimeout,
    BridgeFailed,
    Reorg,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::DispatchRejected => "dispatch_rejected",
            FailureCode::Reverted => "reverted",
            FailureCode::FinalityTimeout => "finality_timeout",
            FailureCode::BridgeTimeout => "bridge_timeout",
            FailureCode::BridgeFailed => "bridge_failed",
            FailureCode::Reorg => "reorg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: FailureCode,
    pub message: String,
}

impl FailureReason {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Evidence of dispatch for a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeReceipt {
    Transaction {
        chain_id: ChainId,
        tx_hash: H256,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block_number: Option<u64>,
    },
    Bridge {
        route_id: String,
        transfer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_tx: Option<H256>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub kind: String,
    pub chain_id: ChainId,
    pub state: NodeState,
    pub depends_on: Vec<usize>,
    pub attempts: u32,
    pub receipt: Option<NodeReceipt>,
    pub failure: Option<FailureReason>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Collection of the plan's fee; nodes wait until it is Confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeRecord {
    pub chain_id: ChainId,
    pub token: TokenId,
    pub amount: U256,
    pub state: NodeState,
    pub receipt: Option<NodeReceipt>,
    pub failure: Option<FailureReason>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl FeeRecord {
    /// Whether a fee transaction may already have been sent
    pub fn started(&self) -> bool {
        self.submitted_at.is_some()
    }
}

/// Final outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub plan_hash: H256,
    pub state: RunState,
    pub confirmed: Vec<String>,
    pub failed: Vec<FailedNode>,
    pub never_submitted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_failure: Option<FailureReason>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedNode {
    pub node: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub plan_hash: H256,
    pub owner: Address,
    pub state: RunState,
    pub fee: FeeRecord,
    pub nodes: Vec<NodeRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRun {
    pub fn new(id: Uuid, plan: &ExecutionPlan) -> Self {
        let nodes = plan
            .nodes
            .iter()
            .map(|node| NodeRecord {
                id: node.id.clone(),
                kind: node.kind_label().to_string(),
                chain_id: node.chain_id(),
                state: NodeState::Pending,
                depends_on: node.depends_on.clone(),
                attempts: 0,
                receipt: None,
                failure: None,
                submitted_at: None,
                confirmed_at: None,
                failed_at: None,
            })
            .collect();

        // Nothing to collect for a zero fee
        let fee_state = if plan.fee.amount.is_zero() {
            NodeState::Confirmed
        } else {
            NodeState::Pending
        };

        Self {
            id,
            plan_hash: plan.hash,
            owner: plan.owner,
            state: RunState::Pending,
            fee: FeeRecord {
                chain_id: plan.fee.chain_id,
                token: plan.fee.token.clone(),
                amount: plan.fee.amount,
                state: fee_state,
                receipt: None,
                failure: None,
                submitted_at: None,
            },
            nodes,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn node(&self, index: usize) -> ExecutorResult<&NodeRecord> {
        self.nodes
            .get(index)
            .ok_or_else(|| {
                ExecutorError::Internal(format!("run {} has no node {}", self.id, index))
            })
    }

    fn node_mut(&mut self, index: usize) -> ExecutorResult<&mut NodeRecord> {
        let id = self.id;
        self.nodes
            .get_mut(index)
            .ok_or_else(|| ExecutorError::Internal(format!("run {} has no node {}", id, index)))
    }

    /// Move a node forward along the state lattice; returns the previous state
    pub fn transition(&mut self, index: usize, next: NodeState) -> ExecutorResult<NodeState> {
        let node = self.node_mut(index)?;
        let previous = node.state;
        if !previous.can_transition_to(next) {
            return Err(ExecutorError::InvalidStateTransition {
                from: previous.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            NodeState::Submitted => {
                node.submitted_at = Some(now);
                node.attempts += 1;
            }
            NodeState::Confirmed => node.confirmed_at = Some(now),
            NodeState::Failed => node.failed_at = Some(now),
            _ => {}
        }
        node.state = next;
        Ok(previous)
    }

    pub fn fail(&mut self, index: usize, reason: FailureReason) -> ExecutorResult<NodeState> {
        let previous = self.transition(index, NodeState::Failed)?;
        self.node_mut(index)?.failure = Some(reason);
        Ok(previous)
    }

    pub fn set_receipt(&mut self, index: usize, receipt: NodeReceipt) -> ExecutorResult<()> {
        self.node_mut(index)?.receipt = Some(receipt);
        Ok(())
    }

    /// Move the fee forward along the node lattice; returns the previous state
    pub fn transition_fee(&mut self, next: NodeState) -> ExecutorResult<NodeState> {
        let previous = self.fee.state;
        if !previous.can_transition_to(next) {
            return Err(ExecutorError::InvalidStateTransition {
                from: previous.to_string(),
                to: next.to_string(),
            });
        }
        if next == NodeState::Submitted {
            self.fee.submitted_at = Some(Utc::now());
        }
        self.fee.state = next;
        Ok(previous)
    }

    pub fn fail_fee(&mut self, reason: FailureReason) -> ExecutorResult<NodeState> {
        let previous = self.transition_fee(NodeState::Failed)?;
        self.fee.failure = Some(reason);
        Ok(previous)
    }

    /// No node submitted and no fee transaction sent
    pub fn all_pending(&self) -> bool {
        !self.fee.started() && self.nodes.iter().all(|n| n.state == NodeState::Pending)
    }

    pub fn all_confirmed(&self) -> bool {
        self.fee.state == NodeState::Confirmed
            && self.nodes.iter().all(|n| n.state == NodeState::Confirmed)
    }

    /// Whether new submissions are allowed under the failure policy
    pub fn accepts_submissions(&self, policy: FailurePolicy) -> bool {
        match self.state {
            RunState::Running => true,
            RunState::Failed => policy == FailurePolicy::ContinueIndependent,
            _ => false,
        }
    }

    /// Pending nodes whose dependencies are all Confirmed, in plan order;
    /// none until the fee is collected
    pub fn ready_nodes(&self) -> Vec<usize> {
        if self.fee.state != NodeState::Confirmed {
            return Vec::new();
        }
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.state == NodeState::Pending)
            .filter(|(_, node)| {
                node.depends_on.iter().all(|d| {
                    self.nodes
                        .get(*d)
                        .map(|dep| dep.state == NodeState::Confirmed)
                        .unwrap_or(false)
                })
            })
            .map(|(index, _)| index)
            .collect()
    }

    pub fn report(&self) -> RunReport {
        let mut confirmed = Vec::new();
        let mut failed = Vec::new();
        let mut never_submitted = Vec::new();

        for node in &self.nodes {
            match node.state {
                NodeState::Confirmed => confirmed.push(node.id.clone()),
                NodeState::Failed => failed.push(FailedNode {
                    node: node.id.clone(),
                    reason: node.failure.clone().unwrap_or_else(|| {
                        FailureReason::new(FailureCode::DispatchRejected, "unknown")
                    }),
                }),
                NodeState::Pending => never_submitted.push(node.id.clone()),
                _ => {}
            }
        }

        RunReport {
            run_id: self.id,
            plan_hash: self.plan_hash,
            state: self.state,
            confirmed,
            failed,
            never_submitted,
            fee_failure: self.fee.failure.clone(),
            finished_at: self.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::planner::{FeeInstruction, NodeKind, PlanNode};
    use crate::registry::TokenId;
    use ethers::types::U256;

    fn run(depends: &[&[usize]]) -> ExecutionRun {
        run_with_fee(depends, 0)
    }

    fn run_with_fee(depends: &[&[usize]], fee: u64) -> ExecutionRun {
        let nodes = depends
            .iter()
            .enumerate()
            .map(|(i, deps)| PlanNode {
                id: format!("n{}", i),
                kind: NodeKind::Instruction(Instruction::new(format!("n{}", i), 10, vec![])),
                depends_on: deps.to_vec(),
            })
            .collect();
        let plan = ExecutionPlan::new(
            Address::zero(),
            nodes,
            FeeInstruction {
                chain_id: 10,
                token: TokenId::from("USDC"),
                amount: U256::from(fee),
            },
        );
        ExecutionRun::new(Uuid::new_v4(), &plan)
    }

    #[test]
    fn test_state_lattice_is_monotonic() {
        use NodeState::*;
        assert!(Pending.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(AwaitingBridge));
        assert!(AwaitingConfirmation.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Submitted.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Submitted));
    }

    #[test]
    fn test_transition_rejects_backward_moves() {
        let mut run = run(&[&[]]);
        run.transition(0, NodeState::Submitted).unwrap();
        assert_eq!(run.nodes[0].attempts, 1);
        assert!(run.nodes[0].submitted_at.is_some());

        let err = run.transition(0, NodeState::Pending).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_ready_nodes_follow_dependencies() {
        let mut run = run(&[&[], &[0], &[], &[1, 2]]);
        assert_eq!(run.ready_nodes(), vec![0, 2]);

        run.transition(0, NodeState::Submitted).unwrap();
        run.transition(0, NodeState::AwaitingConfirmation).unwrap();
        assert_eq!(run.ready_nodes(), vec![2]);

        run.transition(0, NodeState::Confirmed).unwrap();
        assert_eq!(run.ready_nodes(), vec![1, 2]);
    }

    #[test]
    fn test_failure_policy_and_report() {
        let mut run = run(&[&[], &[0], &[1], &[]]);
        run.state = RunState::Failed;
        run.fail(0, FailureReason::new(FailureCode::DispatchRejected, "nonce too low"))
            .unwrap();

        assert!(run.accepts_submissions(FailurePolicy::ContinueIndependent));
        assert!(!run.accepts_submissions(FailurePolicy::Halt));
        assert_eq!(run.ready_nodes(), vec![3]);

        let report = run.report();
        assert_eq!(report.failed[0].node, "n0");
        assert_eq!(report.failed[0].reason.code, FailureCode::DispatchRejected);
        assert_eq!(report.never_submitted, vec!["n1", "n2", "n3"]);
        assert!(report.fee_failure.is_none());
    }

    #[test]
    fn test_nodes_wait_for_fee() {
        let mut run = run_with_fee(&[&[], &[0]], 2_400);
        assert_eq!(run.fee.state, NodeState::Pending);
        assert!(run.ready_nodes().is_empty());
        assert!(run.all_pending());

        run.transition_fee(NodeState::Submitted).unwrap();
        assert!(run.fee.started());
        assert!(!run.all_pending());
        assert!(run.ready_nodes().is_empty());

        run.transition_fee(NodeState::AwaitingConfirmation).unwrap();
        run.transition_fee(NodeState::Confirmed).unwrap();
        assert_eq!(run.ready_nodes(), vec![0]);
        assert!(run.transition_fee(NodeState::Failed).is_err());
    }

    #[test]
    fn test_failed_fee_blocks_every_node() {
        let mut run = run_with_fee(&[&[], &[]], 1);
        run.transition_fee(NodeState::Submitted).unwrap();
        run.fail_fee(FailureReason::new(FailureCode::Reverted, "transfer amount exceeds balance"))
            .unwrap();

        assert!(run.ready_nodes().is_empty());
        assert!(!run.all_confirmed());
        let report = run.report();
        assert_eq!(report.never_submitted, vec!["n0", "n1"]);
        assert_eq!(report.fee_failure.unwrap().code, FailureCode::Reverted);
    }

    #[test]
    fn test_zero_fee_needs_no_collection() {
        let run = run(&[&[]]);
        assert_eq!(run.fee.state, NodeState::Confirmed);
        assert!(!run.fee.started());
        assert!(run.all_pending());
        assert_eq!(run.ready_nodes(), vec![0]);
    }
}
