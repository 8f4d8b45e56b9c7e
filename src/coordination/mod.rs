//! Execution coordination for signed plans
//!
//! The coordinator:
//! 1. Verifies the signature against the recomputed plan hash and checks
//!    that this executor issued the plan
//! 2. Collects the fee, then submits nodes once every node they depend on
//!    is Confirmed
//! 3. Waits for chain finality and bridge settlement with bounded deadlines
//! 4. Settles the run and reports exactly which nodes confirmed

mod dispatch;
mod engine;
mod run;
mod signature;

pub use dispatch::{
    BridgeProvider, BridgeTransfer, ChainDispatcher, DispatchReceipt, Dispatchers, Inclusion,
    PlanAuthorization, Settlement,
};
pub use engine::{Coordinator, CoordinatorConfig};
pub use run::{
    ExecutionRun, FailedNode, FailureCode, FailureReason, FeeRecord, NodeReceipt, NodeRecord,
    NodeState, RunReport, RunState,
};
pub use signature::{OwnerSignatureVerifier, SignatureVerifier, SignedPlan};
