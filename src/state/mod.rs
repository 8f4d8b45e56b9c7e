//! Run archive with PostgreSQL persistence
//!
//! Handles:
//! - Quoted plans, keyed by hash
//! - Run snapshots, written on start and when a run settles
//! - Run event log

mod manager;

pub use manager::{RunStats, StateManager};

use crate::coordination::ExecutionRun;
use crate::error::ExecutorResult;
use crate::monitor::RunEvent;
use crate::planner::ExecutionPlan;

use async_trait::async_trait;
use ethers::types::H256;
use uuid::Uuid;

/// Durable storage for plans and runs that outlive their in-memory slot
#[async_trait]
pub trait RunArchive: Send + Sync {
    async fn store_plan(&self, plan: &ExecutionPlan) -> ExecutorResult<()>;

    async fn load_plan(&self, hash: H256) -> ExecutorResult<Option<ExecutionPlan>>;

    /// Insert or replace the run snapshot
    async fn store_run(&self, run: &ExecutionRun) -> ExecutorResult<()>;

    async fn load_run(&self, run_id: Uuid) -> ExecutorResult<Option<ExecutionRun>>;

    async fn store_event(&self, event: &RunEvent) -> ExecutorResult<()>;
}
