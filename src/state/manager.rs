//! PostgreSQL state manager

use super::RunArchive;
use crate::config::DatabaseConfig;
use crate::coordination::ExecutionRun;
use crate::error::{ExecutorError, ExecutorResult};
use crate::monitor::RunEvent;
use crate::planner::ExecutionPlan;

use async_trait::async_trait;
use ethers::types::H256;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> ExecutorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> ExecutorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_plans (
                plan_hash VARCHAR(66) PRIMARY KEY,
                owner VARCHAR(42) NOT NULL,
                node_count INTEGER NOT NULL,
                fee_chain BIGINT NOT NULL,
                fee_token VARCHAR(32) NOT NULL,
                fee_amount VARCHAR(78) NOT NULL,
                plan JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_runs (
                run_id UUID PRIMARY KEY,
                plan_hash VARCHAR(66) NOT NULL,
                state VARCHAR(20) NOT NULL,
                snapshot JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_plan_hash
            ON execution_runs (plan_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_events (
                id BIGSERIAL PRIMARY KEY,
                run_id UUID NOT NULL,
                sequence BIGINT NOT NULL,
                event_type VARCHAR(32) NOT NULL,
                event_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_run_events_run
            ON run_events (run_id, sequence)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> ExecutorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Count archived runs per state
    pub async fn get_stats(&self) -> ExecutorResult<RunStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'running') as running,
                COUNT(*) FILTER (WHERE state = 'confirmed') as confirmed,
                COUNT(*) FILTER (WHERE state = 'failed') as failed,
                COUNT(*) FILTER (WHERE state = 'cancelled') as cancelled
            FROM execution_runs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RunStats {
            running: row.get::<i64, _>("running") as u64,
            confirmed: row.get::<i64, _>("confirmed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            cancelled: row.get::<i64, _>("cancelled") as u64,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> ExecutorResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| ExecutorError::Internal(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> ExecutorResult<T> {
    serde_json::from_value(value).map_err(|e| ExecutorError::Internal(e.to_string()))
}

#[async_trait]
impl RunArchive for StateManager {
    async fn store_plan(&self, plan: &ExecutionPlan) -> ExecutorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_plans
                (plan_hash, owner, node_count, fee_chain, fee_token, fee_amount, plan)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (plan_hash) DO NOTHING
            "#,
        )
        .bind(format!("{:?}", plan.hash))
        .bind(format!("{:?}", plan.owner))
        .bind(plan.nodes.len() as i32)
        .bind(plan.fee.chain_id as i64)
        .bind(plan.fee.token.as_str())
        .bind(plan.fee.amount.to_string())
        .bind(to_json(plan)?)
        .execute(&self.pool)
        .await?;

        debug!("Archived plan {:?}", plan.hash);
        Ok(())
    }

    async fn load_plan(&self, hash: H256) -> ExecutorResult<Option<ExecutionPlan>> {
        let row = sqlx::query("SELECT plan FROM execution_plans WHERE plan_hash = $1")
            .bind(format!("{:?}", hash))
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| from_json(r.get("plan"))).transpose()
    }

    async fn store_run(&self, run: &ExecutionRun) -> ExecutorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_runs (run_id, plan_hash, state, snapshot)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id)
            DO UPDATE SET state = $3, snapshot = $4, updated_at = NOW()
            "#,
        )
        .bind(run.id)
        .bind(format!("{:?}", run.plan_hash))
        .bind(run.state.as_str())
        .bind(to_json(run)?)
        .execute(&self.pool)
        .await?;

        debug!("Archived run {} in state {}", run.id, run.state);
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> ExecutorResult<Option<ExecutionRun>> {
        let row = sqlx::query("SELECT snapshot FROM execution_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| from_json(r.get("snapshot"))).transpose()
    }

    async fn store_event(&self, event: &RunEvent) -> ExecutorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO run_events (run_id, sequence, event_type, event_data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.run_id)
        .bind(event.sequence as i64)
        .bind(event.name())
        .bind(to_json(event)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Archived run statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunStats {
    pub running: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub cancelled: u64,
}
